// -------------------------------------------------------------------------------------------------
//  Copyright (C) 2026 Comms Fabric Contributors. All rights reserved.
//
//  Licensed under the GNU Lesser General Public License Version 3.0 (the "License");
//  You may not use this file except in compliance with the License.
//  You may obtain a copy of the License at https://www.gnu.org/licenses/lgpl-3.0.en.html
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.
// -------------------------------------------------------------------------------------------------

//! The Tool Execution Manager (C6).
//!
//! Grounded field-for-field on `tool_message_handlers.py`'s
//! `ToolExecutionManager`: the duplicate/not-found checks on admission, the
//! `min(2^retry_count, 30)` backoff, timeout racing via the executor future,
//! and the cancel-everything shutdown sequence are all carried over as-is.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::{mapref::entry::Entry, DashMap};
use fabric_common::{Envelope, FabricError, FabricErrorCode, ToolExecution, ToolExecutionStatus, ToolManagerConfig};
use serde_json::Value;
use tokio::{sync::Mutex as AsyncMutex, task::JoinHandle};

/// An installable tool implementation. `execute` runs to completion or is
/// raced against `context.timeout` / `default_timeout_secs` by the manager;
/// implementations do not need to handle their own timeouts.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, parameters: Value) -> anyhow::Result<Value>;
}

/// A boxed closure fans a finished `tool_result` out to the `tools` topic.
/// Supplied by whoever owns the broker (kept generic here so this crate has
/// no dependency on `fabric-broker`).
pub type PublishFn = Arc<dyn Fn(Envelope) + Send + Sync>;

struct ActiveExecution {
    record: ToolExecution,
    task: Option<JoinHandle<()>>,
}

/// Owns every in-flight tool invocation, keyed by `execution_id`
/// Cheaply cloned via `Arc` so the cleanup task and
/// every `run_execution` task can hold a handle back to their manager.
pub struct ToolExecutionManager {
    config: ToolManagerConfig,
    active: DashMap<String, ActiveExecution>,
    executors: DashMap<String, Arc<dyn ToolExecutor>>,
    publish: PublishFn,
    cleanup_task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl ToolExecutionManager {
    pub fn new(config: ToolManagerConfig, publish: PublishFn) -> Arc<Self> {
        Arc::new(Self {
            config,
            active: DashMap::new(),
            executors: DashMap::new(),
            publish,
            cleanup_task: AsyncMutex::new(None),
        })
    }

    /// Installs (or replaces) the executor backing `tool_name`.
    pub fn register_executor(&self, tool_name: impl Into<String>, executor: Arc<dyn ToolExecutor>) {
        let tool_name = tool_name.into();
        log::info!("registered tool executor: {tool_name}");
        self.executors.insert(tool_name, executor);
    }

    pub fn is_registered(&self, tool_name: &str) -> bool {
        self.executors.contains_key(tool_name)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Starts the periodic cleanup sweep; idempotent across process restarts
    /// but not meant to be called twice on the same manager.
    pub fn start(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move { manager.cleanup_loop().await });
        if let Ok(mut slot) = self.cleanup_task.try_lock() {
            *slot = Some(handle);
        }
    }

    /// Aborts the cleanup sweep and cancels every active execution, in that
    /// order, matching the original's shutdown sequence.
    pub async fn shutdown(self: &Arc<Self>) {
        if let Some(handle) = self.cleanup_task.lock().await.take() {
            handle.abort();
        }
        let ids: Vec<String> = self.active.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.cancel_execution(&id, "Manager shutdown");
        }
    }

    /// Admits a validated `tool_call` envelope (duplicate-id and
    /// unknown-tool checks happen here; schema validation is the router's
    /// job before this is ever called).
    pub fn handle_tool_call(self: &Arc<Self>, envelope: &Envelope) {
        let Some(execution_id) = envelope.field("execution_id").and_then(Value::as_str) else {
            log::warn!("tool_call missing execution_id after schema validation, dropping");
            return;
        };
        let execution_id = execution_id.to_string();
        let tool_name = envelope
            .field("tool_name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let source = envelope.source.clone().unwrap_or_default();
        let parameters = envelope.field("parameters").cloned().unwrap_or(Value::Null);
        let correlation_id = envelope.correlation_id.clone();
        let workflow_id = envelope.workflow_id.clone();

        if !self.executors.contains_key(&tool_name) {
            self.publish_terminal(
                &execution_id,
                &tool_name,
                &source,
                correlation_id,
                workflow_id,
                ToolExecutionStatus::Error,
                None,
                Some(FabricErrorCode::ToolNotFound(tool_name.clone()).into()),
            );
            return;
        }

        let context = envelope.field("context");
        let timeout_seconds = context
            .and_then(|c| c.get("timeout"))
            .and_then(Value::as_f64)
            .unwrap_or(self.config.default_timeout_secs);
        let initial_retry_count = context
            .and_then(|c| c.get("retry_count"))
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;

        let record = ToolExecution {
            execution_id: execution_id.clone(),
            tool_name: tool_name.clone(),
            source,
            parameters,
            status: ToolExecutionStatus::Pending,
            start_time: Utc::now(),
            timeout_seconds,
            retry_count: initial_retry_count,
            max_retries: self.config.max_retries,
            correlation_id,
            workflow_id,
            result: None,
            error: None,
        };

        // Atomic check-and-insert: two racing calls with the same execution_id
        // must not both observe an empty slot and both win admission.
        match self.active.entry(execution_id.clone()) {
            Entry::Occupied(_) => {
                self.publish_terminal(
                    &execution_id,
                    &record.tool_name,
                    &record.source,
                    record.correlation_id,
                    record.workflow_id,
                    ToolExecutionStatus::Error,
                    None,
                    Some(FabricErrorCode::DuplicateExecution(execution_id.clone()).into()),
                );
                return;
            }
            Entry::Vacant(entry) => {
                entry.insert(ActiveExecution { record, task: None });
            }
        }

        let manager = Arc::clone(self);
        let id_for_task = execution_id.clone();
        let handle = tokio::spawn(async move { manager.run_execution(id_for_task).await });
        if let Some(mut entry) = self.active.get_mut(&execution_id) {
            entry.task = Some(handle);
        }
    }

    /// Applies an inbound `tool_result` against a tracked execution (the
    /// case where the call was dispatched to an external executor and the
    /// answer arrives back over the wire rather than from a local
    /// [`ToolExecutor`]). Results for unknown `execution_id`s are logged and
    /// discarded; they may correspond to pre-restart executions.
    pub fn handle_tool_result(&self, envelope: &Envelope) {
        let Some(execution_id) = envelope.field("execution_id").and_then(Value::as_str) else {
            return;
        };
        match self.active.remove(execution_id) {
            Some((_, mut active)) => {
                if let Some(handle) = active.task.take() {
                    handle.abort();
                }
                active.record.result = envelope.field("result").cloned();
                log::info!("forwarded tool_result accepted for execution {execution_id}");
                (self.publish)(envelope.clone());
            }
            None => {
                log::debug!("tool_result for unknown execution '{execution_id}' discarded");
            }
        }
    }

    /// Cancels a tracked execution, publishing a `status: cancelled`
    /// terminal result. Returns `false` if the execution was not active
    /// (already delivered or never existed).
    pub fn cancel_execution(&self, execution_id: &str, reason: &str) -> bool {
        let Some((_, mut active)) = self.active.remove(execution_id) else {
            return false;
        };
        if let Some(handle) = active.task.take() {
            handle.abort();
        }
        self.publish_terminal(
            execution_id,
            &active.record.tool_name,
            &active.record.source,
            active.record.correlation_id.clone(),
            active.record.workflow_id.clone(),
            ToolExecutionStatus::Cancelled,
            None,
            Some(FabricErrorCode::Cancelled(reason.to_string()).into()),
        );
        true
    }

    async fn run_execution(self: Arc<Self>, execution_id: String) {
        loop {
            let Some((tool_name, parameters, timeout_seconds, retry_count, max_retries)) =
                self.active.get(&execution_id).map(|e| {
                    (
                        e.record.tool_name.clone(),
                        e.record.parameters.clone(),
                        e.record.timeout_seconds,
                        e.record.retry_count,
                        e.record.max_retries,
                    )
                })
            else {
                return;
            };

            let Some(executor) = self.executors.get(&tool_name).map(|e| Arc::clone(e.value())) else {
                self.deliver_error(&execution_id, FabricErrorCode::ToolNotFound(tool_name));
                return;
            };

            if let Some(mut entry) = self.active.get_mut(&execution_id) {
                entry.record.status = ToolExecutionStatus::Running;
            }

            let outcome = tokio::time::timeout(
                Duration::from_secs_f64(timeout_seconds.max(0.001)),
                executor.execute(parameters),
            )
            .await;

            match outcome {
                Ok(Ok(value)) => {
                    self.deliver_success(&execution_id, value);
                    return;
                }
                Ok(Err(err)) => {
                    if retry_count < max_retries {
                        if let Some(mut entry) = self.active.get_mut(&execution_id) {
                            entry.record.retry_count += 1;
                        }
                        let backoff = 2f64.powi(retry_count as i32).min(30.0);
                        log::warn!(
                            "tool execution {execution_id} failed (attempt {retry_count}), retrying in {backoff}s: {err:#}"
                        );
                        tokio::time::sleep(Duration::from_secs_f64(backoff)).await;
                        continue;
                    }
                    self.deliver_error(&execution_id, FabricErrorCode::ExecutionFailed(err.to_string()));
                    return;
                }
                Err(_elapsed) => {
                    self.deliver_timeout(&execution_id);
                    return;
                }
            }
        }
    }

    fn deliver_success(&self, execution_id: &str, value: Value) {
        if let Some((_, active)) = self.active.remove(execution_id) {
            self.publish_terminal(
                execution_id,
                &active.record.tool_name,
                &active.record.source,
                active.record.correlation_id,
                active.record.workflow_id,
                ToolExecutionStatus::Success,
                Some(value),
                None,
            );
        }
    }

    fn deliver_error(&self, execution_id: &str, code: FabricErrorCode) {
        if let Some((_, active)) = self.active.remove(execution_id) {
            self.publish_terminal(
                execution_id,
                &active.record.tool_name,
                &active.record.source,
                active.record.correlation_id,
                active.record.workflow_id,
                ToolExecutionStatus::Error,
                None,
                Some(code.into()),
            );
        }
    }

    fn deliver_timeout(&self, execution_id: &str) {
        if let Some((_, active)) = self.active.remove(execution_id) {
            self.publish_terminal(
                execution_id,
                &active.record.tool_name,
                &active.record.source,
                active.record.correlation_id,
                active.record.workflow_id,
                ToolExecutionStatus::Timeout,
                None,
                Some(FabricErrorCode::Timeout.into()),
            );
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn publish_terminal(
        &self,
        execution_id: &str,
        tool_name: &str,
        source: &str,
        correlation_id: Option<String>,
        workflow_id: Option<String>,
        status: ToolExecutionStatus,
        result: Option<Value>,
        error: Option<FabricError>,
    ) {
        let mut envelope = Envelope::new("tool_result")
            .with_source("tool_execution_manager")
            .with_field("execution_id", Value::from(execution_id))
            .with_field("tool_name", Value::from(tool_name))
            .with_field("status", Value::from(status.to_string()))
            .with_field("target", Value::from(source));
        if let Some(result) = result {
            envelope = envelope.with_field("result", result);
        }
        if let Some(error) = error {
            envelope = envelope.with_field("error", serde_json::to_value(error).unwrap_or(Value::Null));
        }
        envelope.correlation_id = correlation_id;
        envelope.workflow_id = workflow_id;
        (self.publish)(envelope);
    }

    async fn cleanup_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs_f64(self.config.cleanup_interval_secs.max(0.1)));
        ticker.tick().await; // first tick fires immediately; consume it before sweeping
        loop {
            ticker.tick().await;
            let now = Utc::now();
            let stale: Vec<String> = self
                .active
                .iter()
                .filter(|entry| {
                    let elapsed_secs = (now - entry.record.start_time).num_milliseconds() as f64 / 1000.0;
                    elapsed_secs > entry.record.timeout_seconds
                })
                .map(|entry| entry.key().clone())
                .collect();
            for id in stale {
                log::warn!("cleanup sweep reaping stale execution {id}");
                self.cancel_execution(&id, "stale execution reaped by cleanup sweep");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;

    struct EchoExecutor;

    #[async_trait]
    impl ToolExecutor for EchoExecutor {
        async fn execute(&self, parameters: Value) -> anyhow::Result<Value> {
            Ok(parameters)
        }
    }

    struct AlwaysFailsExecutor;

    #[async_trait]
    impl ToolExecutor for AlwaysFailsExecutor {
        async fn execute(&self, _parameters: Value) -> anyhow::Result<Value> {
            anyhow::bail!("boom")
        }
    }

    struct SucceedsOnThirdTryExecutor {
        attempts: Mutex<u32>,
    }

    #[async_trait]
    impl ToolExecutor for SucceedsOnThirdTryExecutor {
        async fn execute(&self, parameters: Value) -> anyhow::Result<Value> {
            let mut attempts = self.attempts.lock().unwrap();
            *attempts += 1;
            if *attempts >= 3 {
                Ok(parameters)
            } else {
                anyhow::bail!("not yet")
            }
        }
    }

    fn sink() -> (PublishFn, Arc<Mutex<Vec<Envelope>>>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let handle = Arc::clone(&received);
        let publish: PublishFn = Arc::new(move |env| handle.lock().unwrap().push(env));
        (publish, received)
    }

    fn tool_call(execution_id: &str, tool_name: &str) -> Envelope {
        Envelope::new("tool_call")
            .with_source("ui")
            .with_field("execution_id", Value::from(execution_id))
            .with_field("tool_name", Value::from(tool_name))
            .with_field("parameters", json!({"x": 1}))
    }

    #[tokio::test]
    async fn successful_execution_delivers_exactly_one_terminal_result() {
        let (publish, received) = sink();
        let manager = ToolExecutionManager::new(ToolManagerConfig::default(), publish);
        manager.register_executor("echo", Arc::new(EchoExecutor));

        manager.handle_tool_call(&tool_call("e1", "echo"));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let envelopes = received.lock().unwrap();
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].field("status").unwrap(), "success");
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn duplicate_execution_id_is_rejected_without_touching_original() {
        let (publish, received) = sink();
        let manager = ToolExecutionManager::new(ToolManagerConfig::default(), publish);
        manager.register_executor("echo", Arc::new(EchoExecutor));

        manager.handle_tool_call(&tool_call("dup", "echo"));
        manager.handle_tool_call(&tool_call("dup", "echo"));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let envelopes = received.lock().unwrap();
        assert!(envelopes
            .iter()
            .any(|e| e.field("error").map(|v| v["code"] == "DUPLICATE_EXECUTION").unwrap_or(false)));
    }

    #[tokio::test]
    async fn concurrent_duplicate_submissions_admit_exactly_one_execution() {
        let (publish, received) = sink();
        let manager = ToolExecutionManager::new(ToolManagerConfig::default(), publish);
        manager.register_executor("echo", Arc::new(EchoExecutor));

        let m1 = Arc::clone(&manager);
        let m2 = Arc::clone(&manager);
        let t1 = tokio::spawn(async move { m1.handle_tool_call(&tool_call("race", "echo")) });
        let t2 = tokio::spawn(async move { m2.handle_tool_call(&tool_call("race", "echo")) });
        let _ = tokio::join!(t1, t2);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let envelopes = received.lock().unwrap();
        let duplicate_errors = envelopes
            .iter()
            .filter(|e| e.field("error").map(|v| v["code"] == "DUPLICATE_EXECUTION").unwrap_or(false))
            .count();
        let successes = envelopes.iter().filter(|e| e.field("status").unwrap() == "success").count();
        assert_eq!(duplicate_errors, 1, "exactly one of the two racing calls must be rejected");
        assert_eq!(successes, 1, "exactly one execution must have been admitted and run");
    }

    #[tokio::test]
    async fn unknown_tool_name_yields_tool_not_found() {
        let (publish, received) = sink();
        let manager = ToolExecutionManager::new(ToolManagerConfig::default(), publish);

        manager.handle_tool_call(&tool_call("e2", "does_not_exist"));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let envelopes = received.lock().unwrap();
        assert_eq!(envelopes[0].field("error").unwrap()["code"], "TOOL_NOT_FOUND");
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_produces_terminal_timeout_status() {
        struct NeverReturnsExecutor;
        #[async_trait]
        impl ToolExecutor for NeverReturnsExecutor {
            async fn execute(&self, _parameters: Value) -> anyhow::Result<Value> {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }

        let (publish, received) = sink();
        let mut config = ToolManagerConfig::default();
        config.default_timeout_secs = 1.0;
        let manager = ToolExecutionManager::new(config, publish);
        manager.register_executor("slow", Arc::new(NeverReturnsExecutor));

        manager.handle_tool_call(&tool_call("e3", "slow"));
        tokio::time::advance(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;

        let envelopes = received.lock().unwrap();
        assert_eq!(envelopes[0].field("status").unwrap(), "timeout");
    }

    #[tokio::test(start_paused = true)]
    async fn retries_with_backoff_then_succeeds() {
        let (publish, received) = sink();
        let mut config = ToolManagerConfig::default();
        config.max_retries = 3;
        let manager = ToolExecutionManager::new(config, publish);
        manager.register_executor(
            "flaky",
            Arc::new(SucceedsOnThirdTryExecutor { attempts: Mutex::new(0) }),
        );

        manager.handle_tool_call(&tool_call("e4", "flaky"));
        tokio::time::advance(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;

        let envelopes = received.lock().unwrap();
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].field("status").unwrap(), "success");
    }

    #[tokio::test]
    async fn exhausted_retries_delivers_execution_failed() {
        let (publish, received) = sink();
        let mut config = ToolManagerConfig::default();
        config.max_retries = 0;
        let manager = ToolExecutionManager::new(config, publish);
        manager.register_executor("always_fails", Arc::new(AlwaysFailsExecutor));

        manager.handle_tool_call(&tool_call("e5", "always_fails"));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let envelopes = received.lock().unwrap();
        assert_eq!(envelopes[0].field("error").unwrap()["code"], "EXECUTION_FAILED");
    }

    #[tokio::test]
    async fn shutdown_cancels_every_active_execution() {
        struct NeverReturnsExecutor;
        #[async_trait]
        impl ToolExecutor for NeverReturnsExecutor {
            async fn execute(&self, _parameters: Value) -> anyhow::Result<Value> {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }

        let (publish, received) = sink();
        let manager = ToolExecutionManager::new(ToolManagerConfig::default(), publish);
        manager.register_executor("slow", Arc::new(NeverReturnsExecutor));
        manager.handle_tool_call(&tool_call("e6", "slow"));
        tokio::task::yield_now().await;

        manager.shutdown().await;

        let envelopes = received.lock().unwrap();
        assert_eq!(envelopes[0].field("status").unwrap(), "cancelled");
        assert_eq!(manager.active_count(), 0);
    }
}
