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

use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use fabric_common::{model::ModuleStatus, now_stamp, Envelope, EngineConfig};
use fabric_loader::ModuleHandle;
use indexmap::IndexMap;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, RwLock};

/// Bookkeeping the Engine keeps about a loaded module alongside its trait
/// object, mirroring the status/error_count/last_error fields of
/// `fabric_common::Module` without re-deriving the whole
/// struct every tick.
struct ManagedModule {
    handle: ModuleHandle,
    status: RwLock<ModuleStatus>,
    error_count: AtomicU32,
    last_error: RwLock<Option<String>>,
}

/// Hosts loaded modules, runs their update loops, publishes negotiation
/// snapshots, and applies inbound control traffic.
pub struct Engine {
    config: EngineConfig,
    modules: IndexMap<String, Arc<ManagedModule>>,
    to_broker: mpsc::UnboundedSender<Envelope>,
}

impl Engine {
    /// Modules are assumed already past `initialize()` (the loader performs
    /// that step and excludes modules that fail it), so every
    /// managed module starts at `status=active`.
    pub fn new(
        config: EngineConfig,
        modules: IndexMap<String, ModuleHandle>,
        to_broker: mpsc::UnboundedSender<Envelope>,
    ) -> Self {
        let modules = modules
            .into_iter()
            .map(|(id, handle)| {
                (
                    id,
                    Arc::new(ManagedModule {
                        handle,
                        status: RwLock::new(ModuleStatus::Active),
                        error_count: AtomicU32::new(0),
                        last_error: RwLock::new(None),
                    }),
                )
            })
            .collect();

        Self {
            config,
            modules,
            to_broker,
        }
    }

    pub fn module_ids(&self) -> Vec<String> {
        self.modules.keys().cloned().collect()
    }

    /// Runs every loaded module's optional `cleanup()` on shutdown.
    /// Failures are logged, not propagated: one misbehaving
    /// module must not stop the rest from tearing down.
    pub async fn cleanup_modules(&self) {
        for (module_id, managed) in &self.modules {
            if let Err(err) = managed.handle.module.cleanup().await {
                log::warn!("module '{module_id}' cleanup failed: {err:#}");
            }
        }
    }

    /// Spawns one task per module's update loop, the publish loop, and the
    /// control-intake loop, returning
    /// their join handles for orderly shutdown.
    pub fn spawn(self: Arc<Self>, from_broker: mpsc::UnboundedReceiver<Envelope>) -> EngineTasks {
        let mut update_tasks = Vec::with_capacity(self.modules.len());
        for (module_id, managed) in &self.modules {
            let module_id = module_id.clone();
            let managed = Arc::clone(managed);
            update_tasks.push(tokio::spawn(module_update_loop(module_id, managed)));
        }

        let publish_task = tokio::spawn(publish_loop(Arc::clone(&self)));
        let control_task = tokio::spawn(control_intake_loop(Arc::clone(&self), from_broker));

        EngineTasks {
            update_tasks,
            publish_task,
            control_task,
        }
    }

    async fn publish_snapshot(&self) {
        let mut data = Map::new();
        for (module_id, managed) in &self.modules {
            let streams = managed.handle.module.streams_snapshot().await;
            let config = managed.handle.module.config_snapshot().await;
            let status = *managed.status.read().await;
            let error_count = managed.error_count.load(Ordering::Relaxed);
            let last_error = managed.last_error.read().await.clone();

            let module_entry = serde_json::json!({
                "module_id": module_id,
                "name": managed.handle.module.name(),
                "status": status,
                "module-update-timestamp": now_stamp(),
                "config": config,
                "streams": streams,
                "error_count": error_count,
                "last_error": last_error,
            });
            data.insert(module_id.clone(), module_entry);
        }

        let envelope = Envelope::new("negotiation")
            .with_field("status", Value::from("active"))
            .with_field("data", Value::Object(data));

        if self.to_broker.send(envelope).is_err() {
            log::warn!("engine publish loop: broker link closed, snapshot dropped");
        }
    }

    async fn apply_control(&self, envelope: &Envelope) {
        let Some(module_id) = envelope.field("module_id").and_then(Value::as_str) else {
            log::warn!("control message missing module_id");
            return;
        };
        let command = envelope
            .field("command")
            .and_then(Value::as_str)
            .unwrap_or_default();

        let response = match self.modules.get(module_id) {
            None => control_response(module_id, "error", Some(format!("unknown module: {module_id}"))),
            Some(managed) => match managed.handle.module.control_module(command).await {
                Ok(()) => control_response(module_id, "success", None),
                Err(err) => {
                    managed.error_count.fetch_add(1, Ordering::Relaxed);
                    *managed.last_error.write().await = Some(err.to_string());
                    control_response(module_id, "error", Some(err.to_string()))
                }
            },
        };

        if self.to_broker.send(response).is_err() {
            log::warn!("engine control loop: broker link closed, response dropped");
        }
    }

    async fn apply_config_update(&self, envelope: &Envelope) {
        let Some(module_id) = envelope.field("module_id").and_then(Value::as_str) else {
            log::warn!("config_update message missing module_id");
            return;
        };
        let config = envelope
            .field("config")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let response = match self.modules.get(module_id) {
            None => config_response(module_id, "error", Some(format!("unknown module: {module_id}"))),
            Some(managed) => match managed.handle.module.update_multiple_configs(config).await {
                Ok(()) => config_response(module_id, "success", None),
                Err(err) => {
                    managed.error_count.fetch_add(1, Ordering::Relaxed);
                    *managed.last_error.write().await = Some(err.to_string());
                    config_response(module_id, "error", Some(err.to_string()))
                }
            },
        };

        if self.to_broker.send(response).is_err() {
            log::warn!("engine control loop: broker link closed, response dropped");
        }
    }
}

fn control_response(module_id: &str, status: &str, error: Option<String>) -> Envelope {
    let mut envelope = Envelope::new("control_response").with_field("module_id", Value::from(module_id));
    envelope = envelope.with_field("status", Value::from(status));
    if let Some(error) = error {
        envelope = envelope.with_field("error", Value::from(error));
    }
    envelope
}

fn config_response(module_id: &str, status: &str, error: Option<String>) -> Envelope {
    let mut envelope = Envelope::new("config_response").with_field("module_id", Value::from(module_id));
    envelope = envelope.with_field("status", Value::from(status));
    if let Some(error) = error {
        envelope = envelope.with_field("error", Value::from(error));
    }
    envelope
}

async fn module_update_loop(module_id: String, managed: Arc<ManagedModule>) {
    loop {
        let result = managed.handle.module.update_streams_forever().await;
        match result {
            Ok(()) => {
                log::info!("module '{module_id}' update loop returned without error, not restarting");
                break;
            }
            Err(err) => {
                managed.error_count.fetch_add(1, Ordering::Relaxed);
                *managed.last_error.write().await = Some(err.to_string());
                *managed.status.write().await = ModuleStatus::Error;
                log::error!("module '{module_id}' update loop errored: {err:#}");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

async fn publish_loop(engine: Arc<Engine>) {
    let period = Duration::from_secs_f64(1.0 / engine.config.publish_rate_hz.max(0.001));
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        engine.publish_snapshot().await;
    }
}

async fn control_intake_loop(engine: Arc<Engine>, mut from_broker: mpsc::UnboundedReceiver<Envelope>) {
    while let Some(envelope) = from_broker.recv().await {
        match envelope.msg_type.as_str() {
            "control" => engine.apply_control(&envelope).await,
            "config_update" => engine.apply_config_update(&envelope).await,
            _ => {
                // Intended for other subscribers.
            }
        }
    }
    log::info!("engine control intake loop ending: broker link closed");
}

/// Join handles for the tasks spawned by [`Engine::spawn`], used to drive
/// orderly shutdown.
pub struct EngineTasks {
    pub update_tasks: Vec<tokio::task::JoinHandle<()>>,
    pub publish_task: tokio::task::JoinHandle<()>,
    pub control_task: tokio::task::JoinHandle<()>,
}

impl EngineTasks {
    pub fn abort_all(&self) {
        for task in &self.update_tasks {
            task.abort();
        }
        self.publish_task.abort();
        self.control_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use fabric_common::{Datatype, Stream, StreamId};
    use fabric_loader::Module;

    use super::*;

    struct CountingModule {
        id: &'static str,
        streams: RwLock<IndexMap<StreamId, Stream>>,
        config: RwLock<Map<String, Value>>,
        controlled: std::sync::atomic::AtomicU32,
        cleaned_up: std::sync::atomic::AtomicU32,
    }

    impl CountingModule {
        fn new(id: &'static str) -> Self {
            let mut streams = IndexMap::new();
            streams.insert(
                "s1".to_string(),
                Stream::new("s1", "Demo", Datatype::Float, Value::from(1.5)),
            );
            Self {
                id,
                streams: RwLock::new(streams),
                config: RwLock::new(Map::new()),
                controlled: std::sync::atomic::AtomicU32::new(0),
                cleaned_up: std::sync::atomic::AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Module for CountingModule {
        fn module_id(&self) -> &str {
            self.id
        }

        async fn streams_snapshot(&self) -> IndexMap<StreamId, Stream> {
            self.streams.read().await.clone()
        }

        async fn config_snapshot(&self) -> Map<String, Value> {
            self.config.read().await.clone()
        }

        async fn update_streams_forever(&self) -> anyhow::Result<()> {
            // A real module would loop forever; tests want the task to
            // settle once it has produced a single value.
            std::future::pending::<()>().await;
            Ok(())
        }

        async fn update_multiple_configs(&self, config: Map<String, Value>) -> anyhow::Result<()> {
            let (plain, writes) = fabric_loader::module::partition_config_delta(config);
            self.config.write().await.extend(plain);
            let mut streams = self.streams.write().await;
            for (stream_id, value) in writes {
                if let Some(stream) = streams.get_mut(&stream_id) {
                    stream.write_value(value);
                }
            }
            Ok(())
        }

        async fn control_module(&self, command: &str) -> anyhow::Result<()> {
            if command == "fail" {
                anyhow::bail!("command failed")
            }
            self.controlled.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        async fn cleanup(&self) -> anyhow::Result<()> {
            self.cleaned_up.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    fn build_engine(module_id: &'static str) -> (Arc<Engine>, mpsc::UnboundedReceiver<Envelope>) {
        let (to_broker, rx) = mpsc::unbounded_channel();
        let mut modules = IndexMap::new();
        modules.insert(
            module_id.to_string(),
            ModuleHandle::new(module_id, Arc::new(CountingModule::new(module_id))),
        );
        let engine = Arc::new(Engine::new(EngineConfig::default(), modules, to_broker));
        (engine, rx)
    }

    #[tokio::test]
    async fn publish_snapshot_includes_module_stream_values() {
        let (engine, mut rx) = build_engine("mod1");
        engine.publish_snapshot().await;

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.msg_type, "negotiation");
        let data = envelope.field("data").unwrap();
        assert_eq!(data["mod1"]["streams"]["s1"]["value"], 1.5);
    }

    #[tokio::test]
    async fn control_success_replies_with_success_status() {
        let (engine, mut rx) = build_engine("mod1");
        let envelope = Envelope::new("control")
            .with_field("module_id", Value::from("mod1"))
            .with_field("command", Value::from("reset"));
        engine.apply_control(&envelope).await;

        let response = rx.recv().await.unwrap();
        assert_eq!(response.msg_type, "control_response");
        assert_eq!(response.field("status").unwrap(), "success");
    }

    #[tokio::test]
    async fn control_unknown_module_replies_with_error_not_panic() {
        let (engine, mut rx) = build_engine("mod1");
        let envelope = Envelope::new("control")
            .with_field("module_id", Value::from("does_not_exist"))
            .with_field("command", Value::from("reset"));
        engine.apply_control(&envelope).await;

        let response = rx.recv().await.unwrap();
        assert_eq!(response.field("status").unwrap(), "error");
    }

    #[tokio::test]
    async fn config_update_value_write_convention_updates_stream() {
        let (engine, mut rx) = build_engine("mod1");
        let envelope = Envelope::new("config_update")
            .with_field("module_id", Value::from("mod1"))
            .with_field("config", serde_json::json!({"s1_value": 9.5}));
        engine.apply_config_update(&envelope).await;

        let response = rx.recv().await.unwrap();
        assert_eq!(response.field("status").unwrap(), "success");

        engine.publish_snapshot().await;
        let snapshot = rx.recv().await.unwrap();
        let data = snapshot.field("data").unwrap();
        assert_eq!(data["mod1"]["streams"]["s1"]["value"], 9.5);
    }

    #[tokio::test]
    async fn cleanup_modules_runs_every_loaded_module() {
        let (to_broker, _rx) = mpsc::unbounded_channel();
        let module = Arc::new(CountingModule::new("mod1"));
        let mut modules = IndexMap::new();
        modules.insert("mod1".to_string(), ModuleHandle::new("mod1", Arc::clone(&module) as Arc<dyn Module>));
        let engine = Engine::new(EngineConfig::default(), modules, to_broker);

        engine.cleanup_modules().await;

        assert_eq!(module.cleaned_up.load(Ordering::Relaxed), 1);
    }
}
