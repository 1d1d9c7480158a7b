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

//! In-memory representations of Stream, Module, Connection, and ToolExecution.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::FabricError;

/// `stream_id` is canonicalized to `String` everywhere.
pub type StreamId = String;
pub type ModuleId = String;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Datatype {
    Float,
    Int,
    String,
    Bool,
    Vector,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StreamStatus {
    Active,
    Inactive,
    Error,
}

/// Advisory only: never read by broker or engine routing logic, round-trips
/// on the wire because some producers set it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

/// One named, typed, timestamped value owned by a [`Module`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Stream {
    pub stream_id: StreamId,
    pub name: String,
    pub datatype: Datatype,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    pub status: StreamStatus,
    pub value: Value,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub priority: Priority,
    pub updated_at: DateTime<Utc>,
}

impl Stream {
    pub fn new(stream_id: impl Into<String>, name: impl Into<String>, datatype: Datatype, value: Value) -> Self {
        Self {
            stream_id: stream_id.into(),
            name: name.into(),
            datatype,
            unit: None,
            status: StreamStatus::Active,
            value,
            metadata: Map::new(),
            priority: Priority::default(),
            updated_at: Utc::now(),
        }
    }

    /// Sets `value` and `updated_at` atomically, preserving the invariant that
    /// `updated_at` is monotonically non-decreasing even if the wall
    /// clock ever appears to go backwards between two writes.
    pub fn write_value(&mut self, value: Value) {
        let now = Utc::now();
        self.value = value;
        self.updated_at = now.max(self.updated_at);
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ModuleStatus {
    Loading,
    Active,
    Error,
    Stopped,
}

/// A named producer owning a set of streams.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Module {
    pub module_id: ModuleId,
    pub name: String,
    pub status: ModuleStatus,
    pub streams: IndexMap<StreamId, Stream>,
    #[serde(default)]
    pub config: Map<String, Value>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub error_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Module {
    pub fn new(module_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module_id: module_id.into(),
            name: name.into(),
            status: ModuleStatus::Loading,
            streams: IndexMap::new(),
            config: Map::new(),
            updated_at: Utc::now(),
            error_count: 0,
            last_error: None,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now().max(self.updated_at);
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.status = ModuleStatus::Error;
        self.error_count += 1;
        self.last_error = Some(message.into());
        self.touch();
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Stale,
    Closed,
}

/// Broker-local connection metadata. The actual socket handle and outbound
/// channel live in `fabric-broker`; this is the data-model half that is
/// serialized back out for `connection_info` queries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Connection {
    pub id: String,
    pub subscriptions: HashSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_ping_sent: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_pong_recv: Option<DateTime<Utc>>,
    pub latency_ms: f64,
    pub status: ConnectionStatus,
}

impl Connection {
    /// New connections auto-subscribe to `broadcast`, `physics`, and `tools`.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            subscriptions: ["broadcast", "physics", "tools"]
                .into_iter()
                .map(String::from)
                .collect(),
            last_ping_sent: None,
            last_pong_recv: None,
            latency_ms: 0.0,
            status: ConnectionStatus::Connected,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ToolExecutionStatus {
    Pending,
    Running,
    Success,
    Error,
    Cancelled,
    Timeout,
}

impl ToolExecutionStatus {
    /// Terminal statuses are exactly the ones that end an execution's
    /// lifetime: success, error, cancelled, timeout.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

/// One in-flight invocation of a tool, identified by `execution_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolExecution {
    pub execution_id: String,
    pub tool_name: String,
    pub source: String,
    pub parameters: Value,
    pub status: ToolExecutionStatus,
    pub start_time: DateTime<Utc>,
    pub timeout_seconds: f64,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<FabricError>,
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn stream_write_value_is_monotonic() {
        let mut s = Stream::new("s1", "Temperature", Datatype::Float, Value::from(1.0));
        let first = s.updated_at;
        s.write_value(Value::from(2.0));
        assert!(s.updated_at >= first);
        assert_eq!(s.value, Value::from(2.0));
    }

    #[rstest]
    #[case(ToolExecutionStatus::Success, true)]
    #[case(ToolExecutionStatus::Error, true)]
    #[case(ToolExecutionStatus::Cancelled, true)]
    #[case(ToolExecutionStatus::Timeout, true)]
    #[case(ToolExecutionStatus::Pending, false)]
    #[case(ToolExecutionStatus::Running, false)]
    fn terminal_status_classification(#[case] status: ToolExecutionStatus, #[case] expected: bool) {
        assert_eq!(status.is_terminal(), expected);
    }

    #[test]
    fn connection_auto_subscribes_default_topics() {
        let conn = Connection::new("c1");
        assert!(conn.subscriptions.contains("broadcast"));
        assert!(conn.subscriptions.contains("physics"));
        assert!(conn.subscriptions.contains("tools"));
    }

    #[test]
    fn module_record_error_increments_count_and_sets_status() {
        let mut m = Module::new("mod1", "IMU");
        m.record_error("sensor disconnected");
        assert_eq!(m.status, ModuleStatus::Error);
        assert_eq!(m.error_count, 1);
        assert_eq!(m.last_error.as_deref(), Some("sensor disconnected"));
    }
}
