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

//! Shared envelope, type registry, data model, and error types for the comms fabric.
//!
//! This crate has no network or task dependencies of its own: it is the
//! vocabulary that `fabric-broker`, `fabric-engine`, and `fabric-tools` all
//! speak.

pub mod config;
pub mod envelope;
pub mod error;
pub mod model;
pub mod registry;

pub use config::{BrokerConfig, EngineConfig, FabricConfig, ToolManagerConfig};
pub use envelope::Envelope;
pub use error::{FabricError, FabricErrorCode};
pub use model::{
    Connection, ConnectionStatus, Datatype, Module, ModuleId, ModuleStatus, Priority, Stream,
    StreamId, StreamStatus, ToolExecution, ToolExecutionStatus,
};
pub use registry::{
    MessageCategory, MessagePriority, MessageTypeInfo, MessageTypeRegistry, Middleware,
    RegistryStatistics,
};

/// Returns the crate version as declared in `Cargo.toml`, used by the broker's
/// `/status` endpoint and the `system_info` welcome envelope.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Current timestamp formatted the way the wire protocol expects for
/// `msg-sent-timestamp`: `YYYY-MM-DD HH:MM:SS` in UTC.
pub fn now_stamp() -> String {
    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}
