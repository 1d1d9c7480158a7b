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

//! The `Module` capability set every plugin must expose.

use std::sync::Arc;

use async_trait::async_trait;
use fabric_common::{Stream, StreamId};
use indexmap::IndexMap;
use serde_json::{Map, Value};

/// Uniform lifecycle and data-access surface a plugin exposes to the Engine.
///
/// Every method takes `&self`: implementations hold their mutable state
/// behind interior mutability (typically `tokio::sync::RwLock`) so that the
/// module's own update task, the engine's publish loop, and the control
/// task can all call in concurrently.
#[async_trait]
pub trait Module: Send + Sync {
    /// Stable process-wide identifier, conventionally the plugin's stem.
    fn module_id(&self) -> &str;

    /// Display name, defaults to the module id.
    fn name(&self) -> &str {
        self.module_id()
    }

    /// Runs once after construction, before `update_streams_forever` is
    /// spawned. Failure here leaves the module at `status=error` but must
    /// not abort loading of other modules.
    async fn initialize(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// A readable snapshot of this module's owned streams, taken under a
    /// short-held lock so the caller gets a consistent copy.
    async fn streams_snapshot(&self) -> IndexMap<StreamId, Stream>;

    /// A readable snapshot of this module's config map.
    async fn config_snapshot(&self) -> Map<String, Value>;

    /// Long-running task body that mutates `streams`. The Engine spawns one
    /// task per module running this to completion (it should not return
    /// under normal operation); an `Err` return increments `error_count` and
    /// the Engine restarts the loop after a short sleep.
    async fn update_streams_forever(&self) -> anyhow::Result<()>;

    /// Applies a config delta. Keys shaped `<stream_id>_value` write to that
    /// stream's value instead of the config map, per [`partition_config_delta`].
    async fn update_multiple_configs(&self, config: Map<String, Value>) -> anyhow::Result<()>;

    /// Dispatches a free-form command string to an internal handler.
    async fn control_module(&self, command: &str) -> anyhow::Result<()>;

    /// Optional graceful shutdown hook; released resources (sockets, serial
    /// ports) on every exit path including error ones.
    async fn cleanup(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Optional introspection surface forwarded in control/config responses.
    async fn debug_messages(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Splits the value-write convention out of a config delta: keys ending in
/// `_value` become `(stream_id, value)` pairs, everything else stays a
/// plain config entry. Shared helper so every `Module` impl applies the
/// convention identically.
pub fn partition_config_delta(config: Map<String, Value>) -> (Map<String, Value>, Vec<(StreamId, Value)>) {
    let mut plain = Map::new();
    let mut writes = Vec::new();
    for (key, value) in config {
        if let Some(stream_id) = key.strip_suffix("_value") {
            writes.push((stream_id.to_string(), value));
        } else {
            plain.insert(key, value);
        }
    }
    (plain, writes)
}

/// A loaded module paired with its stable identifier, as handed to the
/// Engine by [`crate::registry::load`].
#[derive(Clone)]
pub struct ModuleHandle {
    pub module_id: String,
    pub module: Arc<dyn Module>,
}

impl ModuleHandle {
    pub fn new(module_id: impl Into<String>, module: Arc<dyn Module>) -> Self {
        Self {
            module_id: module_id.into(),
            module,
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    #[rstest]
    #[case(vec![("gain".to_string(), json!(2))], vec![], vec![("gain".to_string(), json!(2))])]
    #[case(vec![("temp_value".to_string(), json!(21.5))], vec![("temp".to_string(), json!(21.5))], vec![])]
    fn partition_splits_value_writes_from_plain_config(
        #[case] input: Vec<(String, Value)>,
        #[case] expected_writes: Vec<(String, Value)>,
        #[case] expected_plain: Vec<(String, Value)>,
    ) {
        let map: Map<String, Value> = input.into_iter().collect();
        let (plain, writes) = partition_config_delta(map);
        let plain_vec: Vec<(String, Value)> = plain.into_iter().collect();
        assert_eq!(plain_vec, expected_plain);
        assert_eq!(writes, expected_writes);
    }
}
