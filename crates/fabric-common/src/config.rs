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

//! Configuration surface.
//!
//! Plain `Deserialize + Default` structs with concrete numeric defaults,
//! merged file-then-env-then-CLI, rather than a third-party
//! config-layering crate.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Broker listen/liveness configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    pub listen_addr: String,
    pub idle_timeout_ms: u64,
    pub ping_interval_ms: u64,
    pub stale_grace_multiplier: u32,
    pub max_payload_bytes: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3000".to_string(),
            idle_timeout_ms: 960_000,
            ping_interval_ms: 100,
            stale_grace_multiplier: 10,
            max_payload_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Engine publish/control/reconnect configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub publish_rate_hz: f64,
    pub broker_url: String,
    pub module_dir: String,
    pub update_rate_overrides: HashMap<String, f64>,
    pub reconnect_min_ms: u64,
    pub reconnect_max_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            publish_rate_hz: 10.0,
            broker_url: "ws://127.0.0.1:3000/".to_string(),
            module_dir: "./modules".to_string(),
            update_rate_overrides: HashMap::new(),
            reconnect_min_ms: 100,
            reconnect_max_ms: 30_000,
        }
    }
}

/// Tool Execution Manager configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ToolManagerConfig {
    pub default_timeout_secs: f64,
    pub cleanup_interval_secs: f64,
    pub max_retries: u32,
}

impl Default for ToolManagerConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 300.0,
            cleanup_interval_secs: 60.0,
            max_retries: 3,
        }
    }
}

/// Top-level process configuration composing the three above.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FabricConfig {
    pub broker: BrokerConfig,
    pub engine: EngineConfig,
    pub tool_manager: ToolManagerConfig,
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn broker_defaults_match_spec() {
        let cfg = BrokerConfig::default();
        assert_eq!(cfg.listen_addr, "0.0.0.0:3000");
        assert_eq!(cfg.idle_timeout_ms, 960_000);
        assert_eq!(cfg.ping_interval_ms, 100);
        assert_eq!(cfg.stale_grace_multiplier, 10);
        assert_eq!(cfg.max_payload_bytes, 16 * 1024 * 1024);
    }

    #[rstest]
    fn engine_defaults_match_spec() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.publish_rate_hz, 10.0);
        assert_eq!(cfg.reconnect_min_ms, 100);
        assert_eq!(cfg.reconnect_max_ms, 30_000);
    }

    #[rstest]
    fn tool_manager_defaults_match_spec() {
        let cfg = ToolManagerConfig::default();
        assert_eq!(cfg.default_timeout_secs, 300.0);
        assert_eq!(cfg.cleanup_interval_secs, 60.0);
        assert_eq!(cfg.max_retries, 3);
    }

    #[test]
    fn fabric_config_deserializes_from_partial_toml() {
        let toml_str = r#"
            [broker]
            listen_addr = "127.0.0.1:9000"
        "#;
        let cfg: FabricConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.broker.listen_addr, "127.0.0.1:9000");
        assert_eq!(cfg.broker.ping_interval_ms, 100);
        assert_eq!(cfg.engine.publish_rate_hz, 10.0);
    }
}
