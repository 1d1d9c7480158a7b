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

//! Config loading: file, then env, then CLI, in increasing precedence.
//! `FabricConfig` is a plain `Deserialize + Default` struct tree, so this is
//! a direct merge rather than a third-party config-layering crate.

use anyhow::Context;
use fabric_common::FabricConfig;

use crate::cli::Opt;

pub fn load_config(opt: &Opt) -> anyhow::Result<FabricConfig> {
    let mut config = match &opt.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file '{}'", path.display()))?;
            toml::from_str(&raw).with_context(|| format!("parsing config file '{}'", path.display()))?
        }
        None => FabricConfig::default(),
    };

    apply_env_overrides(&mut config);
    apply_cli_overrides(&mut config, opt);
    Ok(config)
}

/// `FABRIC_<SECTION>__<FIELD>` style overrides, without pulling in a
/// dedicated config-layering crate for a handful of fields.
fn apply_env_overrides(config: &mut FabricConfig) {
    if let Some(value) = env_string("FABRIC_BROKER__LISTEN_ADDR") {
        config.broker.listen_addr = value;
    }
    if let Some(value) = env_parsed::<u64>("FABRIC_BROKER__IDLE_TIMEOUT_MS") {
        config.broker.idle_timeout_ms = value;
    }
    if let Some(value) = env_parsed::<u64>("FABRIC_BROKER__PING_INTERVAL_MS") {
        config.broker.ping_interval_ms = value;
    }
    if let Some(value) = env_parsed::<u32>("FABRIC_BROKER__STALE_GRACE_MULTIPLIER") {
        config.broker.stale_grace_multiplier = value;
    }
    if let Some(value) = env_string("FABRIC_ENGINE__MODULE_DIR") {
        config.engine.module_dir = value;
    }
    if let Some(value) = env_parsed::<f64>("FABRIC_ENGINE__PUBLISH_RATE_HZ") {
        config.engine.publish_rate_hz = value;
    }
    if let Some(value) = env_parsed::<f64>("FABRIC_TOOL_MANAGER__DEFAULT_TIMEOUT_SECS") {
        config.tool_manager.default_timeout_secs = value;
    }
    if let Some(value) = env_parsed::<u32>("FABRIC_TOOL_MANAGER__MAX_RETRIES") {
        config.tool_manager.max_retries = value;
    }
}

fn apply_cli_overrides(config: &mut FabricConfig, opt: &Opt) {
    if opt.legacy {
        override_port(&mut config.broker.listen_addr, 8765);
    }
    if let Some(port) = opt.port {
        override_port(&mut config.broker.listen_addr, port);
    }
    if let Some(module_dir) = &opt.module_dir {
        config.engine.module_dir = module_dir.clone();
    }
}

/// Replaces the port of a `host:port` listen address, keeping the
/// configured host.
fn override_port(listen_addr: &mut String, port: u16) {
    let host = listen_addr.rsplit_once(':').map(|(host, _)| host).unwrap_or("0.0.0.0");
    *listen_addr = format!("{host}:{port}");
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.parse().ok())
}
