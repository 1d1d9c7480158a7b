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

//! Command-line surface for the fabric-node binary.

use std::path::PathBuf;

use clap::Parser;

/// Runs the telemetry and control fabric: the broker, the module engine, and
/// the tool execution manager, all on one process.
#[derive(Debug, Parser)]
#[command(version, about, author)]
pub struct Opt {
    /// Path to a `FabricConfig` TOML file. Missing sections fall back to
    /// built-in defaults.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Overrides the broker's listen port (the host portion of
    /// `broker.listen_addr` is kept as configured).
    #[arg(long)]
    pub port: Option<u16>,

    /// Overrides `engine.module_dir`, the directory `fabric-loader` scans
    /// for `*.module.toml` descriptors.
    #[arg(long)]
    pub module_dir: Option<String>,

    /// Raises the installed log filter to `debug`.
    #[arg(long, short = 'v')]
    pub verbose: bool,

    /// Binds the broker to a legacy port (8765) instead of the current
    /// core's default of 3000, for compatibility with older stream-handler
    /// deployments. Explicit `--port` still wins over this.
    #[arg(long)]
    pub legacy: bool,
}
