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

//! Process entry point (C8): parses CLI options, loads configuration, wires
//! the registry, broker, tool execution manager, module loader, and engine
//! together, and drives them to completion under a `tokio::signal::ctrl_c()`
//! shutdown hook.

mod cli;
mod config;

use std::sync::Arc;

use clap::Parser;
use fabric_broker::Broker;
use fabric_common::MessageTypeRegistry;
use fabric_engine::Engine;
use fabric_loader::ModuleLoader;
use fabric_tools::{PublishFn, ToolExecutionManager, ToolMessageRouter};
use tokio::sync::mpsc;

use cli::Opt;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::parse();
    install_logging(opt.verbose);

    let fabric_config = config::load_config(&opt)?;
    log::info!(
        "starting fabric-node: broker={}, module_dir={}",
        fabric_config.broker.listen_addr,
        fabric_config.engine.module_dir
    );

    let registry = Arc::new(MessageTypeRegistry::new());
    let broker = Broker::new(fabric_config.broker.clone(), Arc::clone(&registry));

    let publish_broker = Arc::clone(&broker);
    let publish: PublishFn = Arc::new(move |envelope| publish_broker.fanout("tools", &envelope));
    let tool_manager = ToolExecutionManager::new(fabric_config.tool_manager, publish);
    let tool_router = Arc::new(ToolMessageRouter::new(Arc::clone(&registry), Arc::clone(&tool_manager)));
    broker.attach_tool_router(tool_router);
    tool_manager.start();

    let loader = ModuleLoader::new();
    let modules = fabric_loader::load(&loader, &fabric_config.engine.module_dir).await;
    log::info!("loaded {} module(s) from '{}'", modules.len(), fabric_config.engine.module_dir);

    let (from_broker_tx, from_broker_rx) = mpsc::unbounded_channel();
    let to_broker = broker.attach_local_engine("engine", from_broker_tx);
    let engine = Arc::new(Engine::new(fabric_config.engine, modules, to_broker));
    let engine_tasks = Arc::clone(&engine).spawn(from_broker_rx);

    let serve_task = tokio::spawn(Arc::clone(&broker).serve());

    tokio::select! {
        result = serve_task => {
            match result {
                Ok(Ok(())) => log::warn!("broker serve loop exited on its own"),
                Ok(Err(err)) => log::error!("broker serve loop failed: {err:#}"),
                Err(err) => log::error!("broker serve task panicked: {err}"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("received shutdown signal, winding down");
        }
    }

    engine_tasks.abort_all();
    engine.cleanup_modules().await;
    broker.close_all(1000, "server shutting down");
    tool_manager.shutdown().await;
    log::info!("fabric-node shutdown complete");
    Ok(())
}

/// Installs `tracing-subscriber` as the process-wide backend and bridges
/// every crate's `log::*!` call sites into it via `tracing-log`, treating
/// `tracing` as an optional layer over a primarily `log`-based core.
fn install_logging(verbose: bool) {
    tracing_log::LogTracer::init().expect("log-to-tracing bridge installs exactly once per process");

    let default_filter = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
