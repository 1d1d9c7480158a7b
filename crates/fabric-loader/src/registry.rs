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

//! `ModuleFactory` registry and directory-driven `load()` (the module loader's
//! §9 "dynamic plugin loading in a statically typed target").
//!
//! The original resolves a plugin by importing `<stem>.py` as a module and
//! pulling a class named `<stem>` out of it. This realization keeps the
//! "stem selects the type" convention but moves type resolution to compile
//! time: callers register a boxed constructor under a stem with
//! [`ModuleLoader::register_factory`], and [`ModuleLoader::load`] walks a
//! directory of `*.module.toml` descriptors (`name = "<stem>"`) deciding
//! which registered factory to instantiate for each discovered descriptor.

use std::{collections::HashMap, path::Path, sync::Arc};

use indexmap::IndexMap;
use serde::Deserialize;

use crate::module::{Module, ModuleHandle};

/// A zero-argument constructor for a `Module` implementation, keyed by the
/// stem it answers to.
pub type ModuleFactory = Arc<dyn Fn() -> Arc<dyn Module> + Send + Sync>;

#[derive(Debug, Deserialize)]
struct ModuleDescriptor {
    name: String,
}

/// Holds every compile-time-known module constructor, available to `load`.
#[derive(Default, Clone)]
pub struct ModuleLoader {
    factories: HashMap<String, ModuleFactory>,
}

impl ModuleLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory under `stem`; a later registration under the same
    /// stem replaces the earlier one (this is the compile-time analogue of
    /// re-importing a changed plugin file).
    pub fn register_factory(&mut self, stem: impl Into<String>, factory: ModuleFactory) {
        self.factories.insert(stem.into(), factory);
    }

    pub fn is_registered(&self, stem: &str) -> bool {
        self.factories.contains_key(stem)
    }

    /// Discovers `*.module.toml` descriptors in `directory`, instantiates the
    /// matching factory for each, and returns every module that was
    /// successfully constructed and initialized. A missing directory is not
    /// fatal: a failure to load one plugin never aborts the others.
    pub async fn load(&self, directory: impl AsRef<Path>) -> IndexMap<String, ModuleHandle> {
        load_with(self, directory).await
    }
}

/// Free-function form of [`ModuleLoader::load`], matching the `load(directory)
/// → mapping of module_id to Module` contract directly.
pub async fn load(loader: &ModuleLoader, directory: impl AsRef<Path>) -> IndexMap<String, ModuleHandle> {
    load_with(loader, directory).await
}

async fn load_with(loader: &ModuleLoader, directory: impl AsRef<Path>) -> IndexMap<String, ModuleHandle> {
    let directory = directory.as_ref();
    let mut loaded = IndexMap::new();

    let mut entries = match tokio::fs::read_dir(directory).await {
        Ok(entries) => entries,
        Err(err) => {
            log::warn!(
                "module directory '{}' not readable, loading zero modules: {err}",
                directory.display()
            );
            return loaded;
        }
    };

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(err) => {
                log::error!("error walking module directory: {err}");
                break;
            }
        };

        let path = entry.path();
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !file_name.ends_with(".module.toml") {
            continue;
        }

        match load_one(loader, &path).await {
            Ok(handle) => {
                log::info!("loaded module '{}' from {}", handle.module_id, path.display());
                loaded.insert(handle.module_id.clone(), handle);
            }
            Err(err) => {
                log::error!("failed to load module descriptor {}: {err:#}", path.display());
            }
        }
    }

    loaded
}

async fn load_one(loader: &ModuleLoader, descriptor_path: &Path) -> anyhow::Result<ModuleHandle> {
    let raw = tokio::fs::read_to_string(descriptor_path).await?;
    let descriptor: ModuleDescriptor = toml::from_str(&raw)?;

    let factory = loader
        .factories
        .get(&descriptor.name)
        .ok_or_else(|| anyhow::anyhow!("no factory registered for module stem '{}'", descriptor.name))?;

    let module = factory();
    if module.module_id() != descriptor.name {
        anyhow::bail!(
            "factory for stem '{}' constructed a module reporting id '{}'",
            descriptor.name,
            module.module_id()
        );
    }

    module
        .initialize()
        .await
        .map_err(|err| anyhow::anyhow!("initialize() failed for module '{}': {err:#}", descriptor.name))?;

    Ok(ModuleHandle::new(descriptor.name, module))
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use fabric_common::{Stream, StreamId};
    use serde_json::{Map, Value};

    use super::*;

    struct StubModule {
        id: &'static str,
        fail_init: bool,
    }

    #[async_trait]
    impl Module for StubModule {
        fn module_id(&self) -> &str {
            self.id
        }

        async fn streams_snapshot(&self) -> IndexMap<StreamId, Stream> {
            IndexMap::new()
        }

        async fn config_snapshot(&self) -> Map<String, Value> {
            Map::new()
        }

        async fn update_streams_forever(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn update_multiple_configs(&self, _config: Map<String, Value>) -> anyhow::Result<()> {
            Ok(())
        }

        async fn control_module(&self, _command: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn initialize(&self) -> anyhow::Result<()> {
            if self.fail_init {
                anyhow::bail!("simulated init failure")
            } else {
                Ok(())
            }
        }
    }

    fn write_descriptor(dir: &Path, stem: &str) {
        std::fs::write(
            dir.join(format!("{stem}.module.toml")),
            format!("name = \"{stem}\"\n"),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn missing_directory_yields_empty_map_not_a_fatal_error() {
        let loader = ModuleLoader::new();
        let result = loader.load("/nonexistent/path/for/fabric/tests").await;
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn loads_n_minus_k_modules_when_k_fail_to_initialize() {
        let dir = tempfile::tempdir().unwrap();
        write_descriptor(dir.path(), "good_one");
        write_descriptor(dir.path(), "good_two");
        write_descriptor(dir.path(), "bad_one");

        let mut loader = ModuleLoader::new();
        loader.register_factory(
            "good_one",
            Arc::new(|| Arc::new(StubModule { id: "good_one", fail_init: false }) as Arc<dyn Module>),
        );
        loader.register_factory(
            "good_two",
            Arc::new(|| Arc::new(StubModule { id: "good_two", fail_init: false }) as Arc<dyn Module>),
        );
        loader.register_factory(
            "bad_one",
            Arc::new(|| Arc::new(StubModule { id: "bad_one", fail_init: true }) as Arc<dyn Module>),
        );

        let loaded = loader.load(dir.path()).await;
        assert_eq!(loaded.len(), 2);
        assert!(loaded.contains_key("good_one"));
        assert!(loaded.contains_key("good_two"));
        assert!(!loaded.contains_key("bad_one"));
    }

    #[tokio::test]
    async fn unregistered_stem_is_skipped_without_aborting_others() {
        let dir = tempfile::tempdir().unwrap();
        write_descriptor(dir.path(), "known");
        write_descriptor(dir.path(), "unknown");

        let mut loader = ModuleLoader::new();
        loader.register_factory(
            "known",
            Arc::new(|| Arc::new(StubModule { id: "known", fail_init: false }) as Arc<dyn Module>),
        );

        let loaded = loader.load(dir.path()).await;
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains_key("known"));
    }
}
