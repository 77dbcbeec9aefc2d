//! Plugin discovery
//!
//! Built-in plugins register a factory under (category, name). With the
//! `plugins` feature, shared objects from the configured directories are
//! loaded as well.

use super::traits::{PluginFactory, RouterPlugin};
#[cfg(feature = "plugins")]
use super::loader::PluginLoader;
use crate::error::{RouterError, RouterResult};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::info;

#[derive(Default)]
pub struct PluginHub {
    factories: BTreeMap<(String, String), PluginFactory>,
    search_dirs: Vec<PathBuf>,
    #[cfg(feature = "plugins")]
    loader: Option<PluginLoader>,
}

impl PluginHub {
    pub fn new(search_dirs: Vec<PathBuf>) -> Self {
        Self {
            search_dirs,
            ..Self::default()
        }
    }

    /// Register a built-in plugin factory
    pub fn register(&mut self, category: &str, name: &str, factory: PluginFactory) -> RouterResult<()> {
        let key = (category.to_string(), name.to_string());
        if self.factories.contains_key(&key) {
            return Err(RouterError::AlreadyExists(format!(
                "Plugin factory {}-{} already registered",
                category, name
            )));
        }
        self.factories.insert(key, factory);
        Ok(())
    }

    /// Instantiate every built-in and dynamically loaded plugin
    pub async fn discover(&mut self) -> Vec<Box<dyn RouterPlugin>> {
        let mut plugins: Vec<Box<dyn RouterPlugin>> = self.factories.values().map(|factory| factory()).collect();

        #[cfg(feature = "plugins")]
        {
            let mut loader = PluginLoader::new();
            for dir in &self.search_dirs {
                loader.add_plugin_dir(dir);
            }
            plugins.extend(loader.load_all_plugins().await);
            // Libraries must outlive the plugins created from them
            self.loader = Some(loader);
        }

        #[cfg(not(feature = "plugins"))]
        {
            if !self.search_dirs.is_empty() {
                tracing::warn!("Dynamic plugins disabled, ignoring {} search dir(s)", self.search_dirs.len());
            }
        }

        info!("Discovered {} plugin(s)", plugins.len());
        plugins
    }
}
