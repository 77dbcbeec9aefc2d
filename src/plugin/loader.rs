//! Dynamic plugin loader - loads plugins from shared libraries (.so files)

use super::traits::RouterPlugin;
use crate::error::{RouterError, RouterResult};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// Plugin loader handles dynamic loading of plugin modules
pub struct PluginLoader {
    /// Directories to search for plugin modules
    plugin_dirs: Vec<PathBuf>,
    /// Loaded plugin libraries (keeps them in memory)
    libraries: Vec<libloading::Library>,
}

/// Plugin module entry point signature
/// Each plugin .so must export a function:
/// ```ignore
/// #[no_mangle]
/// pub extern "C" fn crrouter_plugin_create() -> *mut Box<dyn RouterPlugin> {
///     Box::into_raw(Box::new(Box::new(MyPlugin::new())))
/// }
/// ```
type PluginCreateFn = unsafe extern "C" fn() -> *mut Box<dyn RouterPlugin>;

const CREATE_SYMBOL: &[u8] = b"crrouter_plugin_create";

impl PluginLoader {
    pub fn new() -> Self {
        Self {
            plugin_dirs: vec![
                PathBuf::from("/usr/lib/crrouter/plugins"),
                PathBuf::from("/usr/local/lib/crrouter/plugins"),
            ],
            libraries: Vec::new(),
        }
    }

    /// Add a plugin search directory
    pub fn add_plugin_dir<P: AsRef<Path>>(&mut self, dir: P) {
        let dir = dir.as_ref().to_path_buf();
        if !self.plugin_dirs.contains(&dir) {
            self.plugin_dirs.push(dir);
        }
    }

    pub fn loaded_count(&self) -> usize {
        self.libraries.len()
    }

    /// Discover all plugin modules in the search directories, sorted by path
    pub async fn discover_plugins(&self) -> Vec<PathBuf> {
        let mut plugins = Vec::new();

        for dir in &self.plugin_dirs {
            if !dir.exists() {
                continue;
            }

            info!("Searching for plugins in: {}", dir.display());

            match tokio::fs::read_dir(dir).await {
                Ok(mut entries) => {
                    while let Ok(Some(entry)) = entries.next_entry().await {
                        let path = entry.path();
                        if path.extension().is_some_and(|ext| ext == "so") {
                            info!("Found plugin module: {}", path.display());
                            plugins.push(path);
                        }
                    }
                }
                Err(e) => {
                    warn!("Failed to read plugin directory {}: {}", dir.display(), e);
                }
            }
        }

        plugins.sort();
        plugins
    }

    /// Load a plugin from a shared library file
    ///
    /// # Safety
    /// The library must export `crrouter_plugin_create` with the signature
    /// above, built against this exact crate version.
    pub unsafe fn load_plugin<P: AsRef<Path>>(&mut self, path: P) -> RouterResult<Box<dyn RouterPlugin>> {
        let path = path.as_ref();
        info!("Loading plugin from: {}", path.display());

        let lib = libloading::Library::new(path)
            .map_err(|e| RouterError::ServiceError(format!("Failed to load plugin: {}", e)))?;

        let create_fn: libloading::Symbol<PluginCreateFn> = lib.get(CREATE_SYMBOL).map_err(|e| {
            RouterError::ServiceError(format!("Plugin missing 'crrouter_plugin_create' function: {}", e))
        })?;

        let plugin_ptr = create_fn();
        if plugin_ptr.is_null() {
            return Err(RouterError::ServiceError("Plugin creation returned null".to_string()));
        }

        let plugin = *Box::from_raw(plugin_ptr);

        // Keep the library loaded
        self.libraries.push(lib);

        info!("Loaded plugin {}", plugin.descriptor().full_name());
        Ok(plugin)
    }

    /// Load every discovered plugin; modules failing to load are skipped
    pub async fn load_all_plugins(&mut self) -> Vec<Box<dyn RouterPlugin>> {
        let plugin_paths = self.discover_plugins().await;
        let mut plugins = Vec::new();

        for path in plugin_paths {
            match unsafe { self.load_plugin(&path) } {
                Ok(plugin) => plugins.push(plugin),
                Err(e) => error!("Failed to load plugin from {}: {}", path.display(), e),
            }
        }

        plugins
    }
}

impl Default for PluginLoader {
    fn default() -> Self {
        Self::new()
    }
}
