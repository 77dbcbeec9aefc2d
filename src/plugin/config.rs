//! Plugin configuration management
//!
//! Each plugin has one JSON file `<etc>/<category>-<name>.json`. A missing
//! or zero-length file means an empty configuration object.

use super::traits::PluginDescriptor;
use crate::error::{RouterError, RouterResult};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Plugin configuration store
pub struct PluginConfigStore {
    config_dir: PathBuf,
}

impl PluginConfigStore {
    pub fn new(config_dir: PathBuf) -> Self {
        Self { config_dir }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn path(&self, descriptor: &PluginDescriptor) -> PathBuf {
        self.config_dir.join(format!("{}.json", descriptor.full_name()))
    }

    /// Whether a config file exists for the plugin, empty or not
    pub async fn exists(&self, descriptor: &PluginDescriptor) -> bool {
        fs::try_exists(self.path(descriptor)).await.unwrap_or(false)
    }

    /// Load a plugin configuration
    pub async fn load(&self, descriptor: &PluginDescriptor) -> RouterResult<Value> {
        let path = self.path(descriptor);

        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No config for {}, using empty object", descriptor.full_name());
                return Ok(Value::Object(Default::default()));
            }
            Err(e) => return Err(e.into()),
        };

        if contents.trim().is_empty() {
            return Ok(Value::Object(Default::default()));
        }

        serde_json::from_str(&contents).map_err(|e| {
            RouterError::ConfigError(format!("Invalid JSON in {}: {}", path.display(), e))
        })
    }

    /// Save a plugin configuration to file
    pub async fn save(&self, descriptor: &PluginDescriptor, config: &Value) -> RouterResult<()> {
        fs::create_dir_all(&self.config_dir).await?;
        let json = serde_json::to_string_pretty(config)?;
        fs::write(self.path(descriptor), json).await?;
        info!("Saved plugin config: {}", descriptor.full_name());
        Ok(())
    }
}
