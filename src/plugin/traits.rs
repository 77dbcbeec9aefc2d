//! Plugin trait definitions

use super::registry::ManagerRegistry;
use crate::error::RouterResult;
use crate::events::RouterHandle;
use crate::prefix_pool::SharedPrefixPool;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Plugin capability flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PluginCapability {
    /// Provides the WAN connection
    WanConnection,
    /// Can take over LAN ports and bridge them
    LanInterface,
    /// Serves VPN clients
    VpnServer,
    /// Long-running manager other plugins may depend on
    Manager,
}

/// Plugin state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PluginState {
    /// Discovered but not yet initialized
    Uninitialized,
    /// Initialized and taking part in routing
    Active,
    /// Torn down
    Disposed,
}

/// Static description of a plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PluginDescriptor {
    /// Plugin category, e.g. `manager`, `wconn`, `lif`, `vpns`
    pub category: String,
    pub name: String,
    /// Names (or full names) of plugins that must be active first
    #[serde(default)]
    pub init_after: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<PluginCapability>,
}

impl PluginDescriptor {
    pub fn new(category: &str, name: &str) -> Self {
        Self {
            category: category.to_string(),
            name: name.to_string(),
            init_after: Vec::new(),
            capabilities: Vec::new(),
        }
    }

    pub fn with_capability(mut self, capability: PluginCapability) -> Self {
        if !self.capabilities.contains(&capability) {
            self.capabilities.push(capability);
        }
        self
    }

    pub fn after(mut self, dependency: &str) -> Self {
        self.init_after.push(dependency.to_string());
        self
    }

    /// `<category>-<name>`, unique across all plugins
    pub fn full_name(&self) -> String {
        format!("{}-{}", self.category, self.name)
    }

    pub fn has(&self, capability: PluginCapability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Manager-category plugin, by category or declared capability
    pub fn is_manager(&self) -> bool {
        self.category == MANAGER_CATEGORY || self.has(PluginCapability::Manager)
    }
}

pub const MANAGER_CATEGORY: &str = "manager";

/// Plugins of this category belong to the traffic manager
pub const TRAFFIC_CATEGORY: &str = "traffic";

/// Values shared with every plugin at initialization. Built once per daemon
/// run and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct PluginContext {
    pub uuid: Uuid,
    pub etc_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub var_dir: PathBuf,
    pub default_bridge: String,
    pub router: RouterHandle,
    /// Active managers, by name
    pub managers: ManagerRegistry,
    pub prefix_pool: SharedPrefixPool,
}

impl PluginContext {
    /// Private scratch directory for one plugin
    pub fn plugin_tmp_dir(&self, descriptor: &PluginDescriptor) -> PathBuf {
        self.tmp_dir.join(descriptor.full_name())
    }

    /// Private persistent directory for one plugin
    pub fn plugin_var_dir(&self, descriptor: &PluginDescriptor) -> PathBuf {
        self.var_dir.join(descriptor.full_name())
    }
}

/// Main plugin trait - every WAN, LAN, VPN and manager plugin implements it
#[async_trait]
pub trait RouterPlugin: Send + Sync {
    fn descriptor(&self) -> &PluginDescriptor;

    /// First initialization phase: take config and context
    async fn init(&mut self, config: serde_json::Value, ctx: &PluginContext) -> RouterResult<()>;

    /// Second initialization phase, run once the plugin is registered
    async fn start(&mut self) -> RouterResult<()>;

    async fn dispose(&mut self) -> RouterResult<()>;

    /// Offer a new interface. LAN plugins receive the bridge to put it in.
    /// Returns whether the plugin took it.
    async fn interface_appear(&mut self, interface: &str, bridge: Option<&str>) -> bool;

    async fn interface_disappear(&mut self, interface: &str);

    /// Another manager plugin became active. Only manager plugins are told.
    async fn manager_appear(&mut self, other: &PluginDescriptor);

    /// Status merged into the router info report
    fn router_info(&self) -> serde_json::Value;
}

/// Plugin factory for creating plugin instances
pub type PluginFactory = Box<dyn Fn() -> Box<dyn RouterPlugin> + Send + Sync>;
