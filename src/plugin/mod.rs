//! Plugin system for crrouterd
//!
//! WAN connections, LAN port handling, VPN servers and long running
//! managers are all plugins behind [`RouterPlugin`]:
//! - traits: capability interface and descriptors
//! - config: per-plugin JSON configuration
//! - manager: dependency ordered activation and teardown
//! - registry: active managers, looked up by name
//! - hub: built-in factories and dynamic discovery

pub mod traits;
pub mod config;
pub mod manager;
pub mod registry;
pub mod hub;

#[cfg(feature = "plugins")]
pub mod loader;

pub use traits::{
    PluginCapability, PluginContext, PluginDescriptor, PluginFactory, PluginState, RouterPlugin,
    MANAGER_CATEGORY, TRAFFIC_CATEGORY,
};
pub use config::PluginConfigStore;
pub use manager::{activation_order, PluginLifecycleManager};
pub use registry::ManagerRegistry;
pub use hub::PluginHub;

#[cfg(feature = "plugins")]
pub use loader::PluginLoader;
