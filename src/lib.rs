//! crrouterd - cascading router daemon library
//!
//! Building blocks of a router that hosts plugins for its WAN uplink, LAN
//! ports and VPN servers, and that cooperates with peer routers above and
//! below it:
//! - Plugin lifecycle (dependency ordered activation, interface hot-plug)
//! - Cascade routes learned from peer advertisements (rtnetlink)
//! - Sub-host NAT of downstream and local clients (nftables)
//! - Traffic facility groups and WAN services managed over D-Bus
//! - Shared, persisted pool of plugin subnets
//! - Local DNS forwarder (dnsmasq)

pub mod error;
pub mod config;
pub mod validation;
pub mod identity;
pub mod nft;
pub mod routing;
pub mod prefix_pool;
pub mod nat;
pub mod cascade;
pub mod events;
pub mod plugin;
pub mod interface_watcher;
pub mod traffic;
pub mod daemon;
pub mod service;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use error::{RouterError, RouterResult};
pub use config::RouterConfig;
pub use cascade::{CascadeEvent, CascadeEventKind, CascadeEventRouter, Direction, RouterAdvert};
pub use events::{RouterEvent, RouterHandle};
pub use nft::{CommandNftables, Nftables, RuleEntry};
pub use routing::{RouteReconciler, RouteTable};
pub use nat::{NatAllocator, SourceId, UplinkInfo};
pub use prefix_pool::{PrefixPool, SharedPrefixPool};
pub use plugin::{
    ManagerRegistry, PluginCapability, PluginContext, PluginDescriptor, PluginHub,
    PluginLifecycleManager, PluginState, RouterPlugin,
};
pub use interface_watcher::{InterfaceWatcher, LinkSource, SysfsLinkSource};
pub use traffic::{validate_facility_group, TrafficManager};
pub use daemon::{Daemon, Exit, Seams, ServiceRequest};
