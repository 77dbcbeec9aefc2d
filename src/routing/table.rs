//! Routing table management
//!
//! Kernel routes are applied over rtnetlink. Every call opens its own netlink
//! connection and drops it on return, so no table session outlives a single
//! operation, error paths included.

use crate::error::{RouterError, RouterResult};
use async_trait::async_trait;
use ipnet::Ipv4Net;
use rtnetlink::RouteMessageBuilder;
use std::net::Ipv4Addr;
use tracing::{debug, info};

/// Kernel route table boundary
#[async_trait]
pub trait RouteTable: Send + Sync {
    /// Install `destination via gateway`
    async fn add_route(&self, destination: Ipv4Net, gateway: Ipv4Addr) -> RouterResult<()>;

    /// Remove the route to `destination`
    async fn del_route(&self, destination: Ipv4Net) -> RouterResult<()>;
}

/// Route table backed by the kernel main table
pub struct NetlinkRouteTable;

impl NetlinkRouteTable {
    pub fn new() -> Self {
        Self
    }

    fn open() -> RouterResult<rtnetlink::Handle> {
        let (connection, handle, _) = rtnetlink::new_connection()
            .map_err(|e| RouterError::Netlink(format!("Failed to open rtnetlink connection: {}", e)))?;
        tokio::spawn(connection);
        Ok(handle)
    }
}

impl Default for NetlinkRouteTable {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RouteTable for NetlinkRouteTable {
    async fn add_route(&self, destination: Ipv4Net, gateway: Ipv4Addr) -> RouterResult<()> {
        let handle = Self::open()?;
        let message = RouteMessageBuilder::<Ipv4Addr>::new()
            .destination_prefix(destination.addr(), destination.prefix_len())
            .gateway(gateway)
            .build();

        match handle.route().add(message).execute().await {
            Ok(()) => {
                info!("Route added: {} via {}", destination, gateway);
                Ok(())
            }
            Err(rtnetlink::Error::NetlinkError(e)) if e.raw_code() == -libc::EEXIST => {
                debug!("Route {} already present", destination);
                Ok(())
            }
            Err(e) => Err(RouterError::Netlink(format!(
                "Failed to add route {} via {}: {}",
                destination, gateway, e
            ))),
        }
    }

    async fn del_route(&self, destination: Ipv4Net) -> RouterResult<()> {
        let handle = Self::open()?;
        let message = RouteMessageBuilder::<Ipv4Addr>::new()
            .destination_prefix(destination.addr(), destination.prefix_len())
            .build();

        match handle.route().del(message).execute().await {
            Ok(()) => {
                info!("Route deleted: {}", destination);
                Ok(())
            }
            Err(rtnetlink::Error::NetlinkError(e)) if e.raw_code() == -libc::ESRCH => {
                debug!("Route {} already gone", destination);
                Ok(())
            }
            Err(e) => Err(RouterError::Netlink(format!(
                "Failed to delete route {}: {}",
                destination, e
            ))),
        }
    }
}
