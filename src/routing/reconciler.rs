//! Route reconciliation
//!
//! Routes advertised by cascade peers are stored per gateway, then per
//! advertising router. A reconcile pass diffs the stored set against the
//! desired set and only touches the kernel for the difference.

use super::table::RouteTable;
use crate::error::RouterResult;
use ipnet::Ipv4Net;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Kernel calls issued by one reconcile pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteDelta {
    pub added: Vec<Ipv4Net>,
    pub removed: Vec<Ipv4Net>,
}

impl RouteDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

pub struct RouteReconciler {
    table: Arc<dyn RouteTable>,
    /// gateway -> router id -> prefixes currently installed in the kernel
    routes: BTreeMap<Ipv4Addr, BTreeMap<String, BTreeSet<Ipv4Net>>>,
}

impl RouteReconciler {
    pub fn new(table: Arc<dyn RouteTable>) -> Self {
        Self {
            table,
            routes: BTreeMap::new(),
        }
    }

    /// Bring the routes owned by `(gateway, router_id)` in line with `desired`.
    ///
    /// Removals run before additions. The stored set is updated prefix by
    /// prefix after each successful kernel call, so on error it still
    /// matches what the kernel actually holds.
    pub async fn reconcile(
        &mut self,
        gateway: Ipv4Addr,
        router_id: &str,
        desired: &BTreeSet<Ipv4Net>,
    ) -> RouterResult<RouteDelta> {
        let current = self
            .routes
            .entry(gateway)
            .or_default()
            .entry(router_id.to_string())
            .or_default();

        let to_remove: Vec<Ipv4Net> = current.difference(desired).copied().collect();
        let to_add: Vec<Ipv4Net> = desired.difference(current).copied().collect();

        let mut delta = RouteDelta::default();
        if to_remove.is_empty() && to_add.is_empty() {
            debug!("Routes of {} via {} already up to date", router_id, gateway);
            return Ok(delta);
        }

        for prefix in to_remove {
            self.table.del_route(prefix).await?;
            current.remove(&prefix);
            delta.removed.push(prefix);
        }

        for prefix in to_add {
            self.table.add_route(prefix, gateway).await?;
            current.insert(prefix);
            delta.added.push(prefix);
        }

        info!(
            "Reconciled routes of {} via {}: +{} -{}",
            router_id,
            gateway,
            delta.added.len(),
            delta.removed.len()
        );
        Ok(delta)
    }

    /// Delete every route stored for `(gateway, router_id)` and forget the key.
    ///
    /// Cleanup is best-effort: a failed deletion is logged and the remaining
    /// prefixes are still attempted. Returns the prefixes actually removed.
    pub async fn remove_peer(&mut self, gateway: Ipv4Addr, router_id: &str) -> Vec<Ipv4Net> {
        let Some(routers) = self.routes.get_mut(&gateway) else {
            return Vec::new();
        };
        let Some(prefixes) = routers.remove(router_id) else {
            return Vec::new();
        };

        let mut removed = Vec::with_capacity(prefixes.len());
        for prefix in prefixes {
            match self.table.del_route(prefix).await {
                Ok(()) => removed.push(prefix),
                Err(e) => warn!("Failed to remove route {} of {}: {}", prefix, router_id, e),
            }
        }

        info!("Removed {} route(s) of {} via {}", removed.len(), router_id, gateway);
        removed
    }

    /// Remove the routes of every router reached through `gateway`, then drop
    /// the gateway entry itself.
    pub async fn remove_gateway(&mut self, gateway: Ipv4Addr) -> Vec<Ipv4Net> {
        let mut removed = Vec::new();
        for router_id in self.router_ids(gateway) {
            removed.extend(self.remove_peer(gateway, &router_id).await);
        }
        self.routes.remove(&gateway);
        removed
    }

    /// Remove everything, used on shutdown
    pub async fn remove_all(&mut self) {
        let gateways: Vec<Ipv4Addr> = self.routes.keys().copied().collect();
        for gateway in gateways {
            self.remove_gateway(gateway).await;
        }
    }

    pub fn router_ids(&self, gateway: Ipv4Addr) -> Vec<String> {
        self.routes
            .get(&gateway)
            .map(|routers| routers.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn prefixes(&self, gateway: Ipv4Addr, router_id: &str) -> Option<&BTreeSet<Ipv4Net>> {
        self.routes.get(&gateway)?.get(router_id)
    }

    pub fn has_gateway(&self, gateway: Ipv4Addr) -> bool {
        self.routes.contains_key(&gateway)
    }

    /// gateway -> router id -> prefixes, for the status report
    pub fn snapshot(&self) -> Value {
        let mut out = serde_json::Map::new();
        for (gateway, routers) in &self.routes {
            let routers: serde_json::Map<String, Value> = routers
                .iter()
                .map(|(id, prefixes)| {
                    let list: Vec<String> = prefixes.iter().map(|p| p.to_string()).collect();
                    (id.clone(), json!(list))
                })
                .collect();
            out.insert(gateway.to_string(), Value::Object(routers));
        }
        Value::Object(out)
    }
}
