//! Cascade VPN event routing
//!
//! Upstream and downstream peers report their lifecycle and their router
//! tree. Each event is turned into route reconciliation against the peer's
//! gateway address and, for sub-host NAT, into client mapping updates.

use crate::error::RouterResult;
use crate::nat::{NatAllocator, SourceId, UplinkInfo};
use crate::routing::{normalize_prefixes, RouteReconciler};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    Upstream,
    Downstream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CascadeEventKind {
    Up,
    Down,
    RouterAdd,
    RouterRemove,
    RouterUpdate,
}

/// What a peer advertises about one router of its tree
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RouterAdvert {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lan_prefix_list: Option<Vec<String>>,
    /// client address -> address reachable from this router
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_list: Option<BTreeMap<Ipv4Addr, Ipv4Addr>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CascadeEvent {
    pub direction: Direction,
    pub event: CascadeEventKind,
    pub peer_ip: Ipv4Addr,
    #[serde(default)]
    pub router_list: BTreeMap<String, RouterAdvert>,
    /// Sub-host NAT uplink, only meaningful on upstream up
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nat: Option<UplinkInfo>,
}

pub struct CascadeEventRouter {
    own_id: String,
    local_prefixes: BTreeSet<Ipv4Net>,
    routes: RouteReconciler,
    nat: NatAllocator,
    upstream: Option<Ipv4Addr>,
    downstream: BTreeSet<Ipv4Addr>,
    /// Router ids announced per downstream gateway, with or without prefixes
    downstream_routers: BTreeMap<Ipv4Addr, BTreeSet<String>>,
}

impl CascadeEventRouter {
    pub fn new(own_id: impl Into<String>, routes: RouteReconciler, nat: NatAllocator) -> Self {
        Self {
            own_id: own_id.into(),
            local_prefixes: BTreeSet::new(),
            routes,
            nat,
            upstream: None,
            downstream: BTreeSet::new(),
            downstream_routers: BTreeMap::new(),
        }
    }

    /// Prefixes assigned to this node itself; never routed towards a peer
    pub fn set_local_prefixes(&mut self, prefixes: BTreeSet<Ipv4Net>) {
        debug!("Local prefixes: {:?}", prefixes);
        self.local_prefixes = prefixes;
    }

    pub fn routes(&self) -> &RouteReconciler {
        &self.routes
    }

    pub fn nat(&self) -> &NatAllocator {
        &self.nat
    }

    pub fn nat_mut(&mut self) -> &mut NatAllocator {
        &mut self.nat
    }

    /// Apply one peer event.
    ///
    /// Routers of one event are handled independently; the first failure is
    /// returned after all of them were attempted.
    pub async fn handle(&mut self, event: CascadeEvent) -> RouterResult<()> {
        info!(
            "Cascade {:?} {:?} from {} ({} router(s))",
            event.direction,
            event.event,
            event.peer_ip,
            event.router_list.len()
        );

        match event.event {
            CascadeEventKind::Up => self.peer_up(event).await,
            CascadeEventKind::Down => {
                self.peer_down(event.direction, event.peer_ip).await;
                Ok(())
            }
            CascadeEventKind::RouterAdd | CascadeEventKind::RouterUpdate => {
                self.apply_adverts(event.direction, event.peer_ip, &event.router_list, false)
                    .await
            }
            CascadeEventKind::RouterRemove => {
                for router_id in event.router_list.keys() {
                    self.remove_router(event.direction, event.peer_ip, router_id).await;
                }
                Ok(())
            }
        }
    }

    /// Tear down everything learned from peers, used on shutdown
    pub async fn shutdown(&mut self) {
        if let Some(gateway) = self.upstream {
            self.peer_down(Direction::Upstream, gateway).await;
        }
        let downstream: Vec<Ipv4Addr> = self.downstream.iter().copied().collect();
        for gateway in downstream {
            self.peer_down(Direction::Downstream, gateway).await;
        }
        self.routes.remove_all().await;
    }

    pub fn snapshot(&self) -> Value {
        json!({
            "upstream": self.upstream.map(|ip| ip.to_string()),
            "downstream": self.downstream.iter().map(|ip| ip.to_string()).collect::<Vec<_>>(),
        })
    }

    async fn peer_up(&mut self, event: CascadeEvent) -> RouterResult<()> {
        match event.direction {
            Direction::Upstream => {
                if let Some(previous) = self.upstream.filter(|ip| *ip != event.peer_ip) {
                    warn!("Upstream changed from {} to {}", previous, event.peer_ip);
                    self.peer_down(Direction::Upstream, previous).await;
                }
                self.upstream = Some(event.peer_ip);
            }
            Direction::Downstream => {
                self.downstream.insert(event.peer_ip);
            }
        }

        let mut result = self
            .apply_adverts(event.direction, event.peer_ip, &event.router_list, true)
            .await;

        if let (Direction::Upstream, Some(uplink)) = (event.direction, event.nat) {
            if let Err(e) = self.nat.on_uplink_up(uplink).await {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    async fn peer_down(&mut self, direction: Direction, gateway: Ipv4Addr) {
        match direction {
            Direction::Upstream => {
                if self.upstream == Some(gateway) {
                    self.upstream = None;
                }
                self.nat.on_uplink_down().await;
            }
            Direction::Downstream => {
                self.downstream.remove(&gateway);
                let mut router_ids = self.downstream_routers.remove(&gateway).unwrap_or_default();
                router_ids.extend(self.routes.router_ids(gateway));
                for router_id in router_ids {
                    self.nat.remove_source(&SourceId::Downstream(router_id)).await;
                }
            }
        }
        self.routes.remove_gateway(gateway).await;
    }

    async fn remove_router(&mut self, direction: Direction, gateway: Ipv4Addr, router_id: &str) {
        self.routes.remove_peer(gateway, router_id).await;
        if direction == Direction::Downstream {
            if let Some(known) = self.downstream_routers.get_mut(&gateway) {
                known.remove(router_id);
            }
            self.nat
                .remove_source(&SourceId::Downstream(router_id.to_string()))
                .await;
        }
    }

    /// Reconcile each advertised router. A router without a prefix list only
    /// counts on peer up, where it means "no prefixes"; otherwise it leaves
    /// the routes alone.
    async fn apply_adverts(
        &mut self,
        direction: Direction,
        gateway: Ipv4Addr,
        adverts: &BTreeMap<String, RouterAdvert>,
        full: bool,
    ) -> RouterResult<()> {
        let mut first_error = None;

        for (router_id, advert) in adverts {
            let prefixes = match (&advert.lan_prefix_list, full) {
                (Some(list), _) => Some(list.clone()),
                (None, true) => Some(Vec::new()),
                (None, false) => None,
            };

            if let Some(prefixes) = prefixes {
                if let Err(e) = self.reconcile_router(gateway, router_id, &prefixes).await {
                    warn!("Failed to reconcile routes of {}: {}", router_id, e);
                    first_error.get_or_insert(e);
                }
            }

            if direction == Direction::Downstream {
                self.downstream_routers
                    .entry(gateway)
                    .or_default()
                    .insert(router_id.clone());
                if let Some(clients) = &advert.client_list {
                    if let Err(e) = self.sync_clients(router_id, clients).await {
                        warn!("Failed to update clients of {}: {}", router_id, e);
                        first_error.get_or_insert(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn reconcile_router(&mut self, gateway: Ipv4Addr, router_id: &str, prefixes: &[String]) -> RouterResult<()> {
        let mut desired = normalize_prefixes(prefixes)?;
        if router_id == self.own_id {
            // Removing a prefix we do not hold is a no-op
            desired.retain(|prefix| !self.local_prefixes.contains(prefix));
        }
        self.routes.reconcile(gateway, router_id, &desired).await?;
        Ok(())
    }

    async fn sync_clients(&mut self, router_id: &str, clients: &BTreeMap<Ipv4Addr, Ipv4Addr>) -> RouterResult<()> {
        let source = SourceId::Downstream(router_id.to_string());

        for known in self.nat.clients(&source) {
            if !clients.contains_key(&known) {
                self.nat.on_client_remove(&source, known).await;
            }
        }

        let mut first_error = None;
        for (client_ip, original_ip) in clients {
            let unchanged = self
                .nat
                .mapping(&source, *client_ip)
                .is_some_and(|m| m.original_ip == *original_ip);
            if unchanged {
                continue;
            }
            if let Err(e) = self.nat.on_client_change(source.clone(), *client_ip, *original_ip).await {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nat::NatRuleStore;
    use crate::test_support::{MemoryNft, MemoryRouteTable};
    use std::sync::Arc;

    const OWN_ID: &str = "7f6c1d9e-0000-4000-8000-000000000001";

    fn router() -> (Arc<MemoryRouteTable>, Arc<MemoryNft>, CascadeEventRouter) {
        let table = Arc::new(MemoryRouteTable::default());
        let nft = Arc::new(MemoryNft::default());
        let router = CascadeEventRouter::new(
            OWN_ID,
            RouteReconciler::new(table.clone()),
            NatAllocator::new(NatRuleStore::new(nft.clone())),
        );
        (table, nft, router)
    }

    fn event(json: Value) -> CascadeEvent {
        serde_json::from_value(json).unwrap()
    }

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    #[test]
    fn test_event_wire_format() {
        let ev = event(json!({
            "direction": "upstream",
            "event": "router-update",
            "peer-ip": "10.99.0.1",
            "router-list": {
                "r1": {"lan-prefix-list": ["10.1.0.0/255.255.255.0"]},
                "r2": {}
            }
        }));
        assert_eq!(ev.event, CascadeEventKind::RouterUpdate);
        assert_eq!(ev.router_list["r1"].lan_prefix_list.as_ref().unwrap().len(), 1);
        assert!(ev.router_list["r2"].lan_prefix_list.is_none());
        assert!(ev.nat.is_none());
    }

    #[tokio::test]
    async fn test_upstream_up_installs_routes() {
        let (table, _, mut router) = router();
        router
            .handle(event(json!({
                "direction": "upstream", "event": "up", "peer-ip": "10.99.0.1",
                "router-list": {
                    "r1": {"lan-prefix-list": ["10.1.0.0/24", "10.2.0.0/255.255.255.0"]}
                }
            })))
            .await
            .unwrap();

        let installed = table.installed();
        assert_eq!(installed.len(), 2);
        assert_eq!(installed[&net("10.2.0.0/24")], "10.99.0.1".parse::<Ipv4Addr>().unwrap());
    }

    #[tokio::test]
    async fn test_self_exclusion() {
        let (table, _, mut router) = router();
        router.set_local_prefixes(BTreeSet::from([net("10.50.0.0/24")]));

        router
            .handle(event(json!({
                "direction": "upstream", "event": "up", "peer-ip": "10.99.0.1",
                "router-list": {
                    OWN_ID: {"lan-prefix-list": ["10.50.0.0/24", "10.51.0.0/24"]},
                    "other": {"lan-prefix-list": ["10.50.0.0/24"]}
                }
            })))
            .await
            .unwrap();

        let owned = router.routes().prefixes("10.99.0.1".parse().unwrap(), OWN_ID).unwrap();
        assert_eq!(owned, &BTreeSet::from([net("10.51.0.0/24")]));
        assert!(table.installed().contains_key(&net("10.50.0.0/24")));
    }

    #[tokio::test]
    async fn test_self_exclusion_absent_prefix_is_noop() {
        let (table, _, mut router) = router();
        router.set_local_prefixes(BTreeSet::from([net("10.50.0.0/24")]));

        router
            .handle(event(json!({
                "direction": "upstream", "event": "up", "peer-ip": "10.99.0.1",
                "router-list": {OWN_ID: {"lan-prefix-list": ["10.51.0.0/24"]}}
            })))
            .await
            .unwrap();
        assert_eq!(table.installed().len(), 1);
    }

    #[tokio::test]
    async fn test_update_without_prefix_list_is_noop() {
        let (table, _, mut router) = router();
        router
            .handle(event(json!({
                "direction": "upstream", "event": "up", "peer-ip": "10.99.0.1",
                "router-list": {"r1": {"lan-prefix-list": ["10.1.0.0/24"]}}
            })))
            .await
            .unwrap();
        let calls = table.call_count();

        router
            .handle(event(json!({
                "direction": "upstream", "event": "router-add", "peer-ip": "10.99.0.1",
                "router-list": {"r1": {}}
            })))
            .await
            .unwrap();
        assert_eq!(table.call_count(), calls);
        assert_eq!(table.installed().len(), 1);
    }

    #[tokio::test]
    async fn test_router_remove_and_peer_down() {
        let (table, _, mut router) = router();
        router
            .handle(event(json!({
                "direction": "downstream", "event": "up", "peer-ip": "10.98.0.2",
                "router-list": {
                    "r1": {"lan-prefix-list": ["10.1.0.0/24"]},
                    "r2": {"lan-prefix-list": ["10.2.0.0/24"]}
                }
            })))
            .await
            .unwrap();
        assert_eq!(table.installed().len(), 2);

        router
            .handle(event(json!({
                "direction": "downstream", "event": "router-remove", "peer-ip": "10.98.0.2",
                "router-list": {"r1": {}}
            })))
            .await
            .unwrap();
        assert_eq!(table.installed().keys().copied().collect::<Vec<_>>(), vec![net("10.2.0.0/24")]);

        router
            .handle(event(json!({
                "direction": "downstream", "event": "down", "peer-ip": "10.98.0.2"
            })))
            .await
            .unwrap();
        assert!(table.installed().is_empty());
        assert!(!router.routes().has_gateway("10.98.0.2".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_downstream_clients_follow_uplink() {
        let (_, nft, mut router) = router();
        router
            .handle(event(json!({
                "direction": "downstream", "event": "up", "peer-ip": "10.98.0.2",
                "router-list": {"r2": {"client-list": {"10.8.0.2": "10.98.0.2", "10.8.0.3": "10.98.0.2"}}}
            })))
            .await
            .unwrap();
        assert_eq!(router.nat().mapping_count(), 2);
        assert!(nft.rule_texts().is_empty());

        router
            .handle(event(json!({
                "direction": "upstream", "event": "up", "peer-ip": "10.99.0.1",
                "nat": {"interface": "wg0", "range-start": "100.64.0.1", "range-end": "100.64.0.8"}
            })))
            .await
            .unwrap();
        assert_eq!(router.nat().allocated().len(), 2);
        assert_eq!(nft.rule_texts().len(), 4);

        router
            .handle(event(json!({
                "direction": "downstream", "event": "router-update", "peer-ip": "10.98.0.2",
                "router-list": {"r2": {"client-list": {"10.8.0.2": "10.98.0.2"}}}
            })))
            .await
            .unwrap();
        assert_eq!(router.nat().mapping_count(), 1);
        assert_eq!(nft.rule_texts().len(), 2);

        router
            .handle(event(json!({
                "direction": "upstream", "event": "down", "peer-ip": "10.99.0.1"
            })))
            .await
            .unwrap();
        assert!(!router.nat().is_uplink_up());
        assert_eq!(router.nat().mapping_count(), 1);
    }
}
