//! Cascade routing and sub-host NAT through the public API

mod common;

use common::{ip, net, MemoryNft, MemoryRouteTable};
use libcrrouterd::nat::{NatRuleStore, SourceId};
use libcrrouterd::{CascadeEvent, CascadeEventRouter, NatAllocator, RouteReconciler};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;

const OWN_ID: &str = "3b7e2a10-5c1d-4f7e-9a42-6d1e8c0b1f23";

struct Fixture {
    table: Arc<MemoryRouteTable>,
    nft: Arc<MemoryNft>,
    router: CascadeEventRouter,
}

fn fixture() -> Fixture {
    let table = Arc::new(MemoryRouteTable::default());
    let nft = Arc::new(MemoryNft::default());
    let router = CascadeEventRouter::new(
        OWN_ID,
        RouteReconciler::new(table.clone()),
        NatAllocator::new(NatRuleStore::new(nft.clone())),
    );
    Fixture { table, nft, router }
}

fn event(value: Value) -> CascadeEvent {
    serde_json::from_value(value).unwrap()
}

#[tokio::test]
async fn test_downstream_tree_lifecycle() {
    let mut f = fixture();
    let gw = ip("10.98.0.2");

    f.router
        .handle(event(json!({
            "direction": "downstream", "event": "up", "peer-ip": "10.98.0.2",
            "router-list": {
                "child": {"lan-prefix-list": ["192.168.10.0/255.255.255.0"]},
                "grandchild": {"lan-prefix-list": ["192.168.20.0/24", "192.168.21.0/24"]}
            }
        })))
        .await
        .unwrap();
    assert_eq!(f.table.installed().len(), 3);

    f.router
        .handle(event(json!({
            "direction": "downstream", "event": "router-update", "peer-ip": "10.98.0.2",
            "router-list": {"grandchild": {"lan-prefix-list": ["192.168.21.0/24", "192.168.22.0/24"]}}
        })))
        .await
        .unwrap();
    let installed = f.table.installed();
    assert!(!installed.contains_key(&net("192.168.20.0/24")));
    assert_eq!(installed[&net("192.168.22.0/24")], gw);
    assert_eq!(
        f.router.routes().prefixes(gw, "grandchild").unwrap(),
        &BTreeSet::from([net("192.168.21.0/24"), net("192.168.22.0/24")])
    );

    f.router
        .handle(event(json!({
            "direction": "downstream", "event": "router-remove", "peer-ip": "10.98.0.2",
            "router-list": {"child": {}}
        })))
        .await
        .unwrap();
    assert_eq!(f.table.installed().len(), 2);
    assert_eq!(f.router.routes().router_ids(gw), vec!["grandchild"]);

    f.router
        .handle(event(json!({
            "direction": "downstream", "event": "down", "peer-ip": "10.98.0.2"
        })))
        .await
        .unwrap();
    assert!(f.table.installed().is_empty());
    assert!(!f.router.routes().has_gateway(gw));
}

#[tokio::test]
async fn test_partial_route_failure_keeps_state_consistent() {
    let mut f = fixture();
    f.table.fail.lock().unwrap().push(net("10.2.0.0/24"));

    let result = f
        .router
        .handle(event(json!({
            "direction": "upstream", "event": "up", "peer-ip": "10.99.0.1",
            "router-list": {"r1": {"lan-prefix-list": ["10.1.0.0/24", "10.2.0.0/24"]}}
        })))
        .await;
    assert!(result.is_err());

    // Only what the kernel accepted is recorded
    let stored = f.router.routes().prefixes(ip("10.99.0.1"), "r1").unwrap();
    assert_eq!(stored, &BTreeSet::from([net("10.1.0.0/24")]));
    assert_eq!(f.table.installed().len(), 1);
}

#[tokio::test]
async fn test_invalid_prefix_is_rejected() {
    let mut f = fixture();
    let result = f
        .router
        .handle(event(json!({
            "direction": "upstream", "event": "up", "peer-ip": "10.99.0.1",
            "router-list": {"r1": {"lan-prefix-list": ["10.1.0.0/255.0.255.0"]}}
        })))
        .await;
    assert!(result.is_err());
    assert!(f.table.installed().is_empty());
}

#[tokio::test]
async fn test_sub_host_nat_follows_uplink_and_clients() {
    let mut f = fixture();

    // Clients known before the uplink exists stay unbound
    f.router
        .handle(event(json!({
            "direction": "downstream", "event": "up", "peer-ip": "10.98.0.2",
            "router-list": {
                "child": {
                    "lan-prefix-list": [],
                    "client-list": {"10.98.0.10": "192.168.10.5", "10.98.0.11": "192.168.10.6"}
                }
            }
        })))
        .await
        .unwrap();
    let child = SourceId::Downstream("child".to_string());
    assert_eq!(f.router.nat().clients(&child).len(), 2);
    assert!(f.nft.rules().is_empty());

    f.router
        .handle(event(json!({
            "direction": "upstream", "event": "up", "peer-ip": "10.99.0.1",
            "router-list": {},
            "nat": {"interface": "tun0", "range-start": "100.72.0.1", "range-end": "100.72.0.4"}
        })))
        .await
        .unwrap();

    assert!(f.router.nat().is_uplink_up());
    assert_eq!(f.router.nat().free_count(), 2);
    // DNAT and SNAT per client
    assert_eq!(f.nft.rules().len(), 4);
    let bound = f.router.nat().mapping(&child, ip("10.98.0.10")).unwrap();
    let nat_ip = bound.nat_ip.unwrap();
    assert!(f
        .nft
        .rule_texts()
        .contains(&format!("iifname \"tun0\" ip daddr {} dnat to 192.168.10.5", nat_ip)));

    // Client list shrinks: its addresses return to the pool
    f.router
        .handle(event(json!({
            "direction": "downstream", "event": "router-update", "peer-ip": "10.98.0.2",
            "router-list": {"child": {"client-list": {"10.98.0.11": "192.168.10.6"}}}
        })))
        .await
        .unwrap();
    assert_eq!(f.router.nat().free_count(), 3);
    assert_eq!(f.nft.rules().len(), 2);

    // Uplink gone: rules removed, mappings kept without NAT address
    f.router
        .handle(event(json!({
            "direction": "upstream", "event": "down", "peer-ip": "10.99.0.1"
        })))
        .await
        .unwrap();
    assert!(!f.router.nat().is_uplink_up());
    assert!(f.nft.rules().is_empty());
    let kept = f.router.nat().mapping(&child, ip("10.98.0.11")).unwrap();
    assert_eq!(kept.nat_ip, None);
}

#[tokio::test]
async fn test_local_clients_and_pool_exhaustion() {
    let mut f = fixture();
    f.router
        .handle(event(json!({
            "direction": "upstream", "event": "up", "peer-ip": "10.99.0.1",
            "router-list": {},
            "nat": {"interface": "tun0", "range-start": "100.72.0.1", "range-end": "100.72.0.1"}
        })))
        .await
        .unwrap();

    let nat = f.router.nat_mut();
    nat.on_client_change(SourceId::Local, ip("192.168.1.10"), ip("192.168.1.10"))
        .await
        .unwrap();
    let err = nat
        .on_client_change(SourceId::Local, ip("192.168.1.11"), ip("192.168.1.11"))
        .await
        .unwrap_err();
    assert!(matches!(err, libcrrouterd::RouterError::PoolExhausted(_)));

    // The unbound client stays recorded; freed addresses are not handed out
    // until the next uplink pass
    assert_eq!(nat.mapping_count(), 2);
    nat.on_client_remove(&SourceId::Local, ip("192.168.1.10")).await;
    assert_eq!(nat.free_count(), 1);
    assert!(nat.allocated().is_empty());
    assert_eq!(nat.mapping(&SourceId::Local, ip("192.168.1.11")).unwrap().nat_ip, None);
}

#[tokio::test]
async fn test_shutdown_removes_everything() {
    let mut f = fixture();
    f.router.set_local_prefixes(BTreeSet::from([net("10.50.0.0/24")]));
    f.router
        .handle(event(json!({
            "direction": "upstream", "event": "up", "peer-ip": "10.99.0.1",
            "router-list": {
                OWN_ID: {"lan-prefix-list": ["10.50.0.0/24", "10.51.0.0/24"]},
                "sibling": {"lan-prefix-list": ["10.52.0.0/24"]}
            },
            "nat": {"interface": "tun0", "range-start": "100.72.0.1", "range-end": "100.72.0.8"}
        })))
        .await
        .unwrap();
    assert!(!f.table.installed().contains_key(&net("10.50.0.0/24")));
    assert_eq!(f.table.installed().len(), 2);

    f.router.shutdown().await;
    assert!(f.table.installed().is_empty());
    assert!(!f.router.nat().is_uplink_up());
}

#[tokio::test]
async fn test_downstream_down_drops_client_only_routers() {
    let mut f = fixture();
    f.router
        .handle(event(json!({
            "direction": "upstream", "event": "up", "peer-ip": "10.99.0.1",
            "router-list": {},
            "nat": {"interface": "wg0", "range-start": "100.64.0.1", "range-end": "100.64.0.8"}
        })))
        .await
        .unwrap();
    f.router
        .handle(event(json!({
            "direction": "downstream", "event": "up", "peer-ip": "10.98.0.2",
            "router-list": {"r1": {"lan-prefix-list": ["192.168.30.0/24"]}}
        })))
        .await
        .unwrap();

    // Announced with clients only, so it never owns a route
    f.router
        .handle(event(json!({
            "direction": "downstream", "event": "router-add", "peer-ip": "10.98.0.2",
            "router-list": {"r3": {"client-list": {"10.8.0.2": "10.98.0.2"}}}
        })))
        .await
        .unwrap();
    assert_eq!(f.router.nat().mapping_count(), 1);
    assert_eq!(f.nft.rules().len(), 2);
    assert_eq!(f.router.routes().router_ids(ip("10.98.0.2")), vec!["r1"]);

    f.router
        .handle(event(json!({
            "direction": "downstream", "event": "down", "peer-ip": "10.98.0.2"
        })))
        .await
        .unwrap();
    assert_eq!(f.router.nat().mapping_count(), 0);
    assert!(f.nft.rules().is_empty());
    assert!(!f.router.nat().has_source(&SourceId::Downstream("r3".to_string())));
    assert_eq!(f.router.nat().free_count(), 8);
    assert!(f.table.installed().is_empty());
}
