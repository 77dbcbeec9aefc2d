//! Sub-host NAT allocation
//!
//! Client mappings are kept for the lifetime of the client, independent of
//! the uplink. NAT addresses are only bound while a NAT-capable uplink is
//! up; losing the uplink unbinds every client but keeps its original
//! address, so the next uplink can rebind everyone in one pass.

use super::pool::AddressPool;
use super::rules::NatRuleStore;
use crate::error::{RouterError, RouterResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::Ipv4Addr;
use tracing::{info, warn};

/// Where a client mapping came from
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SourceId {
    /// Clients of this router's own LAN
    Local,
    /// Clients reported by a downstream cascade router
    Downstream(String),
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceId::Local => write!(f, "local"),
            SourceId::Downstream(id) => write!(f, "downstream:{}", id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NatMapping {
    pub original_ip: Ipv4Addr,
    pub nat_ip: Option<Ipv4Addr>,
}

/// NAT-capable uplink as announced by the upstream peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UplinkInfo {
    pub interface: String,
    pub range_start: Ipv4Addr,
    pub range_end: Ipv4Addr,
}

struct Uplink {
    interface: String,
    pool: AddressPool,
}

pub struct NatAllocator {
    rules: NatRuleStore,
    mappings: HashMap<SourceId, BTreeMap<Ipv4Addr, NatMapping>>,
    /// Present exactly while the uplink is up
    uplink: Option<Uplink>,
}

impl NatAllocator {
    pub fn new(rules: NatRuleStore) -> Self {
        Self {
            rules,
            mappings: HashMap::new(),
            uplink: None,
        }
    }

    /// Record a new or changed client. With an active pool the client is
    /// bound right away.
    pub async fn on_client_change(
        &mut self,
        source: SourceId,
        client_ip: Ipv4Addr,
        original_ip: Ipv4Addr,
    ) -> RouterResult<()> {
        let previous = self
            .mappings
            .get_mut(&source)
            .and_then(|clients| clients.remove(&client_ip));
        if let Some(previous) = previous {
            self.unbind(previous).await;
        }

        let mut mapping = NatMapping {
            original_ip,
            nat_ip: None,
        };
        let bound = self.bind(&mut mapping).await;
        self.mappings.entry(source.clone()).or_default().insert(client_ip, mapping);
        info!("Client {} of {} -> {}", client_ip, source, original_ip);
        bound
    }

    /// Forget a client, releasing its NAT address
    pub async fn on_client_remove(&mut self, source: &SourceId, client_ip: Ipv4Addr) {
        let Some(clients) = self.mappings.get_mut(source) else {
            return;
        };
        let removed = clients.remove(&client_ip);
        if clients.is_empty() {
            self.mappings.remove(source);
        }
        if let Some(mapping) = removed {
            self.unbind(mapping).await;
            info!("Client {} of {} removed", client_ip, source);
        }
    }

    /// Forget every client of a source
    pub async fn remove_source(&mut self, source: &SourceId) {
        let Some(clients) = self.mappings.remove(source) else {
            return;
        };
        for mapping in clients.into_values() {
            self.unbind(mapping).await;
        }
        info!("All clients of {} removed", source);
    }

    /// Materialize the pool and bind every known client.
    ///
    /// A failure for one client does not stop the pass; the first error is
    /// returned once every client has been tried.
    pub async fn on_uplink_up(&mut self, info: UplinkInfo) -> RouterResult<()> {
        if self.uplink.is_some() {
            self.on_uplink_down().await;
        }

        let pool = AddressPool::materialize(info.range_start, info.range_end)?;
        info!(
            "NAT uplink {} up, pool {} - {} ({} addresses)",
            info.interface,
            info.range_start,
            info.range_end,
            pool.size()
        );
        self.uplink = Some(Uplink {
            interface: info.interface,
            pool,
        });

        let mut first_error = None;
        let keys: Vec<(SourceId, Ipv4Addr)> = self
            .mappings
            .iter()
            .flat_map(|(source, clients)| clients.keys().map(move |ip| (source.clone(), *ip)))
            .collect();

        for (source, client_ip) in keys {
            let Some(mut mapping) = self.mappings.get(&source).and_then(|c| c.get(&client_ip)).copied() else {
                continue;
            };
            let result = self.bind(&mut mapping).await;
            if let Some(slot) = self.mappings.get_mut(&source).and_then(|c| c.get_mut(&client_ip)) {
                *slot = mapping;
            }
            if let Err(e) = result {
                warn!("Failed to bind client {} of {}: {}", client_ip, source, e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Unbind every client and discard the pool
    pub async fn on_uplink_down(&mut self) {
        let Some(uplink) = self.uplink.take() else {
            return;
        };

        for clients in self.mappings.values_mut() {
            for mapping in clients.values_mut() {
                if let Some(nat_ip) = mapping.nat_ip.take() {
                    self.rules.destroy(mapping.original_ip, nat_ip, &uplink.interface).await;
                }
            }
        }
        self.rules.forget_all();
        info!("NAT uplink {} down, pool discarded", uplink.interface);
    }

    pub fn is_uplink_up(&self) -> bool {
        self.uplink.is_some()
    }

    pub fn mapping(&self, source: &SourceId, client_ip: Ipv4Addr) -> Option<NatMapping> {
        self.mappings.get(source)?.get(&client_ip).copied()
    }

    /// Client addresses currently recorded for a source
    pub fn clients(&self, source: &SourceId) -> Vec<Ipv4Addr> {
        self.mappings
            .get(source)
            .map(|clients| clients.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn has_source(&self, source: &SourceId) -> bool {
        self.mappings.contains_key(source)
    }

    pub fn mapping_count(&self) -> usize {
        self.mappings.values().map(BTreeMap::len).sum()
    }

    pub fn free_count(&self) -> usize {
        self.uplink.as_ref().map(|u| u.pool.size()).unwrap_or(0)
    }

    /// NAT addresses currently bound to a client
    pub fn allocated(&self) -> Vec<Ipv4Addr> {
        self.mappings
            .values()
            .flat_map(|clients| clients.values().filter_map(|m| m.nat_ip))
            .collect()
    }

    pub fn snapshot(&self) -> Value {
        json!({
            "pool-active": self.is_uplink_up(),
            "uplink": self.uplink.as_ref().map(|u| u.interface.clone()),
            "free": self.free_count(),
            "mappings": self.mapping_count(),
            "rule-pairs": self.rules.installed_count(),
        })
    }

    async fn bind(&mut self, mapping: &mut NatMapping) -> RouterResult<()> {
        let Some(uplink) = self.uplink.as_mut() else {
            return Ok(());
        };
        if uplink.pool.size() == 0 {
            return Err(RouterError::PoolExhausted(format!(
                "No NAT address left for {}",
                mapping.original_ip
            )));
        }

        let nat_ip = uplink.pool.take()?;
        if let Err(e) = self.rules.create(mapping.original_ip, nat_ip, &uplink.interface).await {
            uplink.pool.give_back(nat_ip);
            return Err(e);
        }
        mapping.nat_ip = Some(nat_ip);
        Ok(())
    }

    async fn unbind(&mut self, mapping: NatMapping) {
        let (Some(uplink), Some(nat_ip)) = (self.uplink.as_mut(), mapping.nat_ip) else {
            return;
        };
        self.rules.destroy(mapping.original_ip, nat_ip, &uplink.interface).await;
        uplink.pool.give_back(nat_ip);
    }
}
