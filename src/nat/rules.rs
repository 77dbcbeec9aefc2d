//! Paired DNAT/SNAT rules for sub-host NAT

use crate::error::RouterResult;
use crate::nft::{Nftables, RuleEntry, CHAIN_NAT_POST, CHAIN_NAT_PRE};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info, warn};

type RuleKey = (Ipv4Addr, Ipv4Addr, String);

#[derive(Debug, Clone, Copy, Default)]
struct RuleHandles {
    dnat: Option<u64>,
    snat: Option<u64>,
}

/// Textual DNAT rule, exactly as nft lists it back
pub fn dnat_rule(original_ip: Ipv4Addr, nat_ip: Ipv4Addr, interface: &str) -> String {
    format!("iifname \"{}\" ip daddr {} dnat to {}", interface, nat_ip, original_ip)
}

/// Textual SNAT rule, exactly as nft lists it back
pub fn snat_rule(original_ip: Ipv4Addr, nat_ip: Ipv4Addr, interface: &str) -> String {
    format!("oifname \"{}\" ip saddr {} snat to {}", interface, original_ip, nat_ip)
}

/// Creates and destroys the rule pair binding a client address to its NAT
/// address on one interface.
///
/// Handles echoed at creation are cached. When a handle is missing the
/// table is listed and the rule located by exact text.
pub struct NatRuleStore {
    nft: Arc<dyn Nftables>,
    handles: HashMap<RuleKey, RuleHandles>,
}

impl NatRuleStore {
    pub fn new(nft: Arc<dyn Nftables>) -> Self {
        Self {
            nft,
            handles: HashMap::new(),
        }
    }

    /// Install DNAT then SNAT. If the SNAT rule fails the DNAT rule is
    /// withdrawn again before the error is returned.
    pub async fn create(&mut self, original_ip: Ipv4Addr, nat_ip: Ipv4Addr, interface: &str) -> RouterResult<()> {
        let dnat = self
            .nft
            .add_rule(CHAIN_NAT_PRE, &dnat_rule(original_ip, nat_ip, interface))
            .await?;

        let snat = match self
            .nft
            .add_rule(CHAIN_NAT_POST, &snat_rule(original_ip, nat_ip, interface))
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                let partial = RuleHandles { dnat, snat: None };
                self.remove_pair(original_ip, nat_ip, interface, partial).await;
                return Err(e);
            }
        };

        self.handles
            .insert((original_ip, nat_ip, interface.to_string()), RuleHandles { dnat, snat });
        info!("NAT {} <-> {} on {}", original_ip, nat_ip, interface);
        Ok(())
    }

    /// Remove both rules. A rule that cannot be found is already gone and
    /// does not count as a failure.
    pub async fn destroy(&mut self, original_ip: Ipv4Addr, nat_ip: Ipv4Addr, interface: &str) {
        let cached = self
            .handles
            .remove(&(original_ip, nat_ip, interface.to_string()))
            .unwrap_or_default();
        self.remove_pair(original_ip, nat_ip, interface, cached).await;
        info!("NAT {} <-> {} on {} removed", original_ip, nat_ip, interface);
    }

    /// Drop all cached handles, used once the uplink they refer to is gone
    pub fn forget_all(&mut self) {
        self.handles.clear();
    }

    /// Rule pairs installed on the current uplink
    pub fn installed_count(&self) -> usize {
        self.handles.len()
    }

    async fn remove_pair(&self, original_ip: Ipv4Addr, nat_ip: Ipv4Addr, interface: &str, cached: RuleHandles) {
        let mut listing: Option<Vec<RuleEntry>> = None;

        let wanted = [
            (CHAIN_NAT_PRE, dnat_rule(original_ip, nat_ip, interface), cached.dnat),
            (CHAIN_NAT_POST, snat_rule(original_ip, nat_ip, interface), cached.snat),
        ];

        for (chain, rule, handle) in wanted {
            let handle = match handle {
                Some(h) => Some(h),
                None => {
                    if listing.is_none() {
                        listing = match self.nft.list_rules().await {
                            Ok(rules) => Some(rules),
                            Err(e) => {
                                warn!("Failed to list NAT rules: {}", e);
                                Some(Vec::new())
                            }
                        };
                    }
                    find_handle(listing.as_deref().unwrap_or_default(), chain, &rule)
                }
            };

            match handle {
                Some(h) => {
                    if let Err(e) = self.nft.delete_rule(chain, h).await {
                        warn!("Failed to delete rule '{}' (handle {}): {}", rule, h, e);
                    }
                }
                None => debug!("Rule '{}' not present in {}", rule, chain),
            }
        }
    }
}

fn find_handle(rules: &[RuleEntry], chain: &str, rule: &str) -> Option<u64> {
    rules
        .iter()
        .find(|entry| entry.chain == chain && entry.rule == rule)
        .map(|entry| entry.handle)
}
