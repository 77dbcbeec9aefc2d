//! In-memory kernel seams for unit tests

use crate::error::{RouterError, RouterResult};
use crate::nft::{Nftables, RuleEntry};
use crate::routing::RouteTable;
use async_trait::async_trait;
use ipnet::Ipv4Net;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

/// Route table keeping installed routes in a map
#[derive(Default)]
pub struct MemoryRouteTable {
    pub routes: Mutex<BTreeMap<Ipv4Net, Ipv4Addr>>,
    pub calls: Mutex<usize>,
}

impl MemoryRouteTable {
    pub fn installed(&self) -> BTreeMap<Ipv4Net, Ipv4Addr> {
        self.routes.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl RouteTable for MemoryRouteTable {
    async fn add_route(&self, destination: Ipv4Net, gateway: Ipv4Addr) -> RouterResult<()> {
        *self.calls.lock().unwrap() += 1;
        self.routes.lock().unwrap().insert(destination, gateway);
        Ok(())
    }

    async fn del_route(&self, destination: Ipv4Net) -> RouterResult<()> {
        *self.calls.lock().unwrap() += 1;
        self.routes.lock().unwrap().remove(&destination);
        Ok(())
    }
}

/// Rule table handing out sequential handles
#[derive(Default)]
pub struct MemoryNft {
    pub rules: Mutex<Vec<RuleEntry>>,
    pub next: Mutex<u64>,
    /// Rules containing this text fail to install
    pub reject: Mutex<Option<String>>,
    /// Do not echo handles, forcing lookups by listing
    pub hide_handles: bool,
    /// Table creation fails
    pub fail_create: bool,
}

impl MemoryNft {
    pub fn without_handles() -> Self {
        Self {
            hide_handles: true,
            ..Self::default()
        }
    }

    pub fn rule_texts(&self) -> Vec<String> {
        self.rules.lock().unwrap().iter().map(|r| r.rule.clone()).collect()
    }
}

#[async_trait]
impl Nftables for MemoryNft {
    async fn create_table(&self) -> RouterResult<()> {
        if self.fail_create {
            return Err(RouterError::CommandFailed {
                cmd: "nft add table".into(),
                code: Some(1),
                stderr: "Error: Operation not permitted".into(),
            });
        }
        Ok(())
    }

    async fn force_delete_table(&self) -> RouterResult<()> {
        self.rules.lock().unwrap().clear();
        Ok(())
    }

    async fn add_rule(&self, chain: &str, rule: &str) -> RouterResult<Option<u64>> {
        if let Some(bad) = self.reject.lock().unwrap().as_deref() {
            if rule.contains(bad) {
                return Err(RouterError::CommandFailed {
                    cmd: format!("nft add rule {}", chain),
                    code: Some(1),
                    stderr: "Error: Could not process rule".into(),
                });
            }
        }
        let mut next = self.next.lock().unwrap();
        *next += 1;
        self.rules.lock().unwrap().push(RuleEntry {
            chain: chain.into(),
            rule: rule.into(),
            handle: *next,
        });
        Ok((!self.hide_handles).then_some(*next))
    }

    async fn delete_rule(&self, _chain: &str, handle: u64) -> RouterResult<()> {
        let mut rules = self.rules.lock().unwrap();
        let before = rules.len();
        rules.retain(|r| r.handle != handle);
        if rules.len() == before {
            return Err(RouterError::NotFound(format!("rule handle {}", handle)));
        }
        Ok(())
    }

    async fn list_rules(&self) -> RouterResult<Vec<RuleEntry>> {
        Ok(self.rules.lock().unwrap().clone())
    }
}
