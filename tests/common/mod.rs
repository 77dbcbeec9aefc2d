//! Shared fakes for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use ipnet::Ipv4Net;
use libcrrouterd::error::{RouterError, RouterResult};
use libcrrouterd::nft::{Nftables, RuleEntry};
use libcrrouterd::plugin::{ManagerRegistry, PluginContext, PluginDescriptor, RouterPlugin};
use libcrrouterd::prefix_pool::PrefixPool;
use libcrrouterd::{LinkSource, RouteTable, RouterHandle};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Default)]
pub struct MemoryRouteTable {
    routes: Mutex<BTreeMap<Ipv4Net, Ipv4Addr>>,
    /// Destinations whose installation fails
    pub fail: Mutex<Vec<Ipv4Net>>,
}

impl MemoryRouteTable {
    pub fn installed(&self) -> BTreeMap<Ipv4Net, Ipv4Addr> {
        self.routes.lock().unwrap().clone()
    }
}

#[async_trait]
impl RouteTable for MemoryRouteTable {
    async fn add_route(&self, destination: Ipv4Net, gateway: Ipv4Addr) -> RouterResult<()> {
        if self.fail.lock().unwrap().contains(&destination) {
            return Err(RouterError::Netlink(format!("add {} rejected", destination)));
        }
        self.routes.lock().unwrap().insert(destination, gateway);
        Ok(())
    }

    async fn del_route(&self, destination: Ipv4Net) -> RouterResult<()> {
        self.routes.lock().unwrap().remove(&destination);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryNft {
    rules: Mutex<Vec<RuleEntry>>,
    next: Mutex<u64>,
}

impl MemoryNft {
    pub fn rules(&self) -> Vec<RuleEntry> {
        self.rules.lock().unwrap().clone()
    }

    pub fn rule_texts(&self) -> Vec<String> {
        self.rules().into_iter().map(|r| r.rule).collect()
    }
}

#[async_trait]
impl Nftables for MemoryNft {
    async fn create_table(&self) -> RouterResult<()> {
        Ok(())
    }

    async fn force_delete_table(&self) -> RouterResult<()> {
        self.rules.lock().unwrap().clear();
        Ok(())
    }

    async fn add_rule(&self, chain: &str, rule: &str) -> RouterResult<Option<u64>> {
        let mut next = self.next.lock().unwrap();
        *next += 1;
        self.rules.lock().unwrap().push(RuleEntry {
            chain: chain.to_string(),
            rule: rule.to_string(),
            handle: *next,
        });
        Ok(Some(*next))
    }

    async fn delete_rule(&self, _chain: &str, handle: u64) -> RouterResult<()> {
        self.rules.lock().unwrap().retain(|r| r.handle != handle);
        Ok(())
    }

    async fn list_rules(&self) -> RouterResult<Vec<RuleEntry>> {
        Ok(self.rules())
    }
}

/// Interface list the test edits between passes
#[derive(Default)]
pub struct ListLinks {
    pub names: Mutex<Vec<String>>,
}

impl ListLinks {
    pub fn set(&self, names: &[&str]) {
        *self.names.lock().unwrap() = names.iter().map(|s| s.to_string()).collect();
    }
}

#[async_trait]
impl LinkSource for ListLinks {
    async fn list_interfaces(&self) -> RouterResult<Vec<String>> {
        Ok(self.names.lock().unwrap().clone())
    }
}

/// Link source failing its first `failures` listings
pub struct FlakyLinks {
    pub failures: Mutex<usize>,
    pub names: Vec<String>,
}

impl FlakyLinks {
    pub fn new(failures: usize, names: &[&str]) -> Self {
        Self {
            failures: Mutex::new(failures),
            names: names.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[async_trait]
impl LinkSource for FlakyLinks {
    async fn list_interfaces(&self) -> RouterResult<Vec<String>> {
        let mut failures = self.failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(RouterError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "/sys/class/net unreadable",
            )));
        }
        Ok(self.names.clone())
    }
}

/// Calls made on [`FakePlugin`]s, shared across all of them
pub type CallLog = Arc<Mutex<Vec<String>>>;

/// Plugin recording every callback. It claims interfaces whose name
/// starts with `claims`.
pub struct FakePlugin {
    descriptor: PluginDescriptor,
    log: CallLog,
    claims: Option<String>,
    info: Value,
}

impl FakePlugin {
    pub fn new(descriptor: PluginDescriptor, log: CallLog) -> Self {
        Self {
            descriptor,
            log,
            claims: None,
            info: Value::Null,
        }
    }

    pub fn claiming(mut self, prefix: &str) -> Self {
        self.claims = Some(prefix.to_string());
        self
    }

    pub fn with_info(mut self, info: Value) -> Self {
        self.info = info;
        self
    }

    fn record(&self, call: String) {
        self.log.lock().unwrap().push(call);
    }
}

#[async_trait]
impl RouterPlugin for FakePlugin {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    async fn init(&mut self, config: Value, _ctx: &PluginContext) -> RouterResult<()> {
        self.record(format!("init {} {}", self.descriptor.full_name(), config));
        Ok(())
    }

    async fn start(&mut self) -> RouterResult<()> {
        self.record(format!("start {}", self.descriptor.full_name()));
        Ok(())
    }

    async fn dispose(&mut self) -> RouterResult<()> {
        self.record(format!("dispose {}", self.descriptor.full_name()));
        Ok(())
    }

    async fn interface_appear(&mut self, interface: &str, bridge: Option<&str>) -> bool {
        self.record(format!(
            "offer {} {} {}",
            self.descriptor.full_name(),
            interface,
            bridge.unwrap_or("-")
        ));
        self.claims
            .as_deref()
            .is_some_and(|prefix| interface.starts_with(prefix))
    }

    async fn interface_disappear(&mut self, interface: &str) {
        self.record(format!("gone {} {}", self.descriptor.full_name(), interface));
    }

    async fn manager_appear(&mut self, other: &PluginDescriptor) {
        self.record(format!("manager {} sees {}", self.descriptor.full_name(), other.full_name()));
    }

    fn router_info(&self) -> Value {
        self.info.clone()
    }
}

pub fn new_log() -> CallLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn entries(log: &CallLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

pub fn context(dir: &Path) -> PluginContext {
    let (router, _) = RouterHandle::channel();
    PluginContext {
        uuid: Uuid::new_v4(),
        etc_dir: dir.join("etc"),
        tmp_dir: dir.join("tmp"),
        var_dir: dir.join("var"),
        default_bridge: "br-lan".to_string(),
        router,
        managers: ManagerRegistry::new(),
        prefix_pool: PrefixPool::new(dir.join("var").join("prefix-pool.json"), vec![net("10.0.0.0/8")])
            .into_shared(),
    }
}

pub fn net(text: &str) -> Ipv4Net {
    text.parse().unwrap()
}

pub fn ip(text: &str) -> Ipv4Addr {
    text.parse().unwrap()
}

pub fn empty_config() -> Value {
    json!({})
}
