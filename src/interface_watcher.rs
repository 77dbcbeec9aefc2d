//! Physical interface hot-plug
//!
//! A periodic pass compares the interfaces present in the system with the
//! tracked set. New interfaces are offered to plugins once; the first
//! plugin to claim one owns it until it disappears. Interfaces nobody
//! claims stay tracked as unmanaged and are not offered again.

use crate::error::RouterResult;
use crate::plugin::PluginLifecycleManager;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Source of the current interface names
#[async_trait]
pub trait LinkSource: Send + Sync {
    async fn list_interfaces(&self) -> RouterResult<Vec<String>>;
}

/// Reads interface names from `/sys/class/net`
pub struct SysfsLinkSource {
    root: PathBuf,
}

impl SysfsLinkSource {
    pub fn new() -> Self {
        Self::with_root(PathBuf::from("/sys/class/net"))
    }

    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }
}

impl Default for SysfsLinkSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LinkSource for SysfsLinkSource {
    async fn list_interfaces(&self) -> RouterResult<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Ok(name) = entry.file_name().into_string() {
                names.push(name);
            }
        }
        Ok(names)
    }
}

/// Changes applied by one pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// (interface, owner full name or None when unmanaged)
    pub appeared: Vec<(String, Option<String>)>,
    pub disappeared: Vec<String>,
}

pub struct InterfaceWatcher {
    source: Arc<dyn LinkSource>,
    prefixes: Vec<String>,
    bridge: String,
    interval: Duration,
    /// interface -> owning plugin, None when unmanaged
    tracked: BTreeMap<String, Option<String>>,
}

impl InterfaceWatcher {
    pub fn new(source: Arc<dyn LinkSource>, prefixes: Vec<String>, bridge: String, interval: Duration) -> Self {
        Self {
            source,
            prefixes,
            bridge,
            interval,
            tracked: BTreeMap::new(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// One polling pass. Never fails: errors are logged and the view stays
    /// as it was until the next pass.
    pub async fn tick(&mut self, plugins: &mut PluginLifecycleManager) -> TickReport {
        match self.poll(plugins).await {
            Ok(report) => report,
            Err(e) => {
                error!("Interface poll failed: {}", e);
                TickReport::default()
            }
        }
    }

    async fn poll(&mut self, plugins: &mut PluginLifecycleManager) -> RouterResult<TickReport> {
        let present: BTreeSet<String> = self
            .source
            .list_interfaces()
            .await?
            .into_iter()
            .filter(|name| self.is_physical(name))
            .collect();

        let mut report = TickReport::default();

        let gone: Vec<String> = self
            .tracked
            .keys()
            .filter(|name| !present.contains(*name))
            .cloned()
            .collect();
        for name in gone {
            if let Some(Some(owner)) = self.tracked.remove(&name) {
                plugins.interface_disappear(&owner, &name).await;
            }
            info!("Interface {} disappeared", name);
            report.disappeared.push(name);
        }

        for name in present {
            if self.tracked.contains_key(&name) {
                continue;
            }
            let owner = plugins.offer_interface(&name, &self.bridge).await;
            match &owner {
                Some(owner) => info!("Interface {} assigned to {}", name, owner),
                None => info!("Interface {} left unmanaged", name),
            }
            self.tracked.insert(name.clone(), owner.clone());
            report.appeared.push((name, owner));
        }

        debug!("Tracking {} interface(s)", self.tracked.len());
        Ok(report)
    }

    fn is_physical(&self, name: &str) -> bool {
        self.prefixes.iter().any(|prefix| name.starts_with(prefix.as_str()))
    }

    pub fn owner(&self, interface: &str) -> Option<Option<&str>> {
        self.tracked.get(interface).map(|owner| owner.as_deref())
    }

    /// interface -> owner or null
    pub fn snapshot(&self) -> Value {
        let map: serde_json::Map<String, Value> = self
            .tracked
            .iter()
            .map(|(name, owner)| (name.clone(), json!(owner)))
            .collect();
        Value::Object(map)
    }
}
