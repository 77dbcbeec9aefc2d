//! Traffic manager
//!
//! Holds the WAN service and traffic facility group tables exposed over
//! IPC, the local DNS forwarder, the traffic plugins and the WAN
//! masquerade rule.

use super::dns_forwarder::DnsForwarder;
use super::facility::{validate_facility_group, Facility};
use crate::error::{RouterError, RouterResult};
use crate::nft::{Nftables, CHAIN_NAT_POST};
use crate::plugin::{PluginConfigStore, PluginContext, PluginLifecycleManager, RouterPlugin};
use crate::validation::validate_interface_name;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct Owned<T> {
    value: T,
    /// IPC caller that created the entry
    owner: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TfacGroup {
    pub priority: i32,
    pub facilities: Vec<Facility>,
}

struct Masquerade {
    interface: String,
    handle: Option<u64>,
}

fn masquerade_rule(interface: &str) -> String {
    format!("oifname \"{}\" masquerade", interface)
}

pub struct TrafficManager {
    nft: Arc<dyn Nftables>,
    forwarder: Option<DnsForwarder>,
    plugins: PluginLifecycleManager,
    wan_services: BTreeMap<String, Owned<Value>>,
    tfac_groups: BTreeMap<String, Owned<TfacGroup>>,
    masquerade: Option<Masquerade>,
}

impl TrafficManager {
    /// `etc_dir` holds the `traffic-<name>.json` plugin configs
    pub fn new(nft: Arc<dyn Nftables>, etc_dir: PathBuf) -> Self {
        Self {
            nft,
            forwarder: None,
            plugins: PluginLifecycleManager::new(PluginConfigStore::new(etc_dir)),
            wan_services: BTreeMap::new(),
            tfac_groups: BTreeMap::new(),
            masquerade: None,
        }
    }

    pub fn with_forwarder(mut self, forwarder: DnsForwarder) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    /// Start the DNS forwarder, if one is attached
    pub async fn start(&mut self) -> RouterResult<()> {
        if let Some(forwarder) = self.forwarder.as_mut() {
            forwarder.start().await?;
        }
        Ok(())
    }

    /// Activate the traffic plugins that have a config file; the others
    /// stay dormant. Each gets its own scratch and persistent directory.
    pub async fn activate_plugins(
        &mut self,
        plugins: Vec<Box<dyn RouterPlugin>>,
        ctx: &PluginContext,
    ) -> RouterResult<()> {
        let mut configured = Vec::with_capacity(plugins.len());
        for plugin in plugins {
            let desc = plugin.descriptor().clone();
            if !self.plugins.configs().exists(&desc).await {
                debug!("Traffic plugin {} has no config, skipped", desc.full_name());
                continue;
            }
            fs::create_dir_all(ctx.plugin_tmp_dir(&desc)).await?;
            fs::create_dir_all(ctx.plugin_var_dir(&desc)).await?;
            configured.push(plugin);
        }
        self.plugins.activate_all(configured, ctx).await
    }

    /// Full names of the active traffic plugins
    pub fn plugin_names(&self) -> Vec<String> {
        self.plugins.active_names()
    }

    /// Status objects of the traffic plugins
    pub fn plugin_info(&self) -> serde_json::Map<String, Value> {
        self.plugins.router_info()
    }

    /// Stop the traffic plugins, remove the masquerade rule and stop the
    /// forwarder. Every step is attempted even if an earlier one fails.
    pub async fn dispose(&mut self) {
        let failures = self.plugins.dispose_all().await;
        if failures > 0 {
            warn!("{} traffic plugin(s) failed to stop", failures);
        }
        self.on_wan_down().await;
        if let Some(forwarder) = self.forwarder.as_mut() {
            if let Err(e) = forwarder.stop().await {
                warn!("Failed to stop DNS forwarder: {}", e);
            }
        }
        info!("Traffic manager disposed");
    }

    pub fn dns_port(&self) -> Option<u16> {
        self.forwarder.as_ref().and_then(DnsForwarder::port)
    }

    pub fn has_wan_service(&self, name: &str) -> bool {
        self.wan_services.contains_key(name)
    }

    pub fn add_wan_service(&mut self, name: &str, service: Value, owner: Option<&str>) -> RouterResult<()> {
        if name.is_empty() {
            return Err(RouterError::InvalidParameter("WAN service name cannot be empty".to_string()));
        }
        if self.has_wan_service(name) {
            return Err(RouterError::AlreadyExists(format!("WAN service \"{}\" already exists.", name)));
        }
        self.wan_services.insert(
            name.to_string(),
            Owned {
                value: service,
                owner: owner.map(str::to_string),
            },
        );
        info!("WAN service \"{}\" added", name);
        Ok(())
    }

    pub fn remove_wan_service(&mut self, name: &str) -> RouterResult<()> {
        self.wan_services
            .remove(name)
            .ok_or_else(|| RouterError::NotFound(format!("WAN service \"{}\" does not exist.", name)))?;
        info!("WAN service \"{}\" removed", name);
        Ok(())
    }

    pub fn wan_service(&self, name: &str) -> Option<&Value> {
        self.wan_services.get(name).map(|entry| &entry.value)
    }

    pub fn has_tfac_group(&self, name: &str) -> bool {
        self.tfac_groups.contains_key(name)
    }

    /// Validate and store a new group. Nothing is stored if any facility is invalid.
    pub fn add_tfac_group(&mut self, name: &str, priority: i32, group: &Value, owner: Option<&str>) -> RouterResult<()> {
        if name.is_empty() {
            return Err(RouterError::InvalidParameter(
                "Traffic facility group name cannot be empty".to_string(),
            ));
        }
        if self.has_tfac_group(name) {
            return Err(RouterError::AlreadyExists(format!(
                "Traffic facility group \"{}\" already exists.",
                name
            )));
        }
        let facilities = validate_facility_group(group)?;

        self.tfac_groups.insert(
            name.to_string(),
            Owned {
                value: TfacGroup { priority, facilities },
                owner: owner.map(str::to_string),
            },
        );
        info!("Traffic facility group \"{}\" added (priority {})", name, priority);
        Ok(())
    }

    /// Replace the facilities of an existing group, keeping its priority and owner
    pub fn change_tfac_group(&mut self, name: &str, group: &Value) -> RouterResult<()> {
        let entry = self.tfac_groups.get_mut(name).ok_or_else(|| {
            RouterError::NotFound(format!("Traffic facility group \"{}\" does not exist.", name))
        })?;
        entry.value.facilities = validate_facility_group(group)?;
        info!("Traffic facility group \"{}\" changed", name);
        Ok(())
    }

    pub fn remove_tfac_group(&mut self, name: &str) -> RouterResult<()> {
        self.tfac_groups.remove(name).ok_or_else(|| {
            RouterError::NotFound(format!("Traffic facility group \"{}\" does not exist.", name))
        })?;
        info!("Traffic facility group \"{}\" removed", name);
        Ok(())
    }

    pub fn tfac_group(&self, name: &str) -> Option<&TfacGroup> {
        self.tfac_groups.get(name).map(|entry| &entry.value)
    }

    /// Drop every WAN service and group created by `owner`. Returns the
    /// number of entries removed.
    pub fn remove_owned_by(&mut self, owner: &str) -> usize {
        let mut removed = 0;

        self.wan_services.retain(|name, entry| {
            let keep = entry.owner.as_deref() != Some(owner);
            if !keep {
                info!("WAN service \"{}\" removed, owner {} vanished", name, owner);
                removed += 1;
            }
            keep
        });

        self.tfac_groups.retain(|name, entry| {
            let keep = entry.owner.as_deref() != Some(owner);
            if !keep {
                info!("Traffic facility group \"{}\" removed, owner {} vanished", name, owner);
                removed += 1;
            }
            keep
        });

        removed
    }

    /// Masquerade outgoing traffic on the WAN interface
    pub async fn on_wan_up(&mut self, interface: &str) -> RouterResult<()> {
        validate_interface_name(interface)?;
        if self.masquerade.as_ref().is_some_and(|m| m.interface == interface) {
            return Ok(());
        }
        self.on_wan_down().await;

        let handle = self.nft.add_rule(CHAIN_NAT_POST, &masquerade_rule(interface)).await?;
        self.masquerade = Some(Masquerade {
            interface: interface.to_string(),
            handle,
        });
        info!("Masquerading on {}", interface);
        Ok(())
    }

    /// Remove the masquerade rule, best-effort
    pub async fn on_wan_down(&mut self) {
        let Some(masquerade) = self.masquerade.take() else {
            return;
        };

        let handle = match masquerade.handle {
            Some(handle) => Some(handle),
            None => {
                let rule = masquerade_rule(&masquerade.interface);
                match self.nft.list_rules().await {
                    Ok(rules) => rules
                        .into_iter()
                        .find(|entry| entry.chain == CHAIN_NAT_POST && entry.rule == rule)
                        .map(|entry| entry.handle),
                    Err(e) => {
                        warn!("Failed to list rules: {}", e);
                        None
                    }
                }
            }
        };

        if let Some(handle) = handle {
            if let Err(e) = self.nft.delete_rule(CHAIN_NAT_POST, handle).await {
                warn!("Failed to remove masquerade on {}: {}", masquerade.interface, e);
                return;
            }
        }
        info!("Masquerade on {} removed", masquerade.interface);
    }

    pub fn masquerade_interface(&self) -> Option<&str> {
        self.masquerade.as_ref().map(|m| m.interface.as_str())
    }

    pub fn wan_service_names(&self) -> Vec<String> {
        self.wan_services.keys().cloned().collect()
    }

    /// name -> {priority}
    pub fn tfac_group_snapshot(&self) -> Value {
        let map: serde_json::Map<String, Value> = self
            .tfac_groups
            .iter()
            .map(|(name, entry)| (name.clone(), json!({ "priority": entry.value.priority })))
            .collect();
        Value::Object(map)
    }
}
