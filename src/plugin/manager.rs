//! Plugin lifecycle manager - dependency ordering, activation and teardown

use super::config::PluginConfigStore;
use super::registry::ManagerRegistry;
use super::traits::{PluginCapability, PluginContext, PluginDescriptor, PluginState, RouterPlugin};
use crate::error::{RouterError, RouterResult};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use tracing::{error, info, warn};

/// Compute an activation order over `descriptors`.
///
/// Every plugin comes after all plugins named in its `init_after`. A
/// dependency may name a plugin by full name or by bare name; a bare name
/// matching several plugins makes all of them dependencies. Ties are broken
/// by full name so the order is stable across runs.
pub fn activation_order(descriptors: &[PluginDescriptor]) -> RouterResult<Vec<usize>> {
    let mut by_full_name: HashMap<String, usize> = HashMap::new();
    let mut by_name: HashMap<&str, Vec<usize>> = HashMap::new();

    for (idx, desc) in descriptors.iter().enumerate() {
        if by_full_name.insert(desc.full_name(), idx).is_some() {
            return Err(RouterError::AlreadyExists(format!(
                "Plugin {} discovered twice",
                desc.full_name()
            )));
        }
        by_name.entry(desc.name.as_str()).or_default().push(idx);
    }

    let mut indegree = vec![0usize; descriptors.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); descriptors.len()];

    for (idx, desc) in descriptors.iter().enumerate() {
        let mut deps = BTreeSet::new();
        for dependency in &desc.init_after {
            let resolved: Vec<usize> = match by_full_name.get(dependency) {
                Some(&dep) => vec![dep],
                None => by_name.get(dependency.as_str()).cloned().unwrap_or_default(),
            };
            if resolved.is_empty() {
                return Err(RouterError::UnknownDependency {
                    plugin: desc.full_name(),
                    dependency: dependency.clone(),
                });
            }
            deps.extend(resolved);
        }
        for dep in deps {
            indegree[idx] += 1;
            dependents[dep].push(idx);
        }
    }

    let mut ready: BTreeSet<(String, usize)> = descriptors
        .iter()
        .enumerate()
        .filter(|(idx, _)| indegree[*idx] == 0)
        .map(|(idx, desc)| (desc.full_name(), idx))
        .collect();

    let mut order = Vec::with_capacity(descriptors.len());
    while let Some((_, idx)) = ready.pop_first() {
        order.push(idx);
        for &next in &dependents[idx] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.insert((descriptors[next].full_name(), next));
            }
        }
    }

    if order.len() < descriptors.len() {
        let mut stuck: Vec<String> = descriptors
            .iter()
            .enumerate()
            .filter(|(idx, _)| indegree[*idx] > 0)
            .map(|(_, desc)| desc.full_name())
            .collect();
        stuck.sort();
        return Err(RouterError::DependencyCycle(stuck));
    }

    Ok(order)
}

struct Slot {
    plugin: Box<dyn RouterPlugin>,
    state: PluginState,
}

/// Owns every active plugin, in activation order
pub struct PluginLifecycleManager {
    configs: PluginConfigStore,
    active: Vec<Slot>,
    disposed: Vec<String>,
    /// Registry of the context the plugins were activated with
    registry: ManagerRegistry,
}

impl PluginLifecycleManager {
    pub fn new(configs: PluginConfigStore) -> Self {
        Self {
            configs,
            active: Vec::new(),
            disposed: Vec::new(),
            registry: ManagerRegistry::new(),
        }
    }

    pub fn configs(&self) -> &PluginConfigStore {
        &self.configs
    }

    /// Activate all discovered plugins in dependency order.
    ///
    /// The graph is checked before anything is activated. A plugin failing
    /// to initialize aborts the remaining activations; plugins already
    /// active stay registered so that [`dispose_all`](Self::dispose_all)
    /// tears them down.
    pub async fn activate_all(
        &mut self,
        plugins: Vec<Box<dyn RouterPlugin>>,
        ctx: &PluginContext,
    ) -> RouterResult<()> {
        self.registry = ctx.managers.clone();
        let descriptors: Vec<PluginDescriptor> = plugins.iter().map(|p| p.descriptor().clone()).collect();
        let order = activation_order(&descriptors)?;

        let mut pending: Vec<Option<Box<dyn RouterPlugin>>> = plugins.into_iter().map(Some).collect();
        info!(
            "Activating {} plugin(s): {}",
            order.len(),
            order
                .iter()
                .map(|&idx| descriptors[idx].full_name())
                .collect::<Vec<_>>()
                .join(", ")
        );

        for idx in order {
            if let Some(plugin) = pending[idx].take() {
                self.activate(plugin, ctx).await?;
            }
        }
        Ok(())
    }

    async fn activate(&mut self, mut plugin: Box<dyn RouterPlugin>, ctx: &PluginContext) -> RouterResult<()> {
        let desc = plugin.descriptor().clone();
        let full_name = desc.full_name();

        let config = self.configs.load(&desc).await?;
        let result = match plugin.init(config, ctx).await {
            Ok(()) => plugin.start().await.map_err(|e| ("start", e)),
            Err(e) => Err(("initialize", e)),
        };
        if let Err((phase, e)) = result {
            error!("Failed to {} plugin {}: {}", phase, full_name, e);
            if let Err(e) = plugin.dispose().await {
                warn!("Failed to dispose plugin {} after {} failure: {}", full_name, phase, e);
            }
            ctx.managers.unregister(&full_name);
            return Err(e);
        }

        // Managers learn about each other, in activation order
        if desc.is_manager() {
            for slot in &mut self.active {
                if slot.plugin.descriptor().is_manager() {
                    slot.plugin.manager_appear(&desc).await;
                }
            }
            for slot in &self.active {
                let earlier = slot.plugin.descriptor();
                if earlier.is_manager() {
                    plugin.manager_appear(earlier).await;
                }
            }
            ctx.managers.register(&desc);
        }

        self.active.push(Slot {
            plugin,
            state: PluginState::Active,
        });
        info!("Plugin {} activated", full_name);
        Ok(())
    }

    /// Dispose every plugin, last activated first. Failures are logged and
    /// the remaining plugins are still disposed.
    pub async fn dispose_all(&mut self) -> usize {
        let mut failures = 0;
        while let Some(mut slot) = self.active.pop() {
            let full_name = slot.plugin.descriptor().full_name();
            self.registry.unregister(&full_name);
            match slot.plugin.dispose().await {
                Ok(()) => info!("Plugin {} disposed", full_name),
                Err(e) => {
                    failures += 1;
                    error!("Failed to dispose plugin {}: {}", full_name, e);
                }
            }
            self.disposed.push(full_name);
        }
        failures
    }

    /// Offer a new interface: the WAN plugin first, then each LAN plugin in
    /// activation order. Returns the full name of the plugin that took it.
    pub async fn offer_interface(&mut self, interface: &str, bridge: &str) -> Option<String> {
        let wan = self
            .active
            .iter()
            .position(|slot| slot.plugin.descriptor().has(PluginCapability::WanConnection));

        if let Some(idx) = wan {
            let slot = &mut self.active[idx];
            if slot.plugin.interface_appear(interface, None).await {
                return Some(slot.plugin.descriptor().full_name());
            }
        }

        for (idx, slot) in self.active.iter_mut().enumerate() {
            if Some(idx) == wan || !slot.plugin.descriptor().has(PluginCapability::LanInterface) {
                continue;
            }
            if slot.plugin.interface_appear(interface, Some(bridge)).await {
                return Some(slot.plugin.descriptor().full_name());
            }
        }

        None
    }

    pub async fn interface_disappear(&mut self, owner: &str, interface: &str) {
        match self.find_mut(owner) {
            Some(plugin) => plugin.interface_disappear(interface).await,
            None => warn!("Owner {} of {} is no longer active", owner, interface),
        }
    }

    pub fn get(&self, full_name: &str) -> Option<&dyn RouterPlugin> {
        self.active
            .iter()
            .find(|slot| slot.plugin.descriptor().full_name() == full_name)
            .map(|slot| slot.plugin.as_ref())
    }

    fn find_mut(&mut self, full_name: &str) -> Option<&mut Box<dyn RouterPlugin>> {
        self.active
            .iter_mut()
            .find(|slot| slot.plugin.descriptor().full_name() == full_name)
            .map(|slot| &mut slot.plugin)
    }

    pub fn state(&self, full_name: &str) -> PluginState {
        self.active
            .iter()
            .find(|slot| slot.plugin.descriptor().full_name() == full_name)
            .map(|slot| slot.state)
            .unwrap_or_else(|| {
                if self.disposed.iter().any(|name| name == full_name) {
                    PluginState::Disposed
                } else {
                    PluginState::Uninitialized
                }
            })
    }

    /// Full names in activation order
    pub fn active_names(&self) -> Vec<String> {
        self.active
            .iter()
            .map(|slot| slot.plugin.descriptor().full_name())
            .collect()
    }

    /// Bare names of active plugins with `capability`
    pub fn names_with(&self, capability: PluginCapability) -> Vec<String> {
        self.active
            .iter()
            .map(|slot| slot.plugin.descriptor())
            .filter(|desc| desc.has(capability))
            .map(|desc| desc.name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Merge every plugin's status object, later plugins winning on key clashes
    pub fn router_info(&self) -> Map<String, Value> {
        let mut merged = Map::new();
        for slot in &self.active {
            match slot.plugin.router_info() {
                Value::Object(info) => merged.extend(info),
                Value::Null => {}
                other => {
                    merged.insert(slot.plugin.descriptor().full_name(), other);
                }
            }
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(category: &str, name: &str, after: &[&str]) -> PluginDescriptor {
        let mut d = PluginDescriptor::new(category, name);
        d.init_after = after.iter().map(|s| s.to_string()).collect();
        d
    }

    fn names(descs: &[PluginDescriptor], order: &[usize]) -> Vec<String> {
        order.iter().map(|&i| descs[i].full_name()).collect()
    }

    #[test]
    fn test_dependencies_precede_dependents() {
        let descs = vec![
            desc("manager", "cascade", &["vpns", "manager-traffic"]),
            desc("manager", "traffic", &[]),
            desc("manager", "vpns", &["traffic"]),
            desc("manager", "apiserver", &[]),
        ];
        let order = activation_order(&descs).unwrap();
        assert_eq!(
            names(&descs, &order),
            vec!["manager-apiserver", "manager-traffic", "manager-vpns", "manager-cascade"]
        );
    }

    #[test]
    fn test_order_is_deterministic() {
        let descs = vec![
            desc("manager", "b", &[]),
            desc("manager", "a", &[]),
            desc("lif", "c", &["a"]),
        ];
        let first = activation_order(&descs).unwrap();
        let second = activation_order(&descs).unwrap();
        assert_eq!(first, second);
        assert_eq!(names(&descs, &first), vec!["manager-a", "lif-c", "manager-b"]);
    }

    #[test]
    fn test_cycle_is_rejected() {
        let descs = vec![
            desc("manager", "a", &["b"]),
            desc("manager", "b", &["c"]),
            desc("manager", "c", &["a"]),
            desc("manager", "free", &[]),
        ];
        match activation_order(&descs) {
            Err(RouterError::DependencyCycle(members)) => {
                assert_eq!(members, vec!["manager-a", "manager-b", "manager-c"]);
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let descs = vec![desc("manager", "a", &["a"])];
        assert!(matches!(activation_order(&descs), Err(RouterError::DependencyCycle(_))));
    }

    #[test]
    fn test_unknown_dependency_is_fatal() {
        let descs = vec![desc("manager", "a", &["missing"])];
        let err = activation_order(&descs).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_duplicate_plugin_rejected() {
        let descs = vec![desc("manager", "a", &[]), desc("manager", "a", &[])];
        assert!(matches!(activation_order(&descs), Err(RouterError::AlreadyExists(_))));
    }
}
