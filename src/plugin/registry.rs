//! Registry of active manager plugins
//!
//! Every plugin receives a clone of the registry in its [`PluginContext`]
//! and can look managers up by full or bare name at any time. A manager may
//! also publish a typed handle during `init` that other plugins fetch with
//! [`ManagerRegistry::handle`].
//!
//! [`PluginContext`]: super::traits::PluginContext

use super::traits::PluginDescriptor;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

type SharedHandle = Arc<dyn Any + Send + Sync>;

#[derive(Default)]
struct Inner {
    /// full name -> descriptor, for active managers only
    managers: BTreeMap<String, PluginDescriptor>,
    /// full name -> published handle
    handles: BTreeMap<String, SharedHandle>,
}

#[derive(Clone, Default)]
pub struct ManagerRegistry {
    inner: Arc<RwLock<Inner>>,
}

impl fmt::Debug for ManagerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerRegistry")
            .field("managers", &self.names())
            .finish()
    }
}

impl ManagerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(&self, descriptor: &PluginDescriptor) {
        debug!("Manager {} registered", descriptor.full_name());
        self.write()
            .managers
            .insert(descriptor.full_name(), descriptor.clone());
    }

    pub(crate) fn unregister(&self, full_name: &str) {
        let mut inner = self.write();
        inner.handles.remove(full_name);
        if inner.managers.remove(full_name).is_some() {
            debug!("Manager {} unregistered", full_name);
        }
    }

    /// Share an API object under a manager's full name. It becomes visible
    /// through [`handle`](Self::handle) once the manager is active.
    pub fn publish<T: Any + Send + Sync>(&self, full_name: &str, handle: Arc<T>) {
        self.write().handles.insert(full_name.to_string(), handle);
    }

    /// Full name of the active manager called `name`. A bare name matches
    /// the first manager with that name in full-name order.
    fn resolve(inner: &Inner, name: &str) -> Option<String> {
        if inner.managers.contains_key(name) {
            return Some(name.to_string());
        }
        inner
            .managers
            .values()
            .find(|desc| desc.name == name)
            .map(PluginDescriptor::full_name)
    }

    pub fn lookup(&self, name: &str) -> Option<PluginDescriptor> {
        let inner = self.read();
        Self::resolve(&inner, name).and_then(|full_name| inner.managers.get(&full_name).cloned())
    }

    pub fn contains(&self, name: &str) -> bool {
        Self::resolve(&self.read(), name).is_some()
    }

    /// Handle published by an active manager, if it has the requested type
    pub fn handle<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        let inner = self.read();
        let full_name = Self::resolve(&inner, name)?;
        inner.handles.get(&full_name)?.clone().downcast::<T>().ok()
    }

    /// Full names of active managers
    pub fn names(&self) -> Vec<String> {
        self.read().managers.keys().cloned().collect()
    }
}
