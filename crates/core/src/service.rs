//! Shared service registry handed to every in-process plugin.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

/// A type-erased service instance.
pub type Service = Arc<dyn Any + Send + Sync>;

/// Services exposed by one plugin, keyed by name.
pub type Services = HashMap<String, Service>;

/// Owner recorded for services seeded by the host.
pub const HOST_OWNER: &str = "<host>";

#[derive(Clone)]
struct ServiceEntry {
    owner: String,
    service: Service,
}

/// Result of flushing a plugin's services into the map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    /// Keys inserted or replaced.
    pub written: Vec<String>,
    /// Keys refused because another owner holds them.
    pub rejected: Vec<String>,
    /// Stale keys of the flushing plugin that were dropped.
    pub removed: Vec<String>,
}

/// Name → service map shared between the loader and every plugin context.
///
/// Cloning is cheap and yields a handle to the same map.
#[derive(Clone, Default)]
pub struct SharedServiceMap {
    inner: Arc<RwLock<HashMap<String, ServiceEntry>>>,
}

impl SharedServiceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a host-owned service. Host keys are never overwritten by plugins.
    pub fn insert_host(&self, name: impl Into<String>, service: Service) {
        self.inner.write().insert(
            name.into(),
            ServiceEntry {
                owner: HOST_OWNER.to_string(),
                service,
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<Service> {
        self.inner.read().get(name).map(|e| Arc::clone(&e.service))
    }

    /// Returns the service downcast to `T`.
    pub fn get_as<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.get(name).and_then(|s| s.downcast::<T>().ok())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.read().contains_key(name)
    }

    pub fn owner(&self, name: &str) -> Option<String> {
        self.inner.read().get(name).map(|e| e.owner.clone())
    }

    /// All keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Keys owned by `owner`, sorted.
    pub fn keys_owned_by(&self, owner: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .inner
            .read()
            .iter()
            .filter(|(_, e)| e.owner == owner)
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Wave flush: only keys that do not exist yet are inserted.
    pub fn flush_additive(&self, owner: &str, services: Services) -> FlushOutcome {
        let mut outcome = FlushOutcome::default();
        let mut map = self.inner.write();

        for (name, service) in sorted(services) {
            if let Some(existing) = map.get(&name) {
                warn!(
                    plugin = %owner,
                    service = %name,
                    holder = %existing.owner,
                    "service key already registered, rejecting"
                );
                outcome.rejected.push(name);
                continue;
            }
            map.insert(
                name.clone(),
                ServiceEntry {
                    owner: owner.to_string(),
                    service,
                },
            );
            outcome.written.push(name);
        }

        outcome
    }

    /// Reload flush: `owner` may replace its own keys and add new ones.
    ///
    /// Keys it owned before but no longer exposes are removed so nobody keeps
    /// resolving objects from the previous instance.
    pub fn flush_reload(&self, owner: &str, services: Services) -> FlushOutcome {
        let mut outcome = FlushOutcome::default();
        let mut map = self.inner.write();

        let stale: Vec<String> = map
            .iter()
            .filter(|(k, e)| e.owner == owner && !services.contains_key(*k))
            .map(|(k, _)| k.clone())
            .collect();
        for name in stale {
            map.remove(&name);
            outcome.removed.push(name);
        }
        outcome.removed.sort();

        for (name, service) in sorted(services) {
            if let Some(existing) = map.get(&name)
                && existing.owner != owner
            {
                warn!(
                    plugin = %owner,
                    service = %name,
                    holder = %existing.owner,
                    "reload cannot overwrite a key owned by someone else"
                );
                outcome.rejected.push(name);
                continue;
            }
            map.insert(
                name.clone(),
                ServiceEntry {
                    owner: owner.to_string(),
                    service,
                },
            );
            outcome.written.push(name);
        }

        outcome
    }

    /// Drops every key owned by `owner`, returning them sorted.
    pub fn remove_owned_by(&self, owner: &str) -> Vec<String> {
        let mut map = self.inner.write();
        let mut removed: Vec<String> = map
            .iter()
            .filter(|(_, e)| e.owner == owner)
            .map(|(k, _)| k.clone())
            .collect();
        for name in &removed {
            map.remove(name);
        }
        removed.sort();
        removed
    }
}

fn sorted(services: Services) -> Vec<(String, Service)> {
    let mut entries: Vec<(String, Service)> = services.into_iter().collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries
}

impl fmt::Debug for SharedServiceMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedServiceMap")
            .field("keys", &self.keys())
            .finish()
    }
}
