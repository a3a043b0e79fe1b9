//! In-memory discovery backend for tests: multiple engines in one process
//! share a `Registry` instead of talking to a real multicast group.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::DiscoveryError;

use super::{BrowseEntry, DiscoveryBackend, LocalService};

#[derive(Default)]
struct Inner {
    services: HashMap<String, LocalService>,
}

/// Shared registry backing zero or more [`InMemoryBackend`] instances.
/// Clone freely — it's a handle around an `Arc<Mutex<_>>`.
#[derive(Clone, Default)]
pub struct Registry(Arc<Mutex<Inner>>);

/// Creates a fresh, empty registry.
pub fn shared_registry() -> Registry {
    Registry::default()
}

/// A [`DiscoveryBackend`] that advertises into and browses from a shared
/// in-process [`Registry`] instead of the network.
pub struct InMemoryBackend {
    registry: Registry,
    advertised_as: Mutex<Option<String>>,
}

impl InMemoryBackend {
    pub fn new(registry: Registry) -> Self {
        Self { registry, advertised_as: Mutex::new(None) }
    }
}

#[async_trait]
impl DiscoveryBackend for InMemoryBackend {
    async fn advertise(&self, service: &LocalService) -> Result<(), DiscoveryError> {
        let mut inner = self.registry.0.lock().expect("registry poisoned");
        inner.services.insert(service.device_name.clone(), service.clone());
        *self.advertised_as.lock().expect("mutex poisoned") = Some(service.device_name.clone());
        Ok(())
    }

    async fn browse(&self) -> Result<Vec<BrowseEntry>, DiscoveryError> {
        let inner = self.registry.0.lock().expect("registry poisoned");
        Ok(inner
            .services
            .values()
            .map(|s| BrowseEntry { peer_id: s.device_name.clone(), ip: s.ip, port: s.port })
            .collect())
    }

    async fn stop_advertising(&self) -> Result<(), DiscoveryError> {
        if let Some(name) = self.advertised_as.lock().expect("mutex poisoned").take() {
            self.registry.0.lock().expect("registry poisoned").services.remove(&name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn advertise_then_browse_sees_self() {
        let registry = shared_registry();
        let backend = InMemoryBackend::new(registry);
        let local = LocalService { device_name: "a".into(), ip: "127.0.0.1".parse().unwrap(), port: 1 };
        backend.advertise(&local).await.unwrap();
        let entries = backend.browse().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].peer_id, "a");
    }

    #[tokio::test]
    async fn stop_advertising_removes_entry() {
        let registry = shared_registry();
        let backend = InMemoryBackend::new(registry);
        let local = LocalService { device_name: "a".into(), ip: "127.0.0.1".parse().unwrap(), port: 1 };
        backend.advertise(&local).await.unwrap();
        backend.stop_advertising().await.unwrap();
        assert!(backend.browse().await.unwrap().is_empty());
    }
}
