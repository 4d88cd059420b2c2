//! BeaconStore: last-write-wins reachability cache.
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use kingdom_transport::ConnectionMetadata;

use crate::types::DeviceId;

/// Latest known connection metadata per device.
///
/// Cheap to clone; clones share the map. There is no ordering between
/// writers: whoever writes last wins.
#[derive(Debug, Clone, Default)]
pub struct BeaconStore {
    inner: Arc<RwLock<HashMap<DeviceId, Vec<ConnectionMetadata>>>>,
}

impl BeaconStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &DeviceId) -> Option<Vec<ConnectionMetadata>> {
        let map = self.inner.read().unwrap_or_else(|p| p.into_inner());
        map.get(id).cloned()
    }

    /// Store `metadata` for `id`. Empty lists are ignored so a bare
    /// mention of a device never erases a usable address.
    pub fn put(&self, id: DeviceId, metadata: Vec<ConnectionMetadata>) {
        if metadata.is_empty() {
            return;
        }
        let mut map = self.inner.write().unwrap_or_else(|p| p.into_inner());
        map.insert(id, metadata);
    }

    pub fn remove(&self, id: &DeviceId) -> Option<Vec<ConnectionMetadata>> {
        let mut map = self.inner.write().unwrap_or_else(|p| p.into_inner());
        map.remove(id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kingdom_transport::TransportKind;

    fn id(s: &str) -> DeviceId {
        s.parse().unwrap()
    }

    #[test]
    fn last_write_wins() {
        let store = BeaconStore::new();
        store.put(id("a"), vec![ConnectionMetadata::new(TransportKind::Tcp, "1.1.1.1:1")]);
        store.put(id("a"), vec![ConnectionMetadata::new(TransportKind::Tcp, "2.2.2.2:2")]);
        assert_eq!(store.get(&id("a")).unwrap()[0].address, "2.2.2.2:2");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn empty_metadata_does_not_erase() {
        let store = BeaconStore::new();
        store.put(id("a"), vec![ConnectionMetadata::memory(&id("a"))]);
        store.put(id("a"), vec![]);
        assert!(store.get(&id("a")).is_some());
        assert!(store.get(&id("b")).is_none());
    }

    #[test]
    fn clones_share_state() {
        let store = BeaconStore::new();
        let other = store.clone();
        other.put(id("x"), vec![ConnectionMetadata::memory(&id("x"))]);
        assert!(!store.is_empty());
        assert!(store.remove(&id("x")).is_some());
        assert!(other.is_empty());
    }
}
