//! Connection registry, the one shared mutable structure in the relay.
//!
//! Keyed by the subscriber's remote `ip:port`. Mutated concurrently by the
//! accept path, the close path, and the broadcast pruning path; each
//! operation is a single atomic key insert or remove, so no caller-side
//! locking or multi-step transaction exists anywhere.

use std::sync::Arc;

use dashmap::DashMap;

use crate::connection::RelayConnection;

/// Thread-safe map of connection key to live handle.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<String, Arc<RelayConnection>>,
}

impl ConnectionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a connection under its own key, replacing any stale entry
    /// left by a peer that reused the same address.
    pub fn insert(&self, conn: Arc<RelayConnection>) {
        let _ = self.connections.insert(conn.key().to_string(), conn);
    }

    /// Remove by key. Idempotent: removing an absent key returns `None`.
    pub fn remove(&self, key: &str) -> Option<Arc<RelayConnection>> {
        self.connections.remove(key).map(|(_, conn)| conn)
    }

    /// Remove by handle identity, for paths where the key cannot be
    /// recomputed reliably. Returns the removed key, if any.
    pub fn remove_value(&self, conn: &Arc<RelayConnection>) -> Option<String> {
        let key = self
            .connections
            .iter()
            .find(|entry| Arc::ptr_eq(entry.value(), conn))
            .map(|entry| entry.key().clone());
        if let Some(k) = &key {
            let _ = self.connections.remove(k);
        }
        key
    }

    /// Independent copy of the current handles. Iterating the snapshot
    /// never observes concurrent registry mutation; connections added after
    /// the snapshot are excluded, removals after it are not reflected.
    pub fn snapshot(&self) -> Vec<Arc<RelayConnection>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Number of tracked connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Drop every entry, marking each handle closed first so late senders
    /// observe the connections as gone.
    pub fn clear(&self) {
        for entry in self.connections.iter() {
            entry.value().mark_closed();
        }
        self.connections.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn conn(key: &str) -> Arc<RelayConnection> {
        let (tx, rx) = mpsc::channel(8);
        std::mem::forget(rx);
        Arc::new(RelayConnection::new(key, tx))
    }

    #[test]
    fn insert_and_remove_by_key() {
        let registry = ConnectionRegistry::new();
        assert!(registry.is_empty());

        registry.insert(conn("10.0.0.1:1111"));
        registry.insert(conn("10.0.0.2:2222"));
        assert_eq!(registry.len(), 2);

        assert!(registry.remove("10.0.0.1:1111").is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = ConnectionRegistry::new();
        registry.insert(conn("10.0.0.1:1111"));

        assert!(registry.remove("10.0.0.1:1111").is_some());
        assert!(registry.remove("10.0.0.1:1111").is_none());
        assert!(registry.remove("never-there").is_none());
    }

    #[test]
    fn insert_same_key_replaces() {
        let registry = ConnectionRegistry::new();
        let first = conn("10.0.0.1:1111");
        let second = conn("10.0.0.1:1111");

        registry.insert(Arc::clone(&first));
        registry.insert(Arc::clone(&second));
        assert_eq!(registry.len(), 1);

        let held = registry.remove("10.0.0.1:1111").unwrap();
        assert!(Arc::ptr_eq(&held, &second));
    }

    #[test]
    fn remove_value_finds_by_identity() {
        let registry = ConnectionRegistry::new();
        let a = conn("10.0.0.1:1111");
        let b = conn("10.0.0.2:2222");
        registry.insert(Arc::clone(&a));
        registry.insert(Arc::clone(&b));

        let removed = registry.remove_value(&a);
        assert_eq!(removed.as_deref(), Some("10.0.0.1:1111"));
        assert_eq!(registry.len(), 1);

        // Second removal of the same handle is a no-op.
        assert!(registry.remove_value(&a).is_none());
    }

    #[test]
    fn snapshot_is_independent_of_later_mutation() {
        let registry = ConnectionRegistry::new();
        registry.insert(conn("10.0.0.1:1111"));
        registry.insert(conn("10.0.0.2:2222"));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);

        registry.insert(conn("10.0.0.3:3333"));
        assert!(registry.remove("10.0.0.1:1111").is_some());

        // The snapshot still holds the two handles it was taken with.
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().any(|c| c.key() == "10.0.0.1:1111"));
    }

    #[test]
    fn clear_marks_handles_closed() {
        let registry = ConnectionRegistry::new();
        let a = conn("10.0.0.1:1111");
        registry.insert(Arc::clone(&a));

        registry.clear();
        assert!(registry.is_empty());
        assert!(!a.is_open());
    }
}
