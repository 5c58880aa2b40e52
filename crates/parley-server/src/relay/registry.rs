//! Registry of online clients.
//!
//! Maps each client id to the handle of its single live connection. Every
//! read and mutation goes through one `RwLock`.
//!
//! Duplicate ids: the newest registration wins. The displaced connection is
//! moved to `Closing(Replaced)` under the same write lock that inserts its
//! successor, so there is never a moment with two writable connections
//! registered under one id.
//!
//! Once [`ConnectionRegistry::shut_down`] has run, late registrations (sockets
//! that were still in their handshake) are refused and closed with
//! `ServerShutdown` instead of being inserted.

use crate::connection::lifecycle::CloseReason;
use crate::connection::{ConnectionHandle, ConnectionKey};
use parley_core::ClientId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Outcome of [`ConnectionRegistry::add`].
#[derive(Debug)]
pub enum Registration {
    /// No connection was registered under this id before.
    Registered,
    /// An older connection was evicted and asked to close.
    Replaced(ConnectionHandle),
    /// Not inserted: the handle was already closing, or the registry is
    /// shutting down (the handle is then closed with `ServerShutdown`).
    Inactive,
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    entries: RwLock<HashMap<ClientId, ConnectionHandle>>,
    /// Only flipped while holding the `entries` write lock.
    shutting_down: AtomicBool,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Activate and register a connection, evicting any previous one.
    pub async fn add(&self, handle: ConnectionHandle) -> Registration {
        let mut entries = self.entries.write().await;
        if self.shutting_down.load(Ordering::Acquire) {
            handle.close(CloseReason::ServerShutdown);
            debug!(client_id = %handle.id(), "registry shutting down, registration refused");
            return Registration::Inactive;
        }
        if !handle.activate() {
            debug!(client_id = %handle.id(), "not registering a closing connection");
            return Registration::Inactive;
        }

        match entries.insert(handle.id().clone(), handle.clone()) {
            Some(previous) => {
                previous.close(CloseReason::Replaced);
                info!(
                    client_id = %handle.id(),
                    serial = handle.serial(),
                    replaced = previous.serial(),
                    "client re-registered, previous connection evicted"
                );
                Registration::Replaced(previous)
            }
            None => {
                info!(client_id = %handle.id(), serial = handle.serial(), "client registered");
                Registration::Registered
            }
        }
    }

    /// Remove the entry for `key.id`, but only if it still belongs to the
    /// connection identified by `key`.
    pub async fn remove(&self, key: &ConnectionKey) -> bool {
        let mut entries = self.entries.write().await;
        match entries.get(&key.id) {
            Some(current) if current.serial() == key.serial => {
                entries.remove(&key.id);
                true
            }
            _ => false,
        }
    }

    pub async fn get(&self, id: &str) -> Option<ConnectionHandle> {
        self.entries.read().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Registered ids, sorted.
    pub async fn ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self.entries.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Refuse further registrations and ask every registered connection to
    /// close with `ServerShutdown`. Entries disappear as each connection
    /// finishes its own teardown.
    pub async fn shut_down(&self) -> usize {
        let entries = self.entries.write().await;
        self.shutting_down.store(true, Ordering::Release);
        entries
            .values()
            .filter(|handle| handle.close(CloseReason::ServerShutdown))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::lifecycle::ConnectionState;
    use std::sync::Arc;

    fn handle(id: &str) -> ConnectionHandle {
        ConnectionHandle::new(ClientId::new(id).unwrap(), 4).0
    }

    #[tokio::test]
    async fn test_add_get_remove() {
        let registry = ConnectionRegistry::new();
        let alice = handle("alice");

        assert!(matches!(registry.add(alice.clone()).await, Registration::Registered));
        assert!(alice.is_active());
        assert_eq!(registry.get("alice").await.unwrap().serial(), alice.serial());
        assert!(registry.get("bob").await.is_none());

        assert!(registry.remove(alice.key()).await);
        assert!(registry.get("alice").await.is_none());
        assert!(!registry.remove(alice.key()).await);
    }

    #[tokio::test]
    async fn test_duplicate_evicts_previous() {
        let registry = ConnectionRegistry::new();
        let first = handle("alice");
        let second = handle("alice");

        registry.add(first.clone()).await;
        match registry.add(second.clone()).await {
            Registration::Replaced(previous) => assert_eq!(previous.serial(), first.serial()),
            other => panic!("expected replacement, got {other:?}"),
        }

        assert_eq!(
            first.state(),
            ConnectionState::Closing(CloseReason::Replaced)
        );
        assert!(second.is_active());
        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.get("alice").await.unwrap().serial(), second.serial());
    }

    #[tokio::test]
    async fn test_stale_remove_keeps_replacement() {
        let registry = ConnectionRegistry::new();
        let first = handle("alice");
        let second = handle("alice");
        registry.add(first.clone()).await;
        registry.add(second.clone()).await;

        // The evicted connection's teardown must not unregister its successor.
        assert!(!registry.remove(first.key()).await);
        assert_eq!(registry.get("alice").await.unwrap().serial(), second.serial());
    }

    #[tokio::test]
    async fn test_closing_handle_not_registered() {
        let registry = ConnectionRegistry::new();
        let alice = handle("alice");
        alice.close(CloseReason::ServerShutdown);
        assert!(matches!(registry.add(alice).await, Registration::Inactive));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_shut_down_closes_registered() {
        let registry = ConnectionRegistry::new();
        let alice = handle("alice");
        let bob = handle("bob");
        registry.add(alice.clone()).await;
        registry.add(bob.clone()).await;

        assert_eq!(registry.shut_down().await, 2);
        assert_eq!(
            alice.state(),
            ConnectionState::Closing(CloseReason::ServerShutdown)
        );
        assert!(!bob.is_active());
        assert_eq!(registry.shut_down().await, 0);
        assert_eq!(registry.ids().await.len(), 2);
    }

    #[tokio::test]
    async fn test_late_registration_refused_after_shut_down() {
        let registry = ConnectionRegistry::new();
        registry.shut_down().await;

        // A socket that finished its handshake after shutdown started.
        let late = handle("carol");
        assert!(matches!(registry.add(late.clone()).await, Registration::Inactive));
        assert_eq!(
            late.state(),
            ConnectionState::Closing(CloseReason::ServerShutdown)
        );
        assert!(registry.get("carol").await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_add_remove() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut tasks = Vec::new();
        for i in 0..64 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let h = handle(&format!("client-{}", i % 8));
                registry.add(h.clone()).await;
                tokio::task::yield_now().await;
                if i % 2 == 0 {
                    registry.remove(h.key()).await;
                }
                h
            }));
        }
        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap());
        }

        // Every registered entry is active and is the only active handle for its id.
        for id in registry.ids().await {
            let current = registry.get(id.as_str()).await.unwrap();
            assert!(current.is_active());
            let active = handles
                .iter()
                .filter(|h| h.id() == &id && h.is_active())
                .count();
            assert_eq!(active, 1, "id {id} has {active} active handles");
        }
    }
}
