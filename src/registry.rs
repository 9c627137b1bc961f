//! Registry of live consoles keyed by peer address.
//!
//! The accept loop inserts, readers remove when their connection dies, and
//! callers look consoles up. A key is present only while its console is
//! considered alive; insertion refuses consoles that already died so a
//! reader that finished early can never leave a stale entry behind.

use crate::console::Console;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};

struct Entry {
    /// Registration sequence number, for ordered key snapshots.
    seq: u64,
    console: Arc<Console>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<SocketAddr, Entry>,
    next_seq: u64,
}

/// Thread-safe map from peer address to console.
#[derive(Default)]
pub struct Registry {
    inner: RwLock<Inner>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `console` under its key if it is still alive.
    ///
    /// Replaces any entry left over from an earlier connection that reused
    /// the same address. Returns `false` if the console was already dead.
    pub fn insert(&self, console: Arc<Console>) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        // Checked under the write lock: a reader marks the console dead
        // before it tries to remove it, so one of the two always sees the other.
        if !console.is_alive() {
            return false;
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert(console.key(), Entry { seq, console });
        true
    }

    /// Look up a live console.
    pub fn get(&self, key: &SocketAddr) -> Option<Arc<Console>> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.entries.get(key).map(|entry| Arc::clone(&entry.console))
    }

    /// Snapshot of registered keys in registration order.
    pub fn keys(&self) -> Vec<SocketAddr> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut entries: Vec<(u64, SocketAddr)> = inner
            .entries
            .iter()
            .map(|(key, entry)| (entry.seq, *key))
            .collect();
        entries.sort_unstable();
        entries.into_iter().map(|(_, key)| key).collect()
    }

    /// Remove the entry for `key` only if it still points at `console`.
    pub fn remove_if_same(&self, key: &SocketAddr, console: &Console) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let same = inner
            .entries
            .get(key)
            .is_some_and(|entry| std::ptr::eq(Arc::as_ptr(&entry.console), console));
        if same {
            inner.entries.remove(key);
        }
        same
    }

    /// Evict every console that is no longer alive and hand them back.
    pub fn clean(&self) -> Vec<Arc<Console>> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let dead: Vec<SocketAddr> = inner
            .entries
            .iter()
            .filter(|(_, entry)| !entry.console.is_alive())
            .map(|(key, _)| *key)
            .collect();
        dead.iter()
            .filter_map(|key| inner.entries.remove(key))
            .map(|entry| entry.console)
            .collect()
    }

    /// Remove and return every console.
    pub fn drain(&self) -> Vec<Arc<Console>> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut inner.entries)
            .into_values()
            .map(|entry| entry.console)
            .collect()
    }

    /// Number of registered consoles.
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    /// Check if no console is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;

    fn console(addr: &str, registry: &Arc<Registry>) -> Arc<Console> {
        let (conn, _reader) = Connection::new(
            addr.parse().unwrap(),
            tokio::io::empty(),
            tokio::io::sink(),
            1024,
        );
        Arc::new(Console::new(conn, Arc::downgrade(registry)))
    }

    #[tokio::test]
    async fn test_keys_in_registration_order() {
        let registry = Arc::new(Registry::new());
        assert!(registry.keys().is_empty());

        let addrs = ["127.0.0.1:3000", "10.0.0.1:8888", "127.0.0.1:1234"];
        for addr in addrs {
            assert!(registry.insert(console(addr, &registry)));
        }

        let expected: Vec<SocketAddr> = addrs.iter().map(|a| a.parse().unwrap()).collect();
        assert_eq!(registry.keys(), expected);
        assert_eq!(registry.len(), 3);
    }

    #[tokio::test]
    async fn test_get_missing_key() {
        let registry = Registry::new();
        assert!(registry.get(&"127.0.0.1:1".parse().unwrap()).is_none());
    }

    #[tokio::test]
    async fn test_dead_console_not_inserted() {
        let registry = Arc::new(Registry::new());
        let c = console("127.0.0.1:4000", &registry);
        c.signal_close();
        assert!(!registry.insert(c));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_remove_if_same_ignores_newer_connection() {
        let registry = Arc::new(Registry::new());
        let old = console("127.0.0.1:4000", &registry);
        let new = console("127.0.0.1:4000", &registry);

        registry.insert(Arc::clone(&old));
        registry.insert(Arc::clone(&new));

        assert!(!registry.remove_if_same(&old.key(), &old));
        assert!(Arc::ptr_eq(&registry.get(&new.key()).unwrap(), &new));
        assert!(registry.remove_if_same(&new.key(), &new));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_close_removes_entry() {
        let registry = Arc::new(Registry::new());
        let c = console("127.0.0.1:4000", &registry);
        registry.insert(Arc::clone(&c));

        c.close().await;
        assert!(registry.get(&c.key()).is_none());
    }

    #[tokio::test]
    async fn test_clean_evicts_dead() {
        let registry = Arc::new(Registry::new());
        let alive = ["127.0.0.1:1111", "10.0.0.2:8888"];
        let dead = ["127.0.0.1:9999", "127.0.0.1:1234"];

        for addr in alive.iter().chain(dead.iter()) {
            registry.insert(console(addr, &registry));
        }
        for addr in dead {
            registry.get(&addr.parse().unwrap()).unwrap().signal_close();
        }

        let evicted = registry.clean();
        assert_eq!(evicted.len(), 2);
        assert!(evicted.iter().all(|c| !c.is_alive()));

        let remaining = registry.keys();
        assert_eq!(remaining.len(), 2);
        for addr in alive {
            assert!(remaining.contains(&addr.parse().unwrap()));
        }
    }

    #[tokio::test]
    async fn test_drain_empties() {
        let registry = Arc::new(Registry::new());
        registry.insert(console("127.0.0.1:1", &registry));
        registry.insert(console("127.0.0.1:2", &registry));

        assert_eq!(registry.drain().len(), 2);
        assert!(registry.is_empty());
    }
}
