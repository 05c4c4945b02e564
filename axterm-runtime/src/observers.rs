//! Plain-data snapshot publication, replacing the source's reactive UI
//! objects (see spec design notes): the core exposes state by value and
//! observers are notified of a change, never handed the live mutable state.
//!
//! Grounded on `m17app::app::Adapters` - an `RwLock`-protected registry of
//! `Arc<dyn ...>` subscribers keyed by a monotonically increasing handle -
//! generalized from packet/stream adapters to a single snapshot-oriented
//! `Observer` trait.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use uuid::Uuid;

use axterm_core::address::Address;
use axterm_core::bulk::TransferStatus;
use axterm_core::session::SessionState;

use crate::link::LinkState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub channel: u8,
    pub local: Address,
    pub remote: Address,
    pub state: SessionState,
    pub vs: u8,
    pub vr: u8,
    pub va: u8,
    pub retry: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransferSnapshot {
    pub id: Uuid,
    pub status: TransferStatus,
    pub progress: f64,
    pub bytes_sent: u64,
    pub transmission_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSnapshot {
    pub entries: usize,
}

/// Subscriber to transmission-actor state changes. All methods default to a
/// no-op so an observer only needs to implement what it cares about.
pub trait Observer: Send + Sync + 'static {
    fn session_changed(&self, _snapshot: &SessionSnapshot) {}
    fn transfer_changed(&self, _snapshot: &TransferSnapshot) {}
    fn cache_changed(&self, _snapshot: &CacheSnapshot) {}
    fn link_state_changed(&self, _state: LinkState) {}
}

#[derive(Default)]
struct Entries {
    next: usize,
    observers: HashMap<usize, Arc<dyn Observer>>,
}

/// Registry of observers, notified from the transmission actor's thread.
pub struct ObserverRegistry {
    inner: RwLock<Entries>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Entries::default()),
        }
    }

    /// Register an observer, returning a handle usable with `remove`.
    pub fn add(&self, observer: Arc<dyn Observer>) -> usize {
        let mut entries = self.inner.write().unwrap();
        let id = entries.next;
        entries.next += 1;
        entries.observers.insert(id, observer);
        id
    }

    pub fn remove(&self, id: usize) {
        self.inner.write().unwrap().observers.remove(&id);
    }

    pub fn notify_session(&self, snapshot: &SessionSnapshot) {
        for observer in self.inner.read().unwrap().observers.values() {
            observer.session_changed(snapshot);
        }
    }

    pub fn notify_transfer(&self, snapshot: &TransferSnapshot) {
        for observer in self.inner.read().unwrap().observers.values() {
            observer.transfer_changed(snapshot);
        }
    }

    pub fn notify_cache(&self, snapshot: &CacheSnapshot) {
        for observer in self.inner.read().unwrap().observers.values() {
            observer.cache_changed(snapshot);
        }
    }

    pub fn notify_link_state(&self, state: LinkState) {
        for observer in self.inner.read().unwrap().observers.values() {
            observer.link_state_changed(state);
        }
    }
}

impl Default for ObserverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingObserver {
        count: AtomicUsize,
    }

    impl Observer for CountingObserver {
        fn session_changed(&self, _snapshot: &SessionSnapshot) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn removed_observer_stops_receiving_notifications() {
        let registry = ObserverRegistry::new();
        let observer = Arc::new(CountingObserver {
            count: AtomicUsize::new(0),
        });
        let id = registry.add(observer.clone());
        let snapshot = SessionSnapshot {
            channel: 0,
            local: Address::new("VK7XT", 0).unwrap(),
            remote: Address::new("VK7ABC", 1).unwrap(),
            state: SessionState::Disconnected,
            vs: 0,
            vr: 0,
            va: 0,
            retry: 0,
        };
        registry.notify_session(&snapshot);
        registry.remove(id);
        registry.notify_session(&snapshot);
        assert_eq!(observer.count.load(Ordering::SeqCst), 1);
    }
}
