//! KeyValueStore trait abstraction for the persisted store shared by all peers.
//!
//! Implementations:
//! - `InMemoryStore` - Shared map with per-context handles (tests, single-process hosts)
//! - `DirStore` (in poll-daemon) - One file per key, watched for cross-process changes
//! - `JsStore` (in poll-wasm) - `localStorage` via JS callbacks
//!
//! Every access is a single read or write. There is no transaction and no
//! compare-and-swap, so concurrent read-then-write sequences from different
//! peers are last-write-wins.

use crate::peer_id::PeerId;
use crate::platform::ThreadSafe;
use crate::subscription::Subscription;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A value change observed by another context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    pub key: String,
    pub old_value: Option<String>,
    /// `None` when the key was removed
    pub new_value: Option<String>,
}

/// Persisted string key-value store shared by every peer in a namespace.
pub trait KeyValueStore: ThreadSafe {
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;
}

/// Callback invoked for changes made by other contexts.
pub type ChangeCallback = Arc<dyn Fn(StoreChange) + Send + Sync>;

/// A store that reports changes made by *other* contexts.
///
/// Like browser storage events, a context is never notified about its own
/// writes, and writes that leave the value unchanged notify no one.
pub trait ObservableStore: KeyValueStore {
    fn watch(&self, callback: ChangeCallback) -> Subscription;
}

struct Watcher {
    id: usize,
    context: PeerId,
    callback: ChangeCallback,
}

#[derive(Default)]
struct Shared {
    values: RwLock<HashMap<String, String>>,
    watchers: RwLock<Vec<Watcher>>,
    next_id: AtomicUsize,
}

/// In-memory store for tests and single-process hosts.
///
/// Each handle is one context. `context()` creates a sibling handle over the
/// same data, the way a new tab sees the same `localStorage`.
#[derive(Clone)]
pub struct InMemoryStore {
    shared: Arc<Shared>,
    context: PeerId,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            context: PeerId::generate(),
        }
    }

    /// A new context sharing this store's data.
    pub fn context(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            context: PeerId::generate(),
        }
    }

    pub fn context_id(&self) -> PeerId {
        self.context
    }

    /// Copy of every key and value, for assertions.
    pub fn snapshot(&self) -> HashMap<String, String> {
        self.shared
            .values
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn notify(&self, change: StoreChange) {
        // Clone the callback list so a callback may watch or write without deadlocking.
        let callbacks: Vec<_> = self
            .shared
            .watchers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|w| w.context != self.context)
            .map(|w| Arc::clone(&w.callback))
            .collect();

        for callback in callbacks {
            callback(change.clone());
        }
    }

    fn replace(&self, key: &str, value: Option<&str>) {
        let old_value = {
            let mut values = self.shared.values.write().unwrap_or_else(|e| e.into_inner());
            match value {
                Some(v) => values.insert(key.to_string(), v.to_string()),
                None => values.remove(key),
            }
        };

        if old_value.as_deref() != value {
            self.notify(StoreChange {
                key: key.to_string(),
                old_value,
                new_value: value.map(str::to_string),
            });
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for InMemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .shared
            .values
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.replace(key, Some(value));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.replace(key, None);
        Ok(())
    }
}

impl ObservableStore for InMemoryStore {
    fn watch(&self, callback: ChangeCallback) -> Subscription {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared
            .watchers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Watcher {
                id,
                context: self.context,
                callback,
            });

        let shared = Arc::downgrade(&self.shared);
        Subscription::new(move || {
            if let Some(shared) = shared.upgrade() {
                // try_write avoids deadlock if Drop runs while a notification holds the read lock
                if let Ok(mut guard) = shared.watchers.try_write() {
                    guard.retain(|w| w.id != id);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder() -> (ChangeCallback, Arc<Mutex<Vec<StoreChange>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let callback: ChangeCallback = Arc::new(move |change| {
            seen_clone.lock().unwrap().push(change);
        });
        (callback, seen)
    }

    #[test]
    fn test_get_set_remove() {
        let store = InMemoryStore::new();

        assert_eq!(store.get("k").unwrap(), None);
        store.set("k", "v").unwrap();
        assert_eq!(store.get("k").unwrap(), Some("v".to_string()));
        store.remove("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn test_contexts_share_values() {
        let a = InMemoryStore::new();
        let b = a.context();

        a.set("k", "1").unwrap();

        assert_eq!(b.get("k").unwrap(), Some("1".to_string()));
        assert_ne!(a.context_id(), b.context_id());
    }

    #[test]
    fn test_writer_is_not_notified() {
        let a = InMemoryStore::new();
        let b = a.context();
        let (cb_a, seen_a) = recorder();
        let (cb_b, seen_b) = recorder();
        let _sub_a = a.watch(cb_a);
        let _sub_b = b.watch(cb_b);

        a.set("k", "1").unwrap();

        assert!(seen_a.lock().unwrap().is_empty());
        assert_eq!(
            *seen_b.lock().unwrap(),
            vec![StoreChange {
                key: "k".into(),
                old_value: None,
                new_value: Some("1".into()),
            }]
        );
    }

    #[test]
    fn test_unchanged_value_does_not_notify() {
        let a = InMemoryStore::new();
        let b = a.context();
        let (cb, seen) = recorder();
        let _sub = b.watch(cb);

        a.set("k", "false").unwrap();
        a.set("k", "false").unwrap();
        a.remove("missing").unwrap();

        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_removal_reports_none() {
        let a = InMemoryStore::new();
        let b = a.context();
        a.set("k", "3").unwrap();
        let (cb, seen) = recorder();
        let _sub = b.watch(cb);

        a.remove("k").unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].old_value.as_deref(), Some("3"));
        assert_eq!(seen[0].new_value, None);
    }

    #[test]
    fn test_dropped_subscription_stops_notifications() {
        let a = InMemoryStore::new();
        let b = a.context();
        let (cb, seen) = recorder();

        let sub = b.watch(cb);
        a.set("k", "1").unwrap();
        drop(sub);
        a.set("k", "2").unwrap();

        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
