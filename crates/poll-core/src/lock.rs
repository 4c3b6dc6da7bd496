//! Advisory leader lock.
//!
//! A plain `"true"`/`"false"` flag in the shared store. Acquisition is a blind
//! write, so two peers can both see the lock free and both take it. The
//! scheduler's rate-limit heuristic and randomized re-checks resolve that after
//! the fact.
//!
//! Alongside the flag the holder keeps a heartbeat record (time + holder id).
//! Peers use it to spot a second active poller and, when a lease is
//! configured, a lock abandoned by a context that died without releasing it.

use crate::config::Namespace;
use crate::peer_id::PeerId;
use crate::store::{KeyValueStore, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const HELD: &str = "true";
const RELEASED: &str = "false";

/// Observed value of the lock key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LockState {
    /// `"true"`: some peer believes it is polling
    Held,
    /// Any other value, normally `"false"`
    Released,
    /// Never set, or cleared
    Absent,
}

impl LockState {
    fn from_raw(raw: Option<&str>) -> Self {
        match raw {
            Some(HELD) => Self::Held,
            Some(_) => Self::Released,
            None => Self::Absent,
        }
    }
}

/// Last sign of life from the lock holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Milliseconds since the Unix epoch
    pub at: u64,
    pub holder: PeerId,
}

#[derive(Clone)]
pub struct LeaderLock<S> {
    store: S,
    key: String,
    heartbeat_key: String,
    owner: PeerId,
}

impl<S: KeyValueStore> LeaderLock<S> {
    pub fn new(store: S, namespace: &Namespace, owner: PeerId) -> Self {
        Self {
            store,
            key: namespace.lock_key(),
            heartbeat_key: namespace.heartbeat_key(),
            owner,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> Result<LockState> {
        Ok(LockState::from_raw(self.store.get(&self.key)?.as_deref()))
    }

    /// True iff the flag reads exactly `"true"`.
    pub fn is_held(&self) -> Result<bool> {
        Ok(self.state()? == LockState::Held)
    }

    /// Take the lock. The heartbeat goes first so nobody sees a held lock without one.
    pub fn acquire(&self, now_ms: u64) -> Result<()> {
        self.touch(now_ms)?;
        self.store.set(&self.key, HELD)
    }

    /// Give the lock up. The heartbeat is removed only if it is ours, so a
    /// peer stepping down never erases the record of the peer that won.
    pub fn release(&self) -> Result<()> {
        self.store.set(&self.key, RELEASED)?;
        match self.heartbeat()? {
            Some(beat) if beat.holder != self.owner => Ok(()),
            _ => self.store.remove(&self.heartbeat_key),
        }
    }

    /// Release a lock abandoned by another peer, heartbeat included.
    pub fn clear(&self) -> Result<()> {
        self.store.set(&self.key, RELEASED)?;
        self.store.remove(&self.heartbeat_key)
    }

    /// Refresh the heartbeat as the current holder.
    pub fn touch(&self, now_ms: u64) -> Result<()> {
        let record = Heartbeat {
            at: now_ms,
            holder: self.owner,
        };
        let encoded = serde_json::to_string(&record).unwrap_or_else(|_| now_ms.to_string());
        self.store.set(&self.heartbeat_key, &encoded)
    }

    /// Current heartbeat. Unreadable records count as absent.
    pub fn heartbeat(&self) -> Result<Option<Heartbeat>> {
        Ok(self
            .store
            .get(&self.heartbeat_key)?
            .and_then(|raw| serde_json::from_str(&raw).ok()))
    }

    /// Heartbeat written by a different peer less than `within` ago.
    pub fn foreign_heartbeat(&self, now_ms: u64, within: Duration) -> Result<Option<Heartbeat>> {
        Ok(self.heartbeat()?.filter(|beat| {
            beat.holder != self.owner && now_ms.saturating_sub(beat.at) < within.as_millis() as u64
        }))
    }

    /// Held, but with no heartbeat younger than `lease`.
    pub fn is_stale(&self, now_ms: u64, lease: Duration) -> Result<bool> {
        if !self.is_held()? {
            return Ok(false);
        }
        Ok(match self.heartbeat()? {
            Some(beat) => now_ms.saturating_sub(beat.at) >= lease.as_millis() as u64,
            None => true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn ns() -> Namespace {
        Namespace::new("ns_").unwrap()
    }

    fn lock(store: &InMemoryStore, owner: u64) -> LeaderLock<InMemoryStore> {
        LeaderLock::new(store.clone(), &ns(), PeerId::from(owner))
    }

    #[test]
    fn test_initially_absent() {
        let store = InMemoryStore::new();
        let lock = lock(&store, 1);

        assert_eq!(lock.state().unwrap(), LockState::Absent);
        assert!(!lock.is_held().unwrap());
    }

    #[test]
    fn test_acquire_and_release() {
        let store = InMemoryStore::new();
        let lock = lock(&store, 1);

        lock.acquire(1000).unwrap();
        assert_eq!(store.get("ns_in_work").unwrap(), Some("true".to_string()));
        assert!(lock.is_held().unwrap());
        assert_eq!(lock.heartbeat().unwrap().map(|b| b.at), Some(1000));

        lock.release().unwrap();
        assert_eq!(store.get("ns_in_work").unwrap(), Some("false".to_string()));
        assert_eq!(lock.state().unwrap(), LockState::Released);
        assert_eq!(lock.heartbeat().unwrap(), None);
    }

    #[test]
    fn test_release_keeps_another_holders_heartbeat() {
        let store = InMemoryStore::new();
        let loser = lock(&store, 1);
        let winner = lock(&store, 2);
        loser.acquire(1000).unwrap();
        winner.acquire(1200).unwrap();

        loser.release().unwrap();

        let beat = winner.heartbeat().unwrap().unwrap();
        assert_eq!(beat.holder, PeerId::from(2));
        assert_eq!(beat.at, 1200);
    }

    #[test]
    fn test_clear_removes_foreign_heartbeat() {
        let store = InMemoryStore::new();
        let holder = lock(&store, 1);
        let observer = lock(&store, 2);
        holder.acquire(0).unwrap();

        observer.clear().unwrap();

        assert_eq!(store.get("ns_in_work").unwrap(), Some("false".to_string()));
        assert_eq!(observer.heartbeat().unwrap(), None);
    }

    #[test]
    fn test_anything_but_true_is_not_held() {
        let store = InMemoryStore::new();
        let lock = lock(&store, 1);

        store.set("ns_in_work", "TRUE").unwrap();

        assert!(!lock.is_held().unwrap());
    }

    #[test]
    fn test_foreign_heartbeat() {
        let store = InMemoryStore::new();
        let mine = lock(&store, 1);
        let theirs = lock(&store, 2);

        theirs.acquire(1000).unwrap();

        let within = Duration::from_millis(4500);
        assert!(mine.foreign_heartbeat(2000, within).unwrap().is_some());
        assert!(mine.foreign_heartbeat(5600, within).unwrap().is_none());
        assert!(theirs.foreign_heartbeat(2000, within).unwrap().is_none());
    }

    #[test]
    fn test_stale_after_lease() {
        let store = InMemoryStore::new();
        let holder = lock(&store, 1);
        let observer = lock(&store, 2);
        let lease = Duration::from_secs(15);

        holder.acquire(0).unwrap();
        assert!(!observer.is_stale(10_000, lease).unwrap());
        assert!(observer.is_stale(15_000, lease).unwrap());

        holder.touch(12_000).unwrap();
        assert!(!observer.is_stale(15_000, lease).unwrap());
    }

    #[test]
    fn test_held_without_heartbeat_is_stale() {
        let store = InMemoryStore::new();
        let observer = lock(&store, 2);

        store.set("ns_in_work", "true").unwrap();

        assert!(observer.is_stale(0, Duration::from_secs(15)).unwrap());
    }

    #[test]
    fn test_released_lock_is_never_stale() {
        let store = InMemoryStore::new();
        let observer = lock(&store, 2);

        store.set("ns_in_work", "false").unwrap();

        assert!(!observer.is_stale(1_000_000, Duration::from_secs(15)).unwrap());
    }
}
