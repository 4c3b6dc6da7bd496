//! Advisory peer count shared through the store.
//!
//! Used for diagnostics and the poll payload only, never for leadership.
//! Concurrent adjustments from different peers may lose updates.

use crate::config::Namespace;
use crate::store::{KeyValueStore, Result};
use tracing::debug;

#[derive(Clone)]
pub struct SharedCounter<S> {
    store: S,
    key: String,
}

impl<S: KeyValueStore> SharedCounter<S> {
    pub fn new(store: S, namespace: &Namespace) -> Self {
        Self {
            store,
            key: namespace.count_key(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current count. Absent or unparseable values read as zero.
    pub fn get(&self) -> Result<u64> {
        Ok(self
            .store
            .get(&self.key)?
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .unwrap_or(0))
    }

    /// Apply `delta` and return the new total.
    ///
    /// A delta that would take the count below zero is refused and the current
    /// value returned unchanged. `adjust(0)` is a pure read.
    pub fn adjust(&self, delta: i64) -> Result<u64> {
        let current = self.get()?;
        if delta == 0 {
            return Ok(current);
        }

        let Some(next) = current.checked_add_signed(delta) else {
            debug!(key = %self.key, current, delta, "refusing to take peer count below zero");
            return Ok(current);
        };

        self.store.set(&self.key, &next.to_string())?;
        Ok(next)
    }

    /// Overwrite the count.
    pub fn set(&self, value: u64) -> Result<()> {
        self.store.set(&self.key, &value.to_string())
    }

    /// Remove the key. Observers treat this as a population reset.
    pub fn reset(&self) -> Result<()> {
        self.store.remove(&self.key)
    }
}
