//! Directory-backed key-value store shared between processes.
//!
//! Each key is a file `<key>.val` holding the raw value. Writes go through a
//! hidden temporary file and a rename, so readers never see a partial value.
//!
//! Change notifications follow browser storage-event rules: a context never
//! hears about its own writes, and rewriting the same value notifies no one.
//! Each context remembers the last value it wrote or reported per key and
//! only reports a file event when the value on disk differs from it.

use crate::watcher::DirWatcher;
use poll_core::{ChangeCallback, KeyValueStore, ObservableStore, StoreChange, StoreError, Subscription};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

const SUFFIX: &str = ".val";

type Known = Arc<Mutex<HashMap<String, Option<String>>>>;

/// One context's handle on a store directory. Clones share the context.
#[derive(Clone)]
pub struct DirStore {
    dir: PathBuf,
    known: Known,
}

impl DirStore {
    /// Open a new context on `dir`, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(Self {
            dir,
            known: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> Result<PathBuf, StoreError> {
        if key.is_empty() || key.starts_with('.') || key.contains(['/', '\\']) {
            return Err(StoreError::Io(format!("Invalid key: {:?}", key)));
        }
        Ok(self.dir.join(format!("{}{}", key, SUFFIX)))
    }

    fn remember(&self, key: &str, value: Option<String>) -> Option<String> {
        let mut known = self.known.lock().unwrap_or_else(|e| e.into_inner());
        known.insert(key.to_string(), value).flatten()
    }

    /// Compare a changed file with what this context last saw.
    fn observe(&self, key: &str) -> Option<StoreChange> {
        let current = match self.get(key) {
            Ok(value) => value,
            Err(e) => {
                warn!("Failed to read changed key {}: {}", key, e);
                return None;
            }
        };

        let mut known = self.known.lock().unwrap_or_else(|e| e.into_inner());
        let previous = known.get(key).cloned().flatten();
        if previous == current {
            return None;
        }
        known.insert(key.to_string(), current.clone());

        Some(StoreChange {
            key: key.to_string(),
            old_value: previous,
            new_value: current,
        })
    }

    /// Seed the cache with what is on disk now so pre-existing values are not reported.
    fn snapshot(&self) {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(key) = name.to_str().and_then(|n| n.strip_suffix(SUFFIX)) else {
                continue;
            };
            if let Ok(value) = self.get(key) {
                self.known
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .entry(key.to_string())
                    .or_insert(value);
            }
        }
    }
}

impl KeyValueStore for DirStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match fs::read_to_string(self.path(key)?) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io(e.to_string())),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let path = self.path(key)?;
        let tmp = self.dir.join(format!(".{}.{}.tmp", key, uuid::Uuid::new_v4()));

        self.remember(key, Some(value.to_string()));
        fs::write(&tmp, value).map_err(|e| StoreError::Io(e.to_string()))?;
        fs::rename(&tmp, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            StoreError::Io(e.to_string())
        })
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path(key)?;
        self.remember(key, None);
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e.to_string())),
        }
    }
}

impl ObservableStore for DirStore {
    fn watch(&self, callback: ChangeCallback) -> Subscription {
        self.snapshot();

        let store = self.clone();
        let watcher = DirWatcher::new(&self.dir, move |name| {
            let Some(key) = name.strip_suffix(SUFFIX) else {
                return;
            };
            if let Some(change) = store.observe(key) {
                debug!(key = %change.key, "Store key changed on disk");
                callback(change);
            }
        });

        match watcher {
            Ok(watcher) => Subscription::new(move || drop(watcher)),
            Err(e) => {
                warn!("Failed to watch store directory {:?}: {}", self.dir, e);
                Subscription::new(|| {})
            }
        }
    }
}
