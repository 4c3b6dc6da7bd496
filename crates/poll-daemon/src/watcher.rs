//! Debounced directory watcher shared by the directory store and spool.
//!
//! Uses notify-debouncer-mini and reports the bare file names that changed.

use anyhow::Result;
use notify::RecursiveMode;
use notify_debouncer_mini::{DebouncedEvent, Debouncer, new_debouncer};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error};

/// Debounce period for file events.
pub const DEBOUNCE: Duration = Duration::from_millis(50);

/// Watches one directory (non-recursively) until dropped.
pub struct DirWatcher {
    dir: PathBuf,
    /// Debouncer handle (must keep alive)
    _debouncer: Debouncer<notify::RecommendedWatcher>,
}

impl DirWatcher {
    /// Start watching `dir`, calling `on_change` with the name of every file
    /// that was created, modified or removed.
    ///
    /// Hidden files (leading `.`) are skipped; writers use them as temporaries.
    pub fn new(dir: &Path, on_change: impl Fn(&str) + Send + 'static) -> Result<Self> {
        // Canonicalize to resolve symlinks; FSEvents on macOS reports real paths.
        let dir = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());

        let mut debouncer = new_debouncer(
            DEBOUNCE,
            move |result: std::result::Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => {
                    for event in events {
                        if let Some(name) = file_name(&event.path) {
                            on_change(name);
                        }
                    }
                }
                Err(e) => error!("Directory watcher error: {}", e),
            },
        )?;

        debouncer.watcher().watch(&dir, RecursiveMode::NonRecursive)?;
        debug!("Watching {:?}", dir);

        Ok(Self {
            dir,
            _debouncer: debouncer,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn file_name(path: &Path) -> Option<&str> {
    let name = path.file_name()?.to_str()?;
    if name.starts_with('.') {
        return None;
    }
    Some(name)
}
