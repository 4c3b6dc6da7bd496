//! Directory spool used as a broadcast medium between processes.
//!
//! Every published message becomes one file `<sent_at>-<uuid>.msg` holding a
//! JSON record with the sender's context id. Subscribers pick up files they
//! have not seen yet and skip their own. Messages published before a context
//! subscribed are never delivered to it. Files older than [`RETENTION`] are
//! removed by publishers.

use crate::watcher::DirWatcher;
use poll_core::{BroadcastMedium, BusError, Clock, MessageCallback, ObservableMedium, PeerId, Subscription, SystemClock};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

/// How long a message file stays in the spool.
pub const RETENTION: Duration = Duration::from_secs(30);

const SUFFIX: &str = ".msg";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpoolRecord {
    sender: PeerId,
    sent_at: u64,
    body: String,
}

/// One context's handle on a spool directory. Clones share the context.
#[derive(Clone)]
pub struct DirMedium {
    dir: PathBuf,
    context: PeerId,
}

impl DirMedium {
    /// Open a new context on the spool for `channel` under `root`.
    pub fn open(root: &Path, channel: &str) -> Result<Self, BusError> {
        let dir = root.join(channel);
        fs::create_dir_all(&dir).map_err(|e| BusError::Closed(e.to_string()))?;
        Ok(Self {
            dir,
            context: PeerId::generate(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn context_id(&self) -> PeerId {
        self.context
    }

    fn prune(&self, now_ms: u64) {
        let cutoff = now_ms.saturating_sub(RETENTION.as_millis() as u64);
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(sent_at) = name.to_str().and_then(sent_at) else {
                continue;
            };
            if sent_at < cutoff {
                // Another publisher may have removed it first.
                let _ = fs::remove_file(entry.path());
            }
        }
    }

    fn message_names(&self) -> Vec<String> {
        fs::read_dir(&self.dir)
            .map(|entries| {
                entries
                    .flatten()
                    .filter_map(|e| e.file_name().to_str().map(str::to_string))
                    .filter(|n| n.ends_with(SUFFIX))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Timestamp prefix of a message file name.
fn sent_at(name: &str) -> Option<u64> {
    name.strip_suffix(SUFFIX)?.split_once('-')?.0.parse().ok()
}

/// Write `bytes` to `tmp`, then move it into place so readers never see a partial file.
fn write_via(tmp: &Path, path: &Path, bytes: &[u8]) -> Result<(), BusError> {
    fs::write(tmp, bytes).map_err(|e| BusError::Closed(e.to_string()))?;
    fs::rename(tmp, path).map_err(|e| {
        let _ = fs::remove_file(tmp);
        BusError::Closed(e.to_string())
    })
}

impl BroadcastMedium for DirMedium {
    fn publish(&self, text: &str) -> Result<(), BusError> {
        let now_ms = SystemClock.now_ms();
        let record = SpoolRecord {
            sender: self.context,
            sent_at: now_ms,
            body: text.to_string(),
        };
        let encoded = serde_json::to_vec(&record).map_err(|e| BusError::Encode(e.to_string()))?;

        let id = uuid::Uuid::new_v4();
        let tmp = self.dir.join(format!(".{}.tmp", id));
        let path = self.dir.join(format!("{}-{}{}", now_ms, id, SUFFIX));
        write_via(&tmp, &path, &encoded)?;

        self.prune(now_ms);
        Ok(())
    }
}

/// Subscriber-side view of the spool: which message files were handled.
///
/// Names leave the set once their file is gone, so pruning keeps it bounded.
struct SpoolReader {
    dir: PathBuf,
    context: PeerId,
    seen: HashSet<String>,
}

impl SpoolReader {
    fn new(medium: &DirMedium) -> Self {
        Self {
            dir: medium.dir.clone(),
            context: medium.context,
            seen: medium.message_names().into_iter().collect(),
        }
    }

    /// Body of a message file from another context, at most once per file.
    fn on_file(&mut self, name: &str) -> Option<String> {
        if !name.ends_with(SUFFIX) {
            return None;
        }
        // Pruned files show up as events too.
        let Ok(raw) = fs::read(self.dir.join(name)) else {
            self.seen.remove(name);
            return None;
        };
        if !self.seen.insert(name.to_string()) {
            return None;
        }
        match serde_json::from_slice::<SpoolRecord>(&raw) {
            Ok(record) if record.sender == self.context => None,
            Ok(record) => Some(record.body),
            Err(e) => {
                debug!("Skipping unreadable spool file {}: {}", name, e);
                None
            }
        }
    }
}

impl ObservableMedium for DirMedium {
    fn subscribe(&self, callback: MessageCallback) -> Subscription {
        let reader = Mutex::new(SpoolReader::new(self));

        let watcher = DirWatcher::new(&self.dir, move |name| {
            let body = reader.lock().unwrap_or_else(|e| e.into_inner()).on_file(name);
            if let Some(body) = body {
                callback(body);
            }
        });

        match watcher {
            Ok(watcher) => Subscription::new(move || drop(watcher)),
            Err(e) => {
                warn!("Failed to watch spool {:?}: {}", self.dir, e);
                Subscription::new(|| {})
            }
        }
    }
}
