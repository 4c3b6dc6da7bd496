//! poll-daemon library: native hosts for the poll coordination engine.
//!
//! Exposes the runtime pieces so integration tests (and the binary) can run
//! peers against in-memory or directory-backed stores.

pub mod capability;
pub mod dir_store;
pub mod runtime;
pub mod spool;
pub mod watcher;

// Re-export key types for convenience
pub use capability::{LocalPoll, PollCapability, WebSocketPoll};
pub use dir_store::DirStore;
pub use runtime::{PeerEvent, PeerHandle, PeerInput, TokioClock, spawn_peer};
pub use spool::DirMedium;
pub use watcher::DirWatcher;
