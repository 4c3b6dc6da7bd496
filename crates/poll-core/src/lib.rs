//! poll-core: single-poller leader election for peer contexts sharing one client.
//!
//! Many contexts (browser tabs, processes sharing a directory) run this protocol
//! against the same namespace. One of them becomes the active poller, calls the
//! remote endpoint on a fixed interval and broadcasts results to everyone else.
//!
//! This crate provides:
//! - `KeyValueStore` and `BroadcastMedium` capability traits plus in-memory fakes
//! - `SharedCounter`, `LeaderLock` and `BroadcastBus` over those capabilities
//! - `PollScheduler`, the rate-limited poll loop
//! - `CoordinationEngine`, the composition root
//!
//! The engine does no I/O of its own. Every input takes the current time in
//! milliseconds and returns a list of [`Effect`]s (arm a timer, issue a poll,
//! deliver data) for the host to carry out.

pub mod bus;
pub mod clock;
pub mod config;
pub mod counter;
pub mod effect;
pub mod engine;
pub mod lock;
pub mod peer_id;
pub mod platform;
pub mod scheduler;
pub mod store;
pub mod subscription;
pub mod timer;

pub use bus::{
    BroadcastBus, BroadcastMedium, BroadcastMessage, BusError, InMemoryMedium, MessageCallback, ObservableMedium,
};
pub use clock::{Clock, SystemClock};
pub use config::{ConfigError, CounterTeardown, EngineConfig, Namespace};
pub use counter::SharedCounter;
pub use effect::{AttemptId, Effect, PollError, PollRequest, TimerId, TimerKind};
pub use engine::{CoordinationEngine, EngineStatus};
pub use lock::{Heartbeat, LeaderLock, LockState};
pub use peer_id::{PeerId, PeerIdError};
pub use scheduler::{PollScheduler, SchedulerState};
pub use store::{ChangeCallback, InMemoryStore, KeyValueStore, ObservableStore, StoreChange, StoreError};
pub use subscription::Subscription;
pub use timer::Timers;
