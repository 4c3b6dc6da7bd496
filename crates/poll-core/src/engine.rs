//! Composition root of one peer.
//!
//! `CoordinationEngine` owns the counter, lock, bus and poll loop of a single
//! context and reacts to everything that can happen to it: timers firing, poll
//! completions, storage changes made by other contexts, broadcast messages and
//! teardown. The host performs the returned effects and wires notifications
//! back in.

use crate::bus::{BroadcastBus, BroadcastMedium, BroadcastMessage};
use crate::config::{ConfigError, CounterTeardown, EngineConfig, RECHECK_JITTER_MS, RECOUNT_JITTER_MS};
use crate::counter::SharedCounter;
use crate::effect::{AttemptId, Effect, PollError, TimerId, TimerKind};
use crate::lock::{LeaderLock, LockState};
use crate::peer_id::PeerId;
use crate::scheduler::{PollScheduler, SchedulerState};
use crate::store::{KeyValueStore, StoreChange, StoreError};
use crate::timer::Timers;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Running,
    TornDown,
}

/// Snapshot of a peer for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub peer_id: PeerId,
    pub state: SchedulerState,
    pub active: bool,
    pub peer_count: u64,
    pub lock: Option<LockState>,
}

pub struct CoordinationEngine<S, M> {
    config: EngineConfig,
    peer_id: PeerId,
    counter: SharedCounter<S>,
    lock: LeaderLock<S>,
    bus: BroadcastBus<M>,
    scheduler: PollScheduler<S, M>,
    timers: Timers,
    phase: Phase,
    lease_watch: Option<TimerId>,
    /// At most one randomized re-check is pending at a time
    recheck: Option<TimerId>,
}

impl<S, M> CoordinationEngine<S, M>
where
    S: KeyValueStore + Clone,
    M: BroadcastMedium + Clone,
{
    /// Build an engine. `rng` drives the peer id and every randomized delay.
    pub fn new(config: EngineConfig, store: S, medium: M, mut rng: StdRng) -> Result<Self, ConfigError> {
        config.validate()?;

        let peer_id = PeerId::random(&mut rng);
        let counter = SharedCounter::new(store.clone(), &config.namespace);
        let lock = LeaderLock::new(store, &config.namespace, peer_id);
        let bus = BroadcastBus::new(medium);
        let scheduler = PollScheduler::new(&config, lock.clone(), counter.clone(), bus.clone());

        Ok(Self {
            config,
            peer_id,
            counter,
            lock,
            bus,
            scheduler,
            timers: Timers::new(rng),
            phase: Phase::Created,
            lease_watch: None,
            recheck: None,
        })
    }

    /// Build an engine seeded from OS entropy.
    pub fn with_entropy(config: EngineConfig, store: S, medium: M) -> Result<Self, ConfigError> {
        Self::new(config, store, medium, StdRng::from_os_rng())
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The bus, for hosts that subscribe through it.
    pub fn bus(&self) -> &BroadcastBus<M> {
        &self.bus
    }

    /// True while this context is the active poller.
    pub fn is_active(&self) -> bool {
        self.scheduler.is_fetching()
    }

    pub fn state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    pub fn is_running(&self) -> bool {
        self.phase == Phase::Running
    }

    /// Advisory peer count. Pure read.
    pub fn peer_count(&self) -> u64 {
        self.counter.get().unwrap_or_else(|e| {
            warn!("Failed to read peer count: {}", e);
            0
        })
    }

    pub fn lock_state(&self) -> Result<LockState, StoreError> {
        self.lock.state()
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            peer_id: self.peer_id,
            state: self.state(),
            active: self.is_active(),
            peer_count: self.peer_count(),
            lock: self.lock.state().ok(),
        }
    }

    /// Number of timers the host should currently have pending.
    pub fn armed_timers(&self) -> usize {
        self.timers.armed_count()
    }

    /// Join the namespace: register in the peer count and try to take the lock.
    ///
    /// The first peer to find the lock free starts polling right away; anyone
    /// else waits for a randomized re-check.
    pub fn start(&mut self, now_ms: u64) -> Vec<Effect> {
        let mut out = Vec::new();
        if self.phase != Phase::Created {
            debug!(peer = %self.peer_id, "Engine already started");
            return out;
        }
        self.phase = Phase::Running;

        match self.counter.adjust(1) {
            Ok(count) => info!(peer = %self.peer_id, namespace = %self.config.namespace, count, "Peer joined"),
            Err(e) => warn!("Failed to register in peer count: {}", e),
        }

        if self.lock_held() {
            debug!("Poll lock already held, deferring to re-check");
            self.check_and_start(&mut out);
        } else {
            self.scheduler.start(now_ms, &mut self.timers, &mut out);
        }

        self.arm_lease_watch(&mut out);
        out
    }

    /// A timer armed by this engine fired.
    pub fn on_timer(&mut self, id: TimerId, now_ms: u64) -> Vec<Effect> {
        let mut out = Vec::new();
        if self.phase != Phase::Running {
            return out;
        }
        let Some(kind) = self.timers.fire(id) else {
            debug!(timer = id.as_u64(), "Ignoring stale timer");
            return out;
        };

        match kind {
            TimerKind::NextPoll | TimerKind::SelfDemote => {
                self.scheduler.on_timer(id, kind, now_ms, &mut self.timers, &mut out);
            }
            TimerKind::Recheck => {
                if self.recheck == Some(id) {
                    self.recheck = None;
                }
                self.recheck(now_ms, &mut out);
            }
            TimerKind::Recount => {
                match self.counter.adjust(1) {
                    Ok(count) => debug!(count, "Re-registered after peer count reset"),
                    Err(e) => warn!("Failed to re-register in peer count: {}", e),
                }
                self.check_and_start(&mut out);
            }
            TimerKind::LeaseWatch if self.lease_watch == Some(id) => {
                self.lease_watch = None;
                self.check_lease(now_ms, &mut out);
                self.arm_lease_watch(&mut out);
            }
            TimerKind::LeaseWatch => debug!(timer = id.as_u64(), "Ignoring superseded lease watch"),
        }
        out
    }

    /// Result of the request issued by `Effect::Poll`.
    pub fn on_poll_complete(
        &mut self,
        attempt: AttemptId,
        result: Result<serde_json::Value, PollError>,
        now_ms: u64,
    ) -> Vec<Effect> {
        let mut out = Vec::new();
        // Completions after teardown still record the tick but never re-arm.
        if self.phase == Phase::Created {
            return out;
        }
        self.scheduler.complete(attempt, result, now_ms, &mut self.timers, &mut out);
        out
    }

    /// Another context changed the shared store.
    pub fn on_storage_change(&mut self, change: &StoreChange) -> Vec<Effect> {
        let mut out = Vec::new();
        if self.phase != Phase::Running {
            return out;
        }

        if change.key == self.lock.key() {
            debug!(old = ?change.old_value, new = ?change.new_value, "Poll lock changed");
            self.check_and_start(&mut out);
        } else if change.key == self.counter.key() && change.new_value.is_none() {
            debug!("Peer count reset, re-registering");
            self.timers.arm_jittered(TimerKind::Recount, RECOUNT_JITTER_MS, &mut out);
        }
        out
    }

    /// A message from another context arrived on the bus.
    pub fn on_message(&mut self, message: BroadcastMessage) -> Vec<Effect> {
        let mut out = Vec::new();
        if self.phase != Phase::Running {
            return out;
        }

        match message {
            BroadcastMessage::NewData { data } => out.push(Effect::Deliver { data }),
            BroadcastMessage::CountTabs => {
                if let Err(e) = self.counter.adjust(1) {
                    warn!("Failed to answer peer count request: {}", e);
                }
            }
            BroadcastMessage::Unknown => debug!("Ignoring message of unknown kind"),
        }
        out
    }

    /// Recompute the peer count: restart it at one and ask every other peer to add itself.
    pub fn recount(&mut self) {
        if self.phase != Phase::Running {
            return;
        }
        if let Err(e) = self.counter.set(1) {
            warn!("Failed to reset peer count: {}", e);
            return;
        }
        if let Err(e) = self.bus.publish(&BroadcastMessage::CountTabs) {
            warn!("Failed to broadcast peer count request: {}", e);
        }
    }

    /// `Some(false)` makes the poll loop skip requests until it changes.
    pub fn set_network_available(&mut self, available: Option<bool>) {
        self.scheduler.set_network_available(available);
    }

    /// Leave the namespace. Safe to call more than once.
    pub fn teardown(&mut self) -> Vec<Effect> {
        let mut out = Vec::new();
        let phase = std::mem::replace(&mut self.phase, Phase::TornDown);
        if phase != Phase::Running {
            return out;
        }

        let counted = match self.config.counter_teardown {
            CounterTeardown::Decrement => self.counter.adjust(-1).map(|_| ()),
            CounterTeardown::Reset => self.counter.reset(),
        };
        if let Err(e) = counted {
            warn!("Failed to update peer count on teardown: {}", e);
        }

        self.scheduler.stop(&mut self.timers, &mut out);
        self.timers.cancel_all(&mut out);
        self.lease_watch = None;
        self.recheck = None;

        info!(peer = %self.peer_id, "Peer left");
        out
    }

    /// Arm a randomized re-check, replacing one still pending.
    fn check_and_start(&mut self, out: &mut Vec<Effect>) {
        if let Some(previous) = self.recheck.take() {
            self.timers.cancel(previous, out);
        }
        self.recheck = Some(self.timers.arm_jittered(TimerKind::Recheck, RECHECK_JITTER_MS, out));
    }

    fn recheck_pending(&self) -> bool {
        self.recheck.is_some_and(|id| self.timers.is_armed(id))
    }

    fn recheck(&mut self, now_ms: u64, out: &mut Vec<Effect>) {
        if !self.lock_held() && !self.scheduler.is_fetching() {
            self.scheduler.start(now_ms, &mut self.timers, out);
        } else {
            self.scheduler.stop(&mut self.timers, out);
        }
    }

    /// Non-leaders only. A free lock triggers a re-check unless one is already
    /// pending; a held lock whose holder stopped refreshing the heartbeat is
    /// cleared first.
    fn check_lease(&mut self, now_ms: u64, out: &mut Vec<Effect>) {
        let Some(lease) = self.config.lock_lease else {
            return;
        };
        if self.scheduler.is_fetching() {
            return;
        }

        match self.lock.is_stale(now_ms, lease) {
            Ok(true) => {
                let last = self.lock.heartbeat().ok().flatten();
                warn!(
                    lease_ms = lease.as_millis() as u64,
                    last_holder = ?last.map(|b| b.holder.to_string()),
                    "Poll lock holder stopped refreshing the lock, clearing it"
                );
                if let Err(e) = self.lock.clear() {
                    warn!("Failed to clear stale poll lock: {}", e);
                    return;
                }
                self.check_and_start(out);
            }
            Ok(false) => {
                if !self.recheck_pending() && !self.lock_held() {
                    debug!("Poll lock free with no active poller, re-checking");
                    self.check_and_start(out);
                }
            }
            Err(e) => warn!("Failed to read poll lock: {}", e),
        }
    }

    fn arm_lease_watch(&mut self, out: &mut Vec<Effect>) {
        if let Some(previous) = self.lease_watch.take() {
            self.timers.cancel(previous, out);
        }
        if let Some(lease) = self.config.lock_lease {
            self.lease_watch = Some(self.timers.arm(TimerKind::LeaseWatch, lease, out));
        }
    }

    fn lock_held(&self) -> bool {
        self.lock.is_held().unwrap_or_else(|e| {
            warn!("Failed to read poll lock: {}", e);
            true
        })
    }
}
