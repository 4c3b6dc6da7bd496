//! Poll loop of the active peer.
//!
//! Implements the rate-limited loop:
//! 1. Abort if no longer polling or the shared lock was cleared
//! 2. If this attempt comes too soon after the previous one, or another peer's
//!    heartbeat is that fresh, another poller is active: step down after a
//!    random delay
//! 3. Skip the request while the network is known to be down
//! 4. Otherwise issue the request; its completion publishes the result and
//!    schedules the next attempt
//!
//! Poll failures never end the loop. Only a rate-limit collision, an explicit
//! `stop()`, or a cleared lock do.

use crate::bus::{BroadcastBus, BroadcastMedium, BroadcastMessage};
use crate::config::{DEMOTION_JITTER_MS, EngineConfig};
use crate::counter::SharedCounter;
use crate::effect::{AttemptId, Effect, PollError, PollRequest, TimerId, TimerKind};
use crate::lock::LeaderLock;
use crate::store::KeyValueStore;
use crate::timer::Timers;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Lifecycle of the local poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SchedulerState {
    /// Never started
    Idle,
    /// Active poller, attempts running on the interval
    Polling,
    /// Collision detected, stepping down once the demotion timer fires
    RateLimited,
    /// Stepped down; `start` may run the loop again
    Stopped,
}

pub struct PollScheduler<S, M> {
    lock: LeaderLock<S>,
    counter: SharedCounter<S>,
    bus: BroadcastBus<M>,
    endpoint: String,
    interval: Duration,
    rate_limit: Duration,
    state: SchedulerState,
    /// Completion time of the last poll (ms). Zero after a collision.
    last_poll_tick: u64,
    next_poll: Option<TimerId>,
    demotion: Option<TimerId>,
    in_flight: Option<AttemptId>,
    next_attempt: u64,
    network: Option<bool>,
}

impl<S: KeyValueStore, M: BroadcastMedium> PollScheduler<S, M> {
    pub fn new(
        config: &EngineConfig,
        lock: LeaderLock<S>,
        counter: SharedCounter<S>,
        bus: BroadcastBus<M>,
    ) -> Self {
        Self {
            lock,
            counter,
            bus,
            endpoint: config.endpoint.clone(),
            interval: config.poll_interval,
            rate_limit: config.rate_limit_threshold(),
            state: SchedulerState::Idle,
            last_poll_tick: 0,
            next_poll: None,
            demotion: None,
            in_flight: None,
            next_attempt: 1,
            network: None,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// True while this peer runs (or is winding down) the poll loop.
    pub fn is_fetching(&self) -> bool {
        matches!(
            self.state,
            SchedulerState::Polling | SchedulerState::RateLimited
        )
    }

    pub fn last_poll_tick(&self) -> u64 {
        self.last_poll_tick
    }

    pub fn in_flight(&self) -> Option<AttemptId> {
        self.in_flight
    }

    /// `Some(false)` skips requests until the signal changes.
    pub fn set_network_available(&mut self, available: Option<bool>) {
        self.network = available;
    }

    /// Become the active poller and attempt a poll right away.
    ///
    /// No-op if the loop is already running.
    pub fn start(&mut self, now_ms: u64, timers: &mut Timers, out: &mut Vec<Effect>) {
        if self.is_fetching() {
            return;
        }

        info!(endpoint = %self.endpoint, "Taking the poll lock, this context is now the active poller");
        self.state = SchedulerState::Polling;
        if let Err(e) = self.lock.acquire(now_ms) {
            warn!("Failed to write poll lock: {}", e);
        }
        out.push(Effect::ActiveChanged { active: true });

        self.attempt(now_ms, timers, out);
    }

    /// Step down: release the lock and cancel pending work.
    ///
    /// Already stopped: no writes, no effects.
    pub fn stop(&mut self, timers: &mut Timers, out: &mut Vec<Effect>) {
        if !self.is_fetching() {
            return;
        }

        info!("Stopping poll loop and releasing the lock");
        if let Err(e) = self.lock.release() {
            warn!("Failed to release poll lock: {}", e);
        }
        self.wind_down(timers, out);
    }

    /// Route a fired timer owned by the scheduler.
    pub fn on_timer(
        &mut self,
        id: TimerId,
        kind: TimerKind,
        now_ms: u64,
        timers: &mut Timers,
        out: &mut Vec<Effect>,
    ) {
        match kind {
            TimerKind::NextPoll if self.next_poll == Some(id) => {
                self.next_poll = None;
                self.attempt(now_ms, timers, out);
            }
            TimerKind::SelfDemote if self.demotion == Some(id) => {
                self.demotion = None;
                self.stop(timers, out);
            }
            _ => debug!(?kind, "Ignoring timer not owned by the poll loop"),
        }
    }

    /// Continuation of a poll request. Runs once per attempt; repeats are ignored.
    pub fn complete(
        &mut self,
        attempt: AttemptId,
        result: Result<serde_json::Value, PollError>,
        now_ms: u64,
        timers: &mut Timers,
        out: &mut Vec<Effect>,
    ) {
        if self.in_flight != Some(attempt) {
            debug!(attempt = attempt.as_u64(), "Ignoring completion of unknown poll attempt");
            return;
        }
        self.in_flight = None;

        match result {
            Ok(data) => {
                debug!("Poll returned data, broadcasting");
                let message = BroadcastMessage::NewData { data: data.clone() };
                if let Err(e) = self.bus.publish(&message) {
                    warn!("Failed to broadcast poll result: {}", e);
                }
                out.push(Effect::Deliver { data });
            }
            Err(e) => warn!("Poll failed: {}", e),
        }

        if self.last_poll_tick > 0 {
            debug!(elapsed = now_ms.saturating_sub(self.last_poll_tick), "Poll cycle complete");
        }
        self.last_poll_tick = now_ms;

        // A stopped loop records the tick but never re-arms.
        if self.state == SchedulerState::Polling {
            // A slow request must not age the heartbeat past the lease.
            if self.lock_held() {
                if let Err(e) = self.lock.touch(now_ms) {
                    warn!("Failed to refresh lock heartbeat: {}", e);
                }
            }
            self.schedule_next(timers, out);
        }
    }

    fn attempt(&mut self, now_ms: u64, timers: &mut Timers, out: &mut Vec<Effect>) {
        if self.state != SchedulerState::Polling || !self.lock_held() {
            debug!("Poll lock no longer ours, abandoning loop");
            self.wind_down(timers, out);
            return;
        }

        if self.collision(now_ms) {
            self.last_poll_tick = 0;
            self.state = SchedulerState::RateLimited;
            self.demotion = Some(timers.arm_jittered(TimerKind::SelfDemote, DEMOTION_JITTER_MS, out));
            return;
        }

        if let Err(e) = self.lock.touch(now_ms) {
            warn!("Failed to refresh lock heartbeat: {}", e);
        }

        if self.in_flight.is_some() {
            // The outstanding request's completion re-arms the loop.
            debug!("Previous poll still outstanding, not issuing another");
            return;
        }

        if self.network == Some(false) {
            debug!("Network unavailable, skipping this poll");
            self.schedule_next(timers, out);
            return;
        }

        let peer_count = self.counter.get().unwrap_or_else(|e| {
            warn!("Failed to read peer count: {}", e);
            0
        });
        let attempt = AttemptId(self.next_attempt);
        self.next_attempt += 1;
        self.in_flight = Some(attempt);

        debug!(peer_count, attempt = attempt.as_u64(), "Polling");
        out.push(Effect::Poll {
            attempt,
            endpoint: self.endpoint.clone(),
            request: PollRequest::new(peer_count, now_ms),
        });
    }

    /// Another poller is active if we are being asked to poll too soon after our
    /// own last poll, or another peer has refreshed the heartbeat that recently.
    fn collision(&self, now_ms: u64) -> bool {
        let threshold = self.rate_limit.as_millis() as u64;

        if self.last_poll_tick > 0 {
            let elapsed = now_ms.saturating_sub(self.last_poll_tick);
            if elapsed < threshold {
                info!(elapsed, threshold, "Poll attempt came too soon after the previous one, yielding");
                return true;
            }
        }

        match self.lock.foreign_heartbeat(now_ms, self.rate_limit) {
            Ok(Some(beat)) => {
                info!(holder = %beat.holder, age = now_ms.saturating_sub(beat.at), "Another peer is polling, yielding");
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!("Failed to read lock heartbeat: {}", e);
                false
            }
        }
    }

    fn schedule_next(&mut self, timers: &mut Timers, out: &mut Vec<Effect>) {
        if let Some(previous) = self.next_poll.take() {
            timers.cancel(previous, out);
        }
        self.next_poll = Some(timers.arm(TimerKind::NextPoll, self.interval, out));
    }

    /// Leave the loop without touching the lock.
    fn wind_down(&mut self, timers: &mut Timers, out: &mut Vec<Effect>) {
        let was_fetching = self.is_fetching();
        self.state = SchedulerState::Stopped;
        if let Some(id) = self.next_poll.take() {
            timers.cancel(id, out);
        }
        if let Some(id) = self.demotion.take() {
            timers.cancel(id, out);
        }
        if was_fetching {
            out.push(Effect::ActiveChanged { active: false });
        }
    }

    /// Unreadable lock counts as held so a storage hiccup never makes a peer grab it.
    fn lock_held(&self) -> bool {
        self.lock.is_held().unwrap_or_else(|e| {
            warn!("Failed to read poll lock: {}", e);
            true
        })
    }
}
