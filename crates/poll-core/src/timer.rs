//! Timer bookkeeping and jitter.
//!
//! The engine never sleeps. It arms timers by emitting `StartTimer` effects and
//! remembers which ids are live, so a timer the host failed to cancel is
//! recognized and ignored when it fires.

use crate::effect::{Effect, TimerId, TimerKind};
use rand::rngs::StdRng;
use rand::Rng;
use std::collections::HashMap;
use std::ops::Range;
use std::time::Duration;

/// Armed timers plus the RNG used for randomized delays.
pub struct Timers {
    rng: StdRng,
    next_id: u64,
    armed: HashMap<TimerId, TimerKind>,
}

impl Timers {
    pub fn new(rng: StdRng) -> Self {
        Self {
            rng,
            next_id: 1,
            armed: HashMap::new(),
        }
    }

    /// Arm a timer with a fixed delay.
    pub fn arm(&mut self, kind: TimerKind, delay: Duration, out: &mut Vec<Effect>) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.armed.insert(id, kind);
        out.push(Effect::StartTimer { id, kind, delay });
        id
    }

    /// Arm a timer with a delay drawn uniformly from `range_ms`.
    pub fn arm_jittered(
        &mut self,
        kind: TimerKind,
        range_ms: Range<u64>,
        out: &mut Vec<Effect>,
    ) -> TimerId {
        let delay = Duration::from_millis(self.rng.random_range(range_ms));
        self.arm(kind, delay, out)
    }

    /// Cancel a timer. Emits nothing if it already fired or was cancelled.
    pub fn cancel(&mut self, id: TimerId, out: &mut Vec<Effect>) {
        if self.armed.remove(&id).is_some() {
            out.push(Effect::CancelTimer { id });
        }
    }

    /// Cancel every armed timer.
    pub fn cancel_all(&mut self, out: &mut Vec<Effect>) {
        let mut ids: Vec<TimerId> = self.armed.drain().map(|(id, _)| id).collect();
        ids.sort();
        out.extend(ids.into_iter().map(|id| Effect::CancelTimer { id }));
    }

    /// Consume a fired timer. Returns `None` for unknown or cancelled ids.
    pub fn fire(&mut self, id: TimerId) -> Option<TimerKind> {
        self.armed.remove(&id)
    }

    pub fn is_armed(&self, id: TimerId) -> bool {
        self.armed.contains_key(&id)
    }

    /// Number of armed timers of the given kind.
    pub fn count(&self, kind: TimerKind) -> usize {
        self.armed.values().filter(|k| **k == kind).count()
    }

    pub fn armed_count(&self) -> usize {
        self.armed.len()
    }
}
