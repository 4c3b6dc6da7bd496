//! Output vocabulary of the engine.
//!
//! Hosts execute effects in order. Serialized as camelCase tagged JSON so the
//! browser host can hand them straight to JavaScript.

use serde::{Deserialize, Serialize, Serializer};
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Handle for an armed timer. Unique for the lifetime of one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimerId(pub(crate) u64);

impl TimerId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for TimerId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// What a timer is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TimerKind {
    /// Next poll attempt of the active poller
    NextPoll,
    /// Delayed step-down after a rate-limit collision
    SelfDemote,
    /// Randomized re-read of the lock
    Recheck,
    /// Re-registration after the peer count was reset
    Recount,
    /// Periodic stale-lock check
    LeaseWatch,
}

/// Handle for one outstanding poll request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttemptId(pub(crate) u64);

impl AttemptId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for AttemptId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Payload sent to the remote endpoint with every poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollRequest {
    /// Advisory number of live peers
    pub peer_count: u64,
    /// RFC 3339 UTC time of the attempt
    pub timestamp: String,
}

impl PollRequest {
    pub fn new(peer_count: u64, now_ms: u64) -> Self {
        Self {
            peer_count,
            timestamp: format_timestamp(now_ms),
        }
    }
}

fn format_timestamp(now_ms: u64) -> String {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(now_ms) * 1_000_000)
        .ok()
        .and_then(|t| t.format(&Rfc3339).ok())
        .unwrap_or_else(|| now_ms.to_string())
}

/// Why a poll failed. Always transient: the loop reschedules regardless.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PollError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Poll timed out after {0:?}")]
    Timeout(Duration),
}

/// Something the host must do on the engine's behalf.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Effect {
    /// Call back `on_timer(id)` after `delay`.
    StartTimer {
        id: TimerId,
        kind: TimerKind,
        #[serde(rename = "delayMs", serialize_with = "as_millis")]
        delay: Duration,
    },
    /// Drop a timer armed earlier. Firing it anyway is harmless.
    CancelTimer { id: TimerId },
    /// Issue the request, then call `on_poll_complete(attempt, ..)` exactly once.
    Poll {
        attempt: AttemptId,
        endpoint: String,
        request: PollRequest,
    },
    /// Hand a poll result to the application.
    Deliver { data: serde_json::Value },
    /// The "this context is the active poller" marker flipped.
    ActiveChanged { active: bool },
}

fn as_millis<S: Serializer>(delay: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(delay.as_millis() as u64)
}
