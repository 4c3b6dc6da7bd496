//! Engine configuration and the namespace key layout.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::time::Duration;
use thiserror::Error;

/// Default spacing between poll attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5000);

/// An attempt arriving sooner than `poll_interval - RATE_LIMIT_MARGIN` after the
/// previous one means another poller is active.
pub const RATE_LIMIT_MARGIN: Duration = Duration::from_millis(500);

/// Delay window (ms) before re-reading the lock after contention.
pub const RECHECK_JITTER_MS: Range<u64> = 500..2500;

/// Delay window (ms) before a rate-limited poller steps down.
pub const DEMOTION_JITTER_MS: Range<u64> = 500..2500;

/// Delay window (ms) before re-registering after the peer count was reset.
pub const RECOUNT_JITTER_MS: Range<u64> = 50..1050;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Namespace cannot be empty")]
    EmptyNamespace,

    #[error("Poll interval must exceed {margin:?}, got {interval:?}")]
    IntervalTooShort { interval: Duration, margin: Duration },

    #[error("Lock lease {lease:?} must be longer than the poll interval {interval:?}")]
    LeaseTooShort { lease: Duration, interval: Duration },
}

/// String prefix isolating one coordination domain's keys and channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Namespace(String);

impl Namespace {
    pub fn new(prefix: impl Into<String>) -> Result<Self, ConfigError> {
        let prefix = prefix.into();
        if prefix.is_empty() {
            return Err(ConfigError::EmptyNamespace);
        }
        Ok(Self(prefix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key holding the advisory peer count.
    pub fn count_key(&self) -> String {
        format!("{}_Tabs", self.0)
    }

    /// Key holding the lock flag.
    pub fn lock_key(&self) -> String {
        format!("{}in_work", self.0)
    }

    /// Key holding the leader's heartbeat record.
    pub fn heartbeat_key(&self) -> String {
        format!("{}in_work_at", self.0)
    }

    /// Name of the broadcast channel for this namespace.
    pub fn channel_name(&self) -> String {
        format!("{}poll_channel", self.0)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Namespace {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Namespace> for String {
    fn from(namespace: Namespace) -> Self {
        namespace.0
    }
}

/// What a departing peer does to the shared peer count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CounterTeardown {
    /// Subtract one.
    #[default]
    Decrement,
    /// Remove the key so every survivor re-registers after a short delay.
    Reset,
}

/// Configuration for a [`CoordinationEngine`](crate::CoordinationEngine).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Coordination domain
    pub namespace: Namespace,
    /// Opaque handle passed through to the poll capability
    pub endpoint: String,
    /// Spacing between poll attempts (default: 5s)
    pub poll_interval: Duration,
    /// Heartbeat age after which a held lock counts as abandoned.
    /// `None` disables stale-lock detection entirely.
    pub lock_lease: Option<Duration>,
    /// What teardown does to the peer count (default: decrement)
    pub counter_teardown: CounterTeardown,
}

impl EngineConfig {
    /// Create a configuration with default timing.
    ///
    /// The lease defaults to three poll intervals.
    pub fn new(namespace: Namespace, endpoint: impl Into<String>) -> Self {
        Self {
            namespace,
            endpoint: endpoint.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            lock_lease: Some(DEFAULT_POLL_INTERVAL * 3),
            counter_teardown: CounterTeardown::default(),
        }
    }

    /// Set the poll interval. A lease still at its default is rescaled to match.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        if self.lock_lease == Some(self.poll_interval * 3) {
            self.lock_lease = Some(interval * 3);
        }
        self.poll_interval = interval;
        self
    }

    pub fn with_lock_lease(mut self, lease: Option<Duration>) -> Self {
        self.lock_lease = lease;
        self
    }

    pub fn with_counter_teardown(mut self, teardown: CounterTeardown) -> Self {
        self.counter_teardown = teardown;
        self
    }

    /// Minimum spacing between attempts before the rate-limit heuristic fires.
    pub fn rate_limit_threshold(&self) -> Duration {
        self.poll_interval.saturating_sub(RATE_LIMIT_MARGIN)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval <= RATE_LIMIT_MARGIN {
            return Err(ConfigError::IntervalTooShort {
                interval: self.poll_interval,
                margin: RATE_LIMIT_MARGIN,
            });
        }
        if let Some(lease) = self.lock_lease {
            if lease <= self.poll_interval {
                return Err(ConfigError::LeaseTooShort {
                    lease,
                    interval: self.poll_interval,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns() -> Namespace {
        Namespace::new("ns_").unwrap()
    }

    #[test]
    fn test_namespace_keys() {
        let namespace = ns();
        assert_eq!(namespace.count_key(), "ns__Tabs");
        assert_eq!(namespace.lock_key(), "ns_in_work");
        assert_eq!(namespace.heartbeat_key(), "ns_in_work_at");
        assert_eq!(namespace.channel_name(), "ns_poll_channel");
    }

    #[test]
    fn test_empty_namespace_rejected() {
        assert_eq!(Namespace::new(""), Err(ConfigError::EmptyNamespace));
        assert!(serde_json::from_str::<Namespace>("\"\"").is_err());
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::new(ns(), "/api/ping");
        assert_eq!(config.poll_interval, Duration::from_millis(5000));
        assert_eq!(config.lock_lease, Some(Duration::from_millis(15000)));
        assert_eq!(config.counter_teardown, CounterTeardown::Decrement);
        assert_eq!(config.rate_limit_threshold(), Duration::from_millis(4500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_interval_rescales_default_lease() {
        let config = EngineConfig::new(ns(), "e").with_poll_interval(Duration::from_secs(2));
        assert_eq!(config.lock_lease, Some(Duration::from_secs(6)));

        let custom = EngineConfig::new(ns(), "e")
            .with_lock_lease(Some(Duration::from_secs(60)))
            .with_poll_interval(Duration::from_secs(2));
        assert_eq!(custom.lock_lease, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_interval_must_exceed_margin() {
        let config = EngineConfig::new(ns(), "e").with_poll_interval(Duration::from_millis(500));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::IntervalTooShort { .. })
        ));
    }

    #[test]
    fn test_lease_must_exceed_interval() {
        let config = EngineConfig::new(ns(), "e").with_lock_lease(Some(Duration::from_secs(5)));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::LeaseTooShort { .. })
        ));

        let disabled = EngineConfig::new(ns(), "e").with_lock_lease(None);
        assert!(disabled.validate().is_ok());
    }
}
