//! Peer options as handed over from JavaScript.
//!
//! Durations are plain millisecond numbers on the JS side.

use poll_core::{ConfigError, CounterTeardown, EngineConfig, Namespace};
use serde::Deserialize;
use std::time::Duration;

/// `{ namespace, endpoint, pollIntervalMs?, lockLeaseMs?, disableLease?, counterTeardown? }`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerOptions {
    pub namespace: String,
    pub endpoint: String,
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    /// Defaults to three poll intervals
    #[serde(default)]
    pub lock_lease_ms: Option<u64>,
    /// Never treat a held lock as abandoned
    #[serde(default)]
    pub disable_lease: bool,
    /// `"decrement"` (default) or `"reset"`
    #[serde(default)]
    pub counter_teardown: CounterTeardown,
}

impl PeerOptions {
    pub fn into_config(self) -> Result<EngineConfig, ConfigError> {
        let mut config = EngineConfig::new(Namespace::new(self.namespace)?, self.endpoint);
        if let Some(ms) = self.poll_interval_ms {
            config = config.with_poll_interval(Duration::from_millis(ms));
        }
        if self.disable_lease {
            config = config.with_lock_lease(None);
        } else if let Some(ms) = self.lock_lease_ms {
            config = config.with_lock_lease(Some(Duration::from_millis(ms)));
        }
        config = config.with_counter_teardown(self.counter_teardown);

        config.validate()?;
        Ok(config)
    }
}
