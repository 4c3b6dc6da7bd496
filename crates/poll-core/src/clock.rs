//! Wall clock capability for hosts.
//!
//! The engine itself never reads the clock; hosts pass `now_ms` into every input.

use crate::platform::ThreadSafe;

/// Source of the current time in milliseconds since the Unix epoch.
pub trait Clock: ThreadSafe {
    fn now_ms(&self) -> u64;
}

/// Wall clock backed by `web_time`, which works natively and in the browser.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        web_time::SystemTime::now()
            .duration_since(web_time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}
