//! Clock, rate and backoff helpers shared across the node

pub mod logging;
pub mod retry;

pub use logging::init_logging;
pub use retry::RetryPolicy;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Wall clock in Unix milliseconds, as carried in headers and gossip envelopes
pub fn current_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Render a hash rate with an SI prefix, e.g. `1.50 KH/s`
pub fn format_hash_rate(hashes_per_sec: f64) -> String {
    const UNITS: [&str; 6] = ["H/s", "KH/s", "MH/s", "GH/s", "TH/s", "PH/s"];
    let mut rate = hashes_per_sec;
    let mut unit = UNITS[0];
    for next in &UNITS[1..] {
        if rate < 1000.0 {
            break;
        }
        rate /= 1000.0;
        unit = next;
    }
    format!("{:.2} {}", rate, unit)
}

/// Hashes per second; zero for an empty interval
pub fn compute_hash_rate(hashes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs == 0.0 {
        return 0.0;
    }
    hashes as f64 / secs
}

/// Doubling delay between resubmissions, capped at `max`
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            next: initial.min(max),
            max,
            attempts: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        self.attempts += 1;
        delay
    }

    /// Delays handed out so far
    pub fn attempt(&self) -> u32 {
        self.attempts
    }
}
