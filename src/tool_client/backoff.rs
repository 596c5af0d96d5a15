//! Reconnect backoff policy.
//!
//! Exponential backoff with jitter, a capped delay, and a bounded number of
//! attempts. Once attempts are exhausted the server is reported permanently
//! unavailable until someone refreshes it.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Backoff limits for connection attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the second attempt (doubles each attempt after).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound on any single delay, before jitter.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Total connection attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Fraction of the delay randomly added or removed (0.0 disables jitter).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_max_attempts() -> u32 {
    5
}
fn default_jitter() -> f64 {
    0.2
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
            jitter: default_jitter(),
        }
    }
}

impl BackoffPolicy {
    /// Un-jittered delay before attempt `attempt` (1-based).
    ///
    /// Attempt 1 runs immediately; attempt `n` waits `base * 2^(n-2)`,
    /// capped at `max_delay_ms`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 2).min(32);
        let delay = self
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// Delay before attempt `attempt`, with jitter applied.
    ///
    /// Jitter never pushes the delay above the cap.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if base.is_zero() || self.jitter <= 0.0 {
            return base;
        }
        let jitter = self.jitter.min(1.0);
        let factor = rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter);
        let jittered = (base.as_millis() as f64 * factor).round() as u64;
        Duration::from_millis(jittered.min(self.max_delay_ms))
    }

    /// Whether another attempt is allowed after `attempts_made`.
    pub fn allows(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts.max(1)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
