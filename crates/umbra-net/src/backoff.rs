//! Exponential backoff for reconnect attempts
//!
//! Each retry waits twice as long as the previous one, up to a hard cap,
//! with a random fraction of extra delay so a fleet of clients that lost
//! the same server does not redial in lockstep.

use rand::Rng;
use std::time::Duration;

/// Doubling beyond this many attempts cannot matter: any sane cap is hit
/// long before `initial_backoff << 20`.
const MAX_DOUBLINGS: u32 = 20;

/// Reconnect backoff policy
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// How many reconnect attempts to make before giving up (0 disables
    /// retries entirely)
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Ceiling no computed delay will exceed (before jitter)
    pub max_backoff: Duration,
    /// Fraction of the delay (0.0..=1.0) added on top as random jitter
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            jitter_factor: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Delay to sleep before retry number `attempt` (0-indexed)
    ///
    /// The base delay is `initial_backoff * 2^attempt`, clamped to
    /// `max_backoff`. On top of that, a uniformly random extra of up to
    /// `jitter_factor * base` is drawn fresh on every call.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let doublings = attempt.min(MAX_DOUBLINGS);
        let base = self
            .initial_backoff
            .saturating_mul(1u32 << doublings)
            .min(self.max_backoff);

        let jitter_cap = base.mul_f64(self.jitter_factor.clamp(0.0, 1.0));
        let jitter = jitter_cap.mul_f64(rand::thread_rng().gen::<f64>());

        base + jitter
    }
}
