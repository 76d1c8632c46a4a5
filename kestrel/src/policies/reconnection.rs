//! How long to wait before refilling the pool of a node that lost all its connections.

use std::time::Duration;

use rand::Rng;

/// Decides the delay before the next attempt to reconnect to a node.
///
/// `attempt` counts the connection attempts that failed since the last successful one.
/// The pool of a node that is still reported Up is refilled after that delay by the cluster worker.
pub trait ReconnectionPolicy: std::fmt::Debug + Send + Sync {
    /// The delay before reconnection attempt number `attempt`.
    fn delay(&self, attempt: u32) -> Duration;

    /// Returns the name of the policy.
    fn name(&self) -> String;
}

/// Waits the same delay before every attempt.
#[derive(Debug, Clone)]
pub struct ConstantReconnectionPolicy {
    delay: Duration,
}

impl ConstantReconnectionPolicy {
    /// Creates a policy waiting `delay` before every attempt.
    pub fn new(delay: Duration) -> Self {
        ConstantReconnectionPolicy { delay }
    }
}

impl Default for ConstantReconnectionPolicy {
    fn default() -> Self {
        ConstantReconnectionPolicy::new(Duration::from_secs(2))
    }
}

impl ReconnectionPolicy for ConstantReconnectionPolicy {
    fn delay(&self, _attempt: u32) -> Duration {
        self.delay
    }

    fn name(&self) -> String {
        format!("ConstantReconnectionPolicy({:?})", self.delay)
    }
}

// Jitter applied to each exponential delay, in percent.
const JITTER_PERCENT: u64 = 15;

/// Doubles the delay with every failed attempt, up to a maximum.
///
/// Each delay is randomized by up to 15% in either direction,
/// so that nodes lost together are not all reconnected at once.
#[derive(Debug, Clone)]
pub struct ExponentialReconnectionPolicy {
    base_delay: Duration,
    max_delay: Duration,
}

impl ExponentialReconnectionPolicy {
    /// Creates a policy starting at `base_delay`, never waiting longer than `max_delay`.
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        ExponentialReconnectionPolicy {
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    fn undithered_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

impl Default for ExponentialReconnectionPolicy {
    fn default() -> Self {
        ExponentialReconnectionPolicy::new(Duration::from_secs(2), Duration::from_secs(600))
    }
}

impl ReconnectionPolicy for ExponentialReconnectionPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        let delay = self.undithered_delay(attempt);
        let millis = delay.as_millis().min(u64::MAX as u128) as u64;
        let jitter = millis * JITTER_PERCENT / 100;
        if jitter == 0 {
            return delay;
        }
        let dithered = rand::rng().random_range(millis - jitter..=millis.saturating_add(jitter));
        Duration::from_millis(dithered).min(self.max_delay)
    }

    fn name(&self) -> String {
        format!(
            "ExponentialReconnectionPolicy(base: {:?}, max: {:?})",
            self.base_delay, self.max_delay
        )
    }
}
