//! Exponential reconnect backoff between a floor and a ceiling.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
	pub min: Duration,
	pub max: Duration,
}

impl BackoffPolicy {
	pub fn new(min: Duration, max: Duration) -> Self {
		BackoffPolicy { min, max }
	}

	/// Delay before the given reconnect attempt (0-indexed).
	pub fn delay(&self, attempt: u32) -> Duration {
		let factor = 2u32.saturating_pow(attempt);
		self.min.saturating_mul(factor).min(self.max)
	}
}

impl Default for BackoffPolicy {
	/// 1s doubling up to 32s.
	fn default() -> Self {
		BackoffPolicy {
			min: Duration::from_secs(1),
			max: Duration::from_secs(32),
		}
	}
}

/// Attempt counter on top of a [`BackoffPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
	policy: BackoffPolicy,
	attempt: u32,
}

impl Backoff {
	pub fn new(policy: BackoffPolicy) -> Self {
		Backoff { policy, attempt: 0 }
	}

	/// Delay to wait before the next attempt; advances the counter.
	pub fn next_delay(&mut self) -> Duration {
		let delay = self.policy.delay(self.attempt);
		self.attempt = self.attempt.saturating_add(1);
		delay
	}

	pub fn attempt(&self) -> u32 {
		self.attempt
	}

	pub fn reset(&mut self) {
		self.attempt = 0;
	}
}
