//! Log rate-limiting for noisy, repeating error paths: fetch
//! failures, "too old"/"not found" resolution errors, and sink drop warnings
//! are each logged at most once per configured interval per key.

// std
use std::collections::HashMap;
// crates.io
use tokio::sync::Mutex;
// self
use crate::_prelude::*;

/// Tracks the last-emitted time per key and suppresses repeats within `period`.
pub struct RateLimiter {
	period: Duration,
	last_emitted: Mutex<HashMap<String, Instant>>,
}
impl RateLimiter {
	/// Build a limiter that allows at most one log per `period` per key.
	pub fn new(period: Duration) -> Self {
		Self { period, last_emitted: Mutex::new(HashMap::new()) }
	}

	/// Whether a log for `key` is allowed right now; if so, records the emission.
	pub async fn allow(&self, key: &str) -> bool {
		let mut last_emitted = self.last_emitted.lock().await;
		let now = Instant::now();

		match last_emitted.get(key) {
			Some(last) if now.duration_since(*last) < self.period => false,
			_ => {
				last_emitted.insert(key.to_string(), now);

				true
			},
		}
	}
}

/// Per-fetcher-task rate limit: at most once per 10 minutes per task.
pub fn fetch_error_limiter() -> RateLimiter {
	RateLimiter::new(Duration::from_secs(10 * 60))
}

/// Per-metric/version rate limit: at most once per hour.
pub fn resolution_error_limiter() -> RateLimiter {
	RateLimiter::new(Duration::from_secs(60 * 60))
}

/// Per-sink retry/drop rate limit: at most once per 10 s.
pub fn sink_drop_limiter() -> RateLimiter {
	RateLimiter::new(Duration::from_secs(10))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn second_call_within_period_is_suppressed() {
		let limiter = RateLimiter::new(Duration::from_secs(60));

		assert!(limiter.allow("db1/db_stats").await);
		assert!(!limiter.allow("db1/db_stats").await);
	}

	#[tokio::test]
	async fn distinct_keys_are_independent() {
		let limiter = RateLimiter::new(Duration::from_secs(60));

		assert!(limiter.allow("db1/db_stats").await);
		assert!(limiter.allow("db2/db_stats").await);
	}
}
