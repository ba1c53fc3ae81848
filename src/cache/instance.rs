//! Instance-level cache: metrics whose value is identical across sibling
//! databases on one server are fetched once and shared.

// std
use std::collections::HashMap;
// crates.io
use tokio::sync::RwLock;
// self
use crate::{_prelude::*, fetch::message::Row};

/// Cache key: the endpoint's pre-discovery name plus the metric name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct InstanceKey {
	/// Original (pre-continuous-discovery) endpoint name.
	pub original_endpoint_name: String,
	/// Metric name.
	pub metric_name: String,
}
impl InstanceKey {
	/// Build a key from its two components.
	pub fn new(original_endpoint_name: impl Into<String>, metric_name: impl Into<String>) -> Self {
		Self { original_endpoint_name: original_endpoint_name.into(), metric_name: metric_name.into() }
	}
}

/// Instance-level row cache.
///
/// Two separate locks: timestamps are checked under their own lock before
/// the (potentially larger) row data is cloned out under the data lock. A
/// stale read between the two checks is acceptable — at worst one extra
/// query on the next tick.
pub struct InstanceCache {
	data: RwLock<HashMap<InstanceKey, Vec<Row>>>,
	updated_at: RwLock<HashMap<InstanceKey, Instant>>,
}
impl InstanceCache {
	/// Construct an empty cache.
	pub fn new() -> Self {
		Self { data: RwLock::new(HashMap::new()), updated_at: RwLock::new(HashMap::new()) }
	}

	/// Return a deep-copied row set if a prior write exists and is within
	/// `max_age`; `None` otherwise (miss or stale).
	pub async fn get_if_fresh(&self, key: &InstanceKey, max_age: Duration) -> Option<Vec<Row>> {
		let fresh = {
			let updated_at = self.updated_at.read().await;

			match updated_at.get(key) {
				Some(at) => at.elapsed() <= max_age,
				None => false,
			}
		};

		if !fresh {
			return None;
		}

		self.data.read().await.get(key).cloned()
	}

	/// Deep-copy `rows` into the cache under `key`, updating its timestamp.
	pub async fn put(&self, key: InstanceKey, rows: Vec<Row>) {
		self.data.write().await.insert(key.clone(), rows);
		self.updated_at.write().await.insert(key, Instant::now());
	}
}
impl Default for InstanceCache {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::fetch::message::Value;

	fn sample_rows() -> Vec<Row> {
		vec![Row::new(vec![("epoch_ns".into(), Value::Int(1)), ("n".into(), Value::Int(7))])]
	}

	#[tokio::test]
	async fn miss_before_any_write() {
		let cache = InstanceCache::new();
		let key = InstanceKey::new("db1", "db_stats");

		assert!(cache.get_if_fresh(&key, Duration::from_secs(60)).await.is_none());
	}

	#[tokio::test]
	async fn fresh_write_is_returned_as_a_deep_copy() {
		let cache = InstanceCache::new();
		let key = InstanceKey::new("db1", "db_stats");

		cache.put(key.clone(), sample_rows()).await;

		let mut first = cache.get_if_fresh(&key, Duration::from_secs(60)).await.unwrap();

		first[0].set("n", Value::Int(999));

		let second = cache.get_if_fresh(&key, Duration::from_secs(60)).await.unwrap();

		assert_eq!(second[0].get("n"), Some(&Value::Int(7)), "mutating a read copy must not affect the cache");
	}

	#[tokio::test]
	async fn stale_write_is_treated_as_a_miss() {
		let cache = InstanceCache::new();
		let key = InstanceKey::new("db1", "db_stats");

		cache.put(key.clone(), sample_rows()).await;

		assert!(cache.get_if_fresh(&key, Duration::from_secs(0)).await.is_none());
	}
}
