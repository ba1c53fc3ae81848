//! Pull-async sink: holds the latest snapshot per `(endpoint, metric)` for a
//! scrape handler to read, with no external write.

// std
use std::collections::HashMap;
// crates.io
use tokio::sync::RwLock;
// self
use crate::{_prelude::*, fetch::message::StoreMessage, persist::sink::Sink};

/// In-memory last-write-wins snapshot store for pull-based scraping.
pub struct PullSink {
	snapshots: RwLock<HashMap<(String, String), StoreMessage>>,
}
impl PullSink {
	/// Build an empty sink.
	pub fn new() -> Self {
		Self { snapshots: RwLock::new(HashMap::new()) }
	}

	/// Current snapshot for one endpoint/metric pair, if ever written.
	pub async fn snapshot(&self, endpoint: &str, metric: &str) -> Option<StoreMessage> {
		self.snapshots.read().await.get(&(endpoint.to_string(), metric.to_string())).cloned()
	}

	/// Drop the cached snapshot (used when a fetch returns an empty dataset,
	/// so stale data isn't served forever).
	pub async fn invalidate(&self, endpoint: &str, metric: &str) {
		self.snapshots.write().await.remove(&(endpoint.to_string(), metric.to_string()));
	}
}
impl Default for PullSink {
	fn default() -> Self {
		Self::new()
	}
}
#[async_trait::async_trait]
impl Sink for PullSink {
	async fn write(&self, batch: &[StoreMessage]) -> Result<()> {
		let mut snapshots = self.snapshots.write().await;

		for msg in batch {
			snapshots.insert((msg.endpoint_name.clone(), msg.metric_name.clone()), msg.clone());
		}

		Ok(())
	}

	fn name(&self) -> &str {
		"pull"
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::endpoint::types::DbType;

	fn msg() -> StoreMessage {
		StoreMessage {
			endpoint_name: "db1".into(),
			metric_name: "db_stats".into(),
			db_type: DbType::Plain,
			custom_tags: HashMap::new(),
			real_dbname: "postgres".into(),
			system_identifier: "1".into(),
			rows: Vec::new(),
		}
	}

	#[tokio::test]
	async fn write_then_read_then_invalidate() {
		let sink = PullSink::new();

		sink.write(&[msg()]).await.unwrap();
		assert!(sink.snapshot("db1", "db_stats").await.is_some());

		sink.invalidate("db1", "db_stats").await;
		assert!(sink.snapshot("db1", "db_stats").await.is_none());
	}
}
