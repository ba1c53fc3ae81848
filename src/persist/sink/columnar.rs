//! Columnar/relational sink: batched inserts into per-metric partitions.

// std
use std::collections::HashSet;
// crates.io
use deadpool_postgres::Pool;
use tokio::sync::Mutex;
use tokio_postgres::types::Json;
// self
use crate::{
	_prelude::*,
	fetch::message::StoreMessage,
	persist::sink::Sink,
};

/// Inserts rows into one table per metric, creating it on first use.
///
/// Column shape is fixed and metric-agnostic: a `jsonb` payload carries the
/// row's value columns, letting heterogeneous metric schemas share one sink
/// implementation.
pub struct ColumnarSink {
	pool: Pool,
	retention_days: u32,
	known_partitions: Mutex<HashSet<String>>,
}
impl ColumnarSink {
	/// Build a columnar sink writing through `pool`, retaining partitions for
	/// `retention_days` (ignored when the schema type is "custom").
	pub fn new(pool: Pool, retention_days: u32) -> Self {
		Self { pool, retention_days, known_partitions: Mutex::new(HashSet::new()) }
	}

	async fn ensure_partition(
		&self,
		client: &deadpool_postgres::Client,
		metric: &str,
	) -> Result<()> {
		if self.known_partitions.lock().await.contains(metric) {
			return Ok(());
		}

		let table = partition_table_name(metric);

		client
			.batch_execute(&format!(
				"create table if not exists {table} (\
					time timestamptz not null, \
					dbname text not null, \
					tags jsonb not null default '{{}}'::jsonb, \
					data jsonb not null \
				)"
			))
			.await?;

		self.known_partitions.lock().await.insert(metric.to_string());

		Ok(())
	}

	/// Delete partitions for rows older than `retention_days` (no-op for a
	/// custom schema, tracked by the caller).
	pub async fn run_retention(&self, metric: &str) -> Result<u64> {
		let table = partition_table_name(metric);
		let client = self.pool.get().await?;
		let deleted = client
			.execute(
				&format!("delete from {table} where time < now() - interval '{} days'", self.retention_days),
				&[],
			)
			.await?;

		Ok(deleted)
	}
}
#[async_trait::async_trait]
impl Sink for ColumnarSink {
	async fn write(&self, batch: &[StoreMessage]) -> Result<()> {
		let client = self.pool.get().await?;

		for msg in batch {
			if let Err(err) = self.write_message(&client, msg).await {
				if err.to_string().contains("does not exist") {
					self.known_partitions.lock().await.clear();
				}

				return Err(err);
			}
		}

		Ok(())
	}

	fn name(&self) -> &str {
		"columnar"
	}
}
impl ColumnarSink {
	async fn write_message(
		&self,
		client: &deadpool_postgres::Client,
		msg: &StoreMessage,
	) -> Result<()> {
		self.ensure_partition(client, &msg.metric_name).await?;

		let table = partition_table_name(&msg.metric_name);

		for row in &msg.rows {
			let Some(epoch_ns) = row.epoch_ns() else { continue };
			let time = chrono::DateTime::from_timestamp_nanos(epoch_ns);
			let tags: serde_json::Map<String, serde_json::Value> = row
				.tag_columns()
				.map(|(name, value)| (name.to_string(), value.to_json()))
				.chain(msg.custom_tags.iter().map(|(k, v)| (k.clone(), serde_json::Value::from(v.clone()))))
				.collect();
			let data: serde_json::Map<String, serde_json::Value> = row
				.value_columns()
				.map(|(name, value)| (name.to_string(), value.to_json()))
				.collect();

			client
				.execute(
					&format!("insert into {table} (time, dbname, tags, data) values ($1, $2, $3, $4)"),
					&[
						&time,
						&msg.real_dbname,
						&Json(serde_json::Value::Object(tags)),
						&Json(serde_json::Value::Object(data)),
					],
				)
				.await?;
		}

		Ok(())
	}
}

fn partition_table_name(metric: &str) -> String {
	format!("metric_{}", metric.replace('.', "_"))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn partition_name_is_sql_safe() {
		assert_eq!(partition_table_name("wal.archiving"), "metric_wal_archiving");
	}
}
