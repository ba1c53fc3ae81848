//! Newline-delimited JSON sink.

// std
use std::path::PathBuf;
// crates.io
use tokio::{fs::OpenOptions, io::AsyncWriteExt, sync::Mutex};
// self
use crate::{_prelude::*, fetch::message::StoreMessage, persist::sink::Sink};

/// Appends one JSON object per row to a configured file.
pub struct JsonSink {
	path: PathBuf,
	append_lock: Mutex<()>,
}
impl JsonSink {
	/// Build a sink that appends to `path`, creating it on first write.
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into(), append_lock: Mutex::new(()) }
	}
}
#[async_trait::async_trait]
impl Sink for JsonSink {
	async fn write(&self, batch: &[StoreMessage]) -> Result<()> {
		let _guard = self.append_lock.lock().await;
		let mut file = OpenOptions::new().create(true).append(true).open(&self.path).await?;

		for msg in batch {
			for row in &msg.rows {
				let data: serde_json::Map<String, serde_json::Value> =
					row.columns.iter().map(|(name, value)| (name.clone(), value.to_json())).collect();
				let mut record = serde_json::Map::new();

				record.insert("metric".into(), msg.metric_name.clone().into());
				record.insert("data".into(), serde_json::Value::Object(data));
				record.insert("dbname".into(), msg.endpoint_name.clone().into());
				record.insert(
					"custom_tags".into(),
					serde_json::to_value(&msg.custom_tags)?,
				);

				if !msg.real_dbname.is_empty() {
					record.insert("real_dbname".into(), msg.real_dbname.clone().into());
				}
				if !msg.system_identifier.is_empty() {
					record.insert("sys_id".into(), msg.system_identifier.clone().into());
				}

				let mut line = serde_json::to_vec(&record)?;

				line.push(b'\n');
				file.write_all(&line).await?;
			}
		}

		Ok(())
	}

	fn name(&self) -> &str {
		"json"
	}
}
