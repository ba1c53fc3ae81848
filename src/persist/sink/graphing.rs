//! Graphing (carbon-style line protocol) sink.

// crates.io
use tokio::{io::AsyncWriteExt, net::TcpStream, sync::Mutex};
// self
use crate::{_prelude::*, fetch::message::StoreMessage, persist::sink::Sink};

/// Sends one line per numeric value column per row. Reconnects lazily on the
/// next write after a send failure.
pub struct GraphingSink {
	address: String,
	conn: Mutex<Option<TcpStream>>,
}
impl GraphingSink {
	/// Build a sink targeting `address` (`host:port`), connecting lazily.
	pub fn new(address: impl Into<String>) -> Self {
		Self { address: address.into(), conn: Mutex::new(None) }
	}

	async fn ensure_connected(&self, guard: &mut Option<TcpStream>) -> Result<()> {
		if guard.is_none() {
			*guard = Some(TcpStream::connect(&self.address).await?);
		}

		Ok(())
	}
}
#[async_trait::async_trait]
impl Sink for GraphingSink {
	async fn write(&self, batch: &[StoreMessage]) -> Result<()> {
		let mut guard = self.conn.lock().await;

		self.ensure_connected(&mut *guard).await?;

		let stream = guard.as_mut().expect("just connected");
		let mut line_buf = String::new();

		for msg in batch {
			for row in &msg.rows {
				let epoch_s = row
					.epoch_ns()
					.map(|ns| ns as f64 / 1e9)
					.unwrap_or_else(|| Utc::now().timestamp() as f64);

				for (column, value) in row.value_columns() {
					if value.is_null_or_empty() {
						continue;
					}

					let Some(number) = value.as_f64() else {
						tracing::warn!(metric = %msg.metric_name, column, "skipping non-numeric column for graphing sink");

						continue;
					};

					line_buf.clear();
					line_buf.push_str(&format!(
						"pgwatch3.{}.{}.{} {} {}\n",
						msg.metric_name, msg.real_dbname, column, number, epoch_s as i64
					));

					if let Err(err) = stream.write_all(line_buf.as_bytes()).await {
						*guard = None;

						return Err(err.into());
					}
				}
			}
		}

		Ok(())
	}

	fn name(&self) -> &str {
		"graphing"
	}
}
