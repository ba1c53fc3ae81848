//! Batches store messages by delay and size before handing them to the
//! persister.

// crates.io
use tokio::sync::mpsc;
// self
use crate::{_prelude::*, fetch::message::StoreMessage};

/// Hard cap on datapoints per flushed batch, regardless of `max_delay`.
pub const MAX_BATCH_POINTS: usize = 1_000;

/// Receives store messages and flushes them to the persist channel on a
/// delay/size schedule. Never drops data; backpressure comes from the
/// downstream channel filling up.
pub struct Batcher {
	max_delay: Duration,
	input: mpsc::Receiver<StoreMessage>,
	output: mpsc::Sender<Vec<StoreMessage>>,
}
impl Batcher {
	/// Build a batcher reading from `input` and flushing to `output`.
	pub fn new(
		max_delay: Duration,
		input: mpsc::Receiver<StoreMessage>,
		output: mpsc::Sender<Vec<StoreMessage>>,
	) -> Self {
		Self { max_delay, input, output }
	}

	/// Run until the input channel closes, flushing any trailing buffer.
	#[tracing::instrument(skip(self))]
	pub async fn run(mut self) {
		let mut buffer: Vec<StoreMessage> = Vec::new();
		let mut points = 0usize;
		let mut ticker = tokio::time::interval(self.max_delay);

		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

		loop {
			tokio::select! {
				biased;

				msg = self.input.recv() => {
					match msg {
						Some(msg) => {
							points += msg.point_count();
							buffer.push(msg);

							if points >= MAX_BATCH_POINTS
								&& Self::flush(&self.output, &mut buffer, &mut points).await.is_err()
							{
								return;
							}
						},
						None => {
							let _ = Self::flush(&self.output, &mut buffer, &mut points).await;

							return;
						},
					}
				},
				_ = ticker.tick() => {
					if !buffer.is_empty()
						&& Self::flush(&self.output, &mut buffer, &mut points).await.is_err()
					{
						return;
					}
				},
			}
		}
	}

	async fn flush(
		output: &mpsc::Sender<Vec<StoreMessage>>,
		buffer: &mut Vec<StoreMessage>,
		points: &mut usize,
	) -> std::result::Result<(), mpsc::error::SendError<Vec<StoreMessage>>> {
		if buffer.is_empty() {
			return Ok(());
		}

		let flushed = std::mem::take(buffer);

		*points = 0;

		output.send(flushed).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::endpoint::types::DbType;

	fn store_msg(rows: usize) -> StoreMessage {
		StoreMessage {
			endpoint_name: "db1".into(),
			metric_name: "db_stats".into(),
			db_type: DbType::Plain,
			custom_tags: HashMap::new(),
			real_dbname: "postgres".into(),
			system_identifier: "1".into(),
			rows: (0..rows).map(|_| crate::fetch::message::Row::default()).collect(),
		}
	}

	#[tokio::test]
	async fn flushes_when_the_point_cap_is_crossed() {
		let (in_tx, in_rx) = mpsc::channel(16);
		let (out_tx, mut out_rx) = mpsc::channel(16);
		let batcher = Batcher::new(Duration::from_secs(3600), in_rx, out_tx);
		let handle = tokio::spawn(batcher.run());

		in_tx.send(store_msg(MAX_BATCH_POINTS)).await.unwrap();

		let flushed = out_rx.recv().await.unwrap();

		assert_eq!(flushed.len(), 1);

		drop(in_tx);
		handle.await.unwrap();
	}

	#[tokio::test]
	async fn flushes_on_ticker_with_a_partial_buffer() {
		let (in_tx, in_rx) = mpsc::channel(16);
		let (out_tx, mut out_rx) = mpsc::channel(16);
		let batcher = Batcher::new(Duration::from_millis(20), in_rx, out_tx);
		let handle = tokio::spawn(batcher.run());

		in_tx.send(store_msg(1)).await.unwrap();

		let flushed = out_rx.recv().await.unwrap();

		assert_eq!(flushed.len(), 1);

		drop(in_tx);
		handle.await.unwrap();
	}

	#[tokio::test]
	async fn trailing_buffer_flushes_on_input_close() {
		let (in_tx, in_rx) = mpsc::channel(16);
		let (out_tx, mut out_rx) = mpsc::channel(16);
		let batcher = Batcher::new(Duration::from_secs(3600), in_rx, out_tx);
		let handle = tokio::spawn(batcher.run());

		in_tx.send(store_msg(1)).await.unwrap();
		drop(in_tx);
		handle.await.unwrap();

		let flushed = out_rx.recv().await.unwrap();

		assert_eq!(flushed.len(), 1);
	}
}
