//! Persister: dispatches batches to configured sinks with per-sink retry
//! queues.

pub mod retry;
pub mod sink;

// crates.io
use tokio::sync::mpsc;
// self
use crate::{_prelude::*, fetch::message::StoreMessage, logging::sink_drop_limiter, stats::Stats};
use retry::RetryQueue;
use sink::Sink;

/// Drains at most this many retry-queue items per sink per drain pass.
const MAX_DRAIN_PER_PASS: usize = 100;

/// Runs the persist pipeline: one logical task fanning out to up to 2
/// parallel sinks.
pub struct Persister {
	sinks: Vec<Arc<dyn Sink>>,
	queue_max: usize,
	stats: Arc<Stats>,
}
impl Persister {
	/// Build a persister over `sinks`, each bounded at `queue_max` retry items.
	pub fn new(sinks: Vec<Arc<dyn Sink>>, queue_max: usize, stats: Arc<Stats>) -> Self {
		Self { sinks, queue_max, stats }
	}

	/// Run until `input` closes, draining retry queues on a best-effort basis
	/// before returning.
	pub async fn run(self, mut input: mpsc::Receiver<Vec<StoreMessage>>) {
		let mut queues: Vec<RetryQueue> =
			self.sinks.iter().map(|_| RetryQueue::new(self.queue_max)).collect();
		let mut drain_ticker = tokio::time::interval(Duration::from_secs(1));
		let drop_limiter = sink_drop_limiter();

		loop {
			tokio::select! {
				biased;

				received = input.recv() => {
					match received {
						Some(batch) => self.dispatch(&batch, &mut queues, &drop_limiter).await,
						None => {
							self.drain_pass(&mut queues).await;

							return;
						},
					}
				},
				_ = drain_ticker.tick() => {
					self.drain_pass(&mut queues).await;
				},
			}
		}
	}

	async fn dispatch(
		&self,
		batch: &[StoreMessage],
		queues: &mut [RetryQueue],
		drop_limiter: &crate::logging::RateLimiter,
	) {
		for (sink, queue) in self.sinks.iter().zip(queues.iter_mut()) {
			if !queue.is_empty() {
				self.enqueue(sink.as_ref(), queue, batch.to_vec(), drop_limiter).await;

				continue;
			}

			let started = Instant::now();

			match sink.write(batch).await {
				Ok(()) => self.stats.record_write_success(started.elapsed()),
				Err(err) => {
					self.stats.record_write_failure();

					tracing::warn!(sink = sink.name(), error = %err, "direct sink write failed, queueing for retry");

					queue.mark_in_error(Instant::now());
					self.enqueue(sink.as_ref(), queue, batch.to_vec(), drop_limiter).await;
				},
			}
		}
	}

	async fn enqueue(
		&self,
		sink: &dyn Sink,
		queue: &mut RetryQueue,
		batch: Vec<StoreMessage>,
		drop_limiter: &crate::logging::RateLimiter,
	) {
		let dropped_points = queue.push_front(batch);

		if dropped_points > 0 {
			self.stats.record_points_dropped(dropped_points);

			if drop_limiter.allow(sink.name()).await {
				tracing::warn!(sink = sink.name(), dropped_points, "retry queue full, dropped oldest batch");
			}
		}
	}

	async fn drain_pass(&self, queues: &mut [RetryQueue]) {
		let now = Instant::now();

		for (sink, queue) in self.sinks.iter().zip(queues.iter_mut()) {
			if queue.is_empty() || !queue.eligible_for_drain(now) {
				continue;
			}

			let mut processed = 0;
			let mut all_succeeded = true;

			while processed < MAX_DRAIN_PER_PASS {
				let Some(batch) = queue.pop_back() else { break };
				let started = Instant::now();

				match sink.write(&batch).await {
					Ok(()) => self.stats.record_write_success(started.elapsed()),
					Err(err) => {
						tracing::debug!(sink = sink.name(), error = %err, "retry drain attempt failed");

						queue.requeue_back(batch);
						queue.mark_in_error(Instant::now());
						all_succeeded = false;

						break;
					},
				}

				processed += 1;
			}

			if all_succeeded {
				queue.mark_ok();
			}
		}
	}
}
