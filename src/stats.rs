//! Self-observability counters and the stats JSON endpoint.

// std
use std::{
	convert::Infallible,
	net::SocketAddr,
	sync::atomic::{AtomicI64, AtomicU64, Ordering},
};
// crates.io
use http_body_util::Full;
use hyper::{body::Bytes, server::conn::http1, service::service_fn, Request, Response};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
// self
use crate::{_prelude::*, endpoint::descriptor::EndpointCache};

/// Lock-free counters tracked across the collector's lifetime.
#[derive(Default)]
pub struct Stats {
	points_fetched: AtomicU64,
	points_reused: AtomicU64,
	datasets_fetched: AtomicU64,
	points_dropped: AtomicU64,
	fetch_failures: AtomicU64,
	write_failures: AtomicU64,
	write_successes: AtomicU64,
	cumulative_write_micros: AtomicU64,
	last_successful_write_epoch: AtomicI64,
	points_per_minute_last_5min: AtomicU64,
	last_tick_points: AtomicU64,
}
impl Stats {
	/// Construct a zeroed, shareable counter set.
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Record `n` points fetched from a live query.
	pub fn record_points_fetched(&self, n: u64) {
		self.points_fetched.fetch_add(n, Ordering::Relaxed);
	}

	/// Record `n` points served from the instance-level cache instead of a query.
	pub fn record_points_reused(&self, n: u64) {
		self.points_reused.fetch_add(n, Ordering::Relaxed);
	}

	/// Record one dataset (one metric fetch) completed, successful or not.
	pub fn record_dataset_fetched(&self) {
		self.datasets_fetched.fetch_add(1, Ordering::Relaxed);
	}

	/// Record `n` points dropped from a retry queue on overflow.
	pub fn record_points_dropped(&self, n: u64) {
		self.points_dropped.fetch_add(n, Ordering::Relaxed);
	}

	/// Record one fetch failure.
	pub fn record_fetch_failure(&self) {
		self.fetch_failures.fetch_add(1, Ordering::Relaxed);
	}

	/// Record one successful sink write, with its wall-clock duration.
	pub fn record_write_success(&self, duration: Duration) {
		self.write_successes.fetch_add(1, Ordering::Relaxed);
		self.cumulative_write_micros.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
		self.last_successful_write_epoch.store(Utc::now().timestamp(), Ordering::Relaxed);
	}

	/// Record one failed sink write.
	pub fn record_write_failure(&self) {
		self.write_failures.fetch_add(1, Ordering::Relaxed);
	}

	/// Current failed-write count, for tests and inline checks.
	pub fn write_failures(&self) -> u64 {
		self.write_failures.load(Ordering::Relaxed)
	}

	/// Run the 5-minute rolling summarizer forever.
	pub async fn run_summarizer(self: Arc<Self>) {
		let mut ticker = tokio::time::interval(Duration::from_secs(5 * 60));

		loop {
			ticker.tick().await;

			let current = self.points_fetched.load(Ordering::Relaxed);
			let previous = self.last_tick_points.swap(current, Ordering::Relaxed);
			let delta = current.saturating_sub(previous);

			self.points_per_minute_last_5min.store(delta / 5, Ordering::Relaxed);
		}
	}

	/// Build the fixed JSON document served at `/`.
	pub async fn snapshot(&self, endpoints: &EndpointCache) -> StatsSnapshot {
		let all = endpoints.endpoints().await;
		let mut unreachable = 0u64;

		for endpoint in &all {
			if endpoints.is_unreachable(&endpoint.unique_name).await {
				unreachable += 1;
			}
		}

		StatsSnapshot {
			points_fetched: self.points_fetched.load(Ordering::Relaxed),
			points_reused: self.points_reused.load(Ordering::Relaxed),
			datasets_fetched: self.datasets_fetched.load(Ordering::Relaxed),
			points_dropped: self.points_dropped.load(Ordering::Relaxed),
			fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
			write_failures: self.write_failures.load(Ordering::Relaxed),
			write_successes: self.write_successes.load(Ordering::Relaxed),
			cumulative_write_micros: self.cumulative_write_micros.load(Ordering::Relaxed),
			last_successful_write_epoch: self.last_successful_write_epoch.load(Ordering::Relaxed),
			points_per_minute_last_5min: self.points_per_minute_last_5min.load(Ordering::Relaxed),
			monitored_dbs: all.len() as u64,
			configured_dbs: all.len() as u64,
			unreachable_dbs: unreachable,
		}
	}
}

/// Fixed JSON document returned by the stats endpoint.
#[derive(Debug, Serialize)]
pub struct StatsSnapshot {
	points_fetched: u64,
	points_reused: u64,
	datasets_fetched: u64,
	points_dropped: u64,
	fetch_failures: u64,
	write_failures: u64,
	write_successes: u64,
	cumulative_write_micros: u64,
	last_successful_write_epoch: i64,
	points_per_minute_last_5min: u64,
	monitored_dbs: u64,
	configured_dbs: u64,
	unreachable_dbs: u64,
}

/// Serves the stats JSON document over plain HTTP at `GET /`.
pub struct StatsServer {
	stats: Arc<Stats>,
	endpoints: EndpointCache,
}
impl StatsServer {
	/// Build a server over the given counters and endpoint cache.
	pub fn new(stats: Arc<Stats>, endpoints: EndpointCache) -> Self {
		Self { stats, endpoints }
	}

	/// Bind `addr` and serve forever, spawning one task per connection.
	pub async fn serve(self, addr: SocketAddr) -> Result<()> {
		let listener = TcpListener::bind(addr).await?;

		tracing::info!(%addr, "stats server listening");

		loop {
			let (stream, _) = listener.accept().await?;
			let io = TokioIo::new(stream);
			let stats = self.stats.clone();
			let endpoints = self.endpoints.clone();

			tokio::spawn(async move {
				let service = service_fn(move |req| {
					let stats = stats.clone();
					let endpoints = endpoints.clone();

					async move { handle(req, stats, endpoints).await }
				});

				if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
					tracing::debug!(error = %err, "stats connection closed with an error");
				}
			});
		}
	}
}

async fn handle(
	_req: Request<hyper::body::Incoming>,
	stats: Arc<Stats>,
	endpoints: EndpointCache,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
	let snapshot = stats.snapshot(&endpoints).await;
	let body = serde_json::to_vec(&snapshot).unwrap_or_default();

	Ok(Response::builder()
		.header("content-type", "application/json")
		.body(Full::new(Bytes::from(body)))
		.unwrap_or_else(|_| Response::new(Full::new(Bytes::new()))))
}
