//! Prometheus-backed self-observability, additive to the plain atomics in
//! `stats.rs`.

// std
use std::sync::OnceLock;
// crates.io
use metrics::Label;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use smallvec::SmallVec;
// self
use crate::_prelude::*;

type LabelSet = SmallVec<[Label; 3]>;

const METRIC_FETCHES_TOTAL: &str = "pgwatch3_fetches_total";
const METRIC_FETCH_ERRORS_TOTAL: &str = "pgwatch3_fetch_errors_total";
const METRIC_FETCH_DURATION: &str = "pgwatch3_fetch_duration_seconds";
const METRIC_POINTS_TOTAL: &str = "pgwatch3_points_total";
const METRIC_SINK_WRITES_TOTAL: &str = "pgwatch3_sink_writes_total";
const METRIC_SINK_WRITE_ERRORS_TOTAL: &str = "pgwatch3_sink_write_errors_total";

/// Shared Prometheus handle installed by [`install_default_exporter`].
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the default Prometheus recorder backed by `metrics`.
///
/// Multiple invocations are safe; subsequent calls become no-ops once the recorder is installed.
pub fn install_default_exporter() -> Result<()> {
	if PROMETHEUS_HANDLE.get().is_some() {
		return Ok(());
	}

	let handle = PrometheusBuilder::new().install_recorder().map_err(|err| Error::Metrics(err.to_string()))?;
	let _ = PROMETHEUS_HANDLE.set(handle);

	Ok(())
}

/// Access the global Prometheus exporter handle when installed.
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
	PROMETHEUS_HANDLE.get()
}

/// Record a completed fetch tick for one `(endpoint, metric)`.
pub fn record_fetch(endpoint: &str, metric: &str, duration: Duration, succeeded: bool) {
	let labels = base_labels(endpoint, metric);

	metrics::counter!(METRIC_FETCHES_TOTAL, labels.iter()).increment(1);
	metrics::histogram!(METRIC_FETCH_DURATION, labels.iter()).record(duration.as_secs_f64());

	if !succeeded {
		metrics::counter!(METRIC_FETCH_ERRORS_TOTAL, labels.iter()).increment(1);
	}
}

/// Record `n` points emitted by one `(endpoint, metric)` fetch.
pub fn record_points(endpoint: &str, metric: &str, n: u64) {
	metrics::counter!(METRIC_POINTS_TOTAL, base_labels(endpoint, metric).iter()).increment(n);
}

/// Record one sink write outcome.
pub fn record_sink_write(sink: &str, succeeded: bool) {
	let labels: LabelSet = SmallVec::from_iter([Label::new("sink", sink.to_owned())]);

	metrics::counter!(METRIC_SINK_WRITES_TOTAL, labels.iter()).increment(1);

	if !succeeded {
		metrics::counter!(METRIC_SINK_WRITE_ERRORS_TOTAL, labels.iter()).increment(1);
	}
}

fn base_labels(endpoint: &str, metric: &str) -> LabelSet {
	SmallVec::from_iter([Label::new("endpoint", endpoint.to_owned()), Label::new("metric", metric.to_owned())])
}
