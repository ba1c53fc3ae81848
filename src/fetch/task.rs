//! Fetcher task: one long-lived task per `(endpoint,
//! metric)` pair, ticking on an interval and reconfigured by control messages.

// crates.io
use tokio::sync::mpsc;
// self
use crate::{
	_prelude::*,
	cache::instance::InstanceCache,
	endpoint::{
		descriptor::{looks_like_connection_refused, EndpointCache, VersionProbe},
		types::DbType,
	},
	fetch::{
		core::{fetch_once, ChangeEventsState, MetricExecutor},
		message::{FetchMessage, Row, StoreMessage, Value},
	},
	logging::{fetch_error_limiter, resolution_error_limiter, RateLimiter},
	metrics_def::registry::MetricRegistry,
	persist::sink::PullSink,
	stats::Stats,
};

/// Reconfiguration or teardown sent by the supervisor on a task's dedicated
/// control channel.
#[derive(Clone, Debug)]
pub enum ControlMessage {
	/// Replace the interval (restarting the ticker); the task keeps running.
	Start {
		/// New fetch interval.
		interval: Duration,
	},
	/// Exit the task; no further store messages are emitted.
	Stop,
}

/// One long-lived task executing a single `(endpoint, metric)` pair.
pub struct FetcherTask {
	endpoint_name: String,
	original_name: String,
	metric_name: String,
	db_type: DbType,
	interval: Duration,
	instance_cache_max: Duration,
	registry: MetricRegistry,
	endpoint_cache: EndpointCache,
	instance_cache: Arc<InstanceCache>,
	prober: Arc<dyn VersionProbe>,
	executor: Arc<dyn MetricExecutor>,
	pull_sink: Option<Arc<PullSink>>,
	stats: Arc<Stats>,
	batch_tx: mpsc::Sender<StoreMessage>,
	control_rx: mpsc::Receiver<ControlMessage>,
}
impl FetcherTask {
	/// Build a fetcher task for `(endpoint_name, metric_name)`.
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		endpoint_name: impl Into<String>,
		original_name: impl Into<String>,
		metric_name: impl Into<String>,
		db_type: DbType,
		interval: Duration,
		instance_cache_max: Duration,
		registry: MetricRegistry,
		endpoint_cache: EndpointCache,
		instance_cache: Arc<InstanceCache>,
		prober: Arc<dyn VersionProbe>,
		executor: Arc<dyn MetricExecutor>,
		pull_sink: Option<Arc<PullSink>>,
		stats: Arc<Stats>,
		batch_tx: mpsc::Sender<StoreMessage>,
		control_rx: mpsc::Receiver<ControlMessage>,
	) -> Self {
		Self {
			endpoint_name: endpoint_name.into(),
			original_name: original_name.into(),
			metric_name: metric_name.into(),
			db_type,
			interval,
			instance_cache_max,
			registry,
			endpoint_cache,
			instance_cache,
			prober,
			executor,
			pull_sink,
			stats,
			batch_tx,
			control_rx,
		}
	}

	/// Run until a `Stop` control message arrives or the control channel closes.
	pub async fn run(mut self) {
		let mut ticker = tokio::time::interval(self.interval.max(Duration::from_millis(1)));

		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

		let fetch_limiter = fetch_error_limiter();
		let resolve_limiter = resolution_error_limiter();
		let mut change_state = ChangeEventsState::default();
		let mut last_uptime: Option<i64> = None;

		loop {
			tokio::select! {
				biased;

				control = self.control_rx.recv() => {
					match control {
						Some(ControlMessage::Start { interval }) => {
							self.interval = interval;
							ticker = tokio::time::interval(self.interval.max(Duration::from_millis(1)));
							ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
						},
						Some(ControlMessage::Stop) | None => return,
					}
				},
				_ = ticker.tick() => {
					self.tick(&fetch_limiter, &resolve_limiter, &mut change_state, &mut last_uptime).await;
				},
			}
		}
	}

	async fn tick(
		&self,
		fetch_limiter: &RateLimiter,
		resolve_limiter: &RateLimiter,
		change_state: &mut ChangeEventsState,
		last_uptime: &mut Option<i64>,
	) {
		let now = Utc::now();

		if self.is_disabled_now(now).await {
			return;
		}

		let Some(endpoint) = self.endpoint_cache.endpoint(&self.endpoint_name).await else { return };

		let server =
			match self.endpoint_cache.ensure_version(&self.endpoint_name, self.prober.as_ref(), now).await {
				Ok(server) => server,
				Err(err) => {
					self.stats.record_fetch_failure();
					self.handle_error(&err, fetch_limiter, resolve_limiter, false).await;

					return;
				},
			};

		let msg = FetchMessage {
			endpoint_name: self.endpoint_name.clone(),
			original_name: self.original_name.clone(),
			metric_name: self.metric_name.clone(),
			db_type: self.db_type,
			interval_secs: self.interval.as_secs(),
			statement_timeout: None,
		};

		match fetch_once(
			&msg,
			&endpoint,
			&server,
			&self.registry,
			&self.instance_cache,
			self.executor.as_ref(),
			&self.stats,
			self.instance_cache_max,
			change_state,
		)
		.await
		{
			Ok(messages) => {
				self.endpoint_cache.record_fetch_outcome(&self.endpoint_name, false, true).await;

				if messages.is_empty() {
					if let Some(pull) = &self.pull_sink {
						pull.invalidate(&self.endpoint_name, &self.metric_name).await;
					}

					return;
				}

				for store_msg in messages {
					if self.metric_name == "db_stats" {
						if let Some(restart) = detect_restart(&self.endpoint_name, &store_msg, last_uptime) {
							if self.batch_tx.send(restart).await.is_err() {
								return;
							}
						}
					}

					if self.batch_tx.send(store_msg).await.is_err() {
						return;
					}
				}
			},
			Err(err) => {
				self.stats.record_fetch_failure();

				let connection_refused = looks_like_connection_refused(&err.to_string());

				self.endpoint_cache.record_fetch_outcome(&self.endpoint_name, connection_refused, false).await;
				self.handle_error(&err, fetch_limiter, resolve_limiter, server.is_in_recovery).await;
			},
		}
	}

	/// Host-config overrides take priority over the resolved variant's default
	/// windows when any host-config entry names this metric.
	async fn is_disabled_now(&self, now: DateTime<Utc>) -> bool {
		let Some(endpoint) = self.endpoint_cache.endpoint(&self.endpoint_name).await else { return false };

		if let Some(windows) = endpoint.host_config.disabled_windows.get(&self.metric_name) {
			return windows.iter().any(|window| window.matches(now));
		}

		let Some(server) = self.endpoint_cache.cached_version(&self.endpoint_name).await else { return false };
		let Ok(resolved) = self.registry.resolve(&self.metric_name, &server).await else { return false };

		resolved.variant.metric_attrs.disabled_windows.iter().any(|window| window.matches(now))
	}

	async fn handle_error(
		&self,
		err: &Error,
		fetch_limiter: &RateLimiter,
		resolve_limiter: &RateLimiter,
		known_in_recovery: bool,
	) {
		let key = format!("{}/{}", self.endpoint_name, self.metric_name);

		match err {
			Error::MetricNotFound(_) | Error::ServerTooOld { .. } => {
				if resolve_limiter.allow(&key).await {
					tracing::warn!(endpoint = %self.endpoint_name, metric = %self.metric_name, error = %err, "metric resolution failed");
				}
			},
			_ if known_in_recovery && err.to_string().to_ascii_lowercase().contains("recovery") => {
				if fetch_limiter.allow(&key).await {
					tracing::info!(endpoint = %self.endpoint_name, metric = %self.metric_name, error = %err, "fetch skipped: server in recovery");
				}
			},
			_ => {
				if fetch_limiter.allow(&key).await {
					tracing::warn!(endpoint = %self.endpoint_name, metric = %self.metric_name, error = %err, "fetch failed");
				}
			},
		}
	}
}

/// Compares `postmaster_uptime_s` against the previously observed value and
/// synthesizes an `object_changes` "server restart" event on a decrease.
fn detect_restart(endpoint_name: &str, msg: &StoreMessage, last_uptime: &mut Option<i64>) -> Option<StoreMessage> {
	let row = msg.rows.first()?;
	let uptime = match row.get("postmaster_uptime_s") {
		Some(Value::Int(v)) => *v,
		_ => return None,
	};
	let previous = last_uptime.replace(uptime);
	let epoch_ns = row.epoch_ns().unwrap_or_else(|| Utc::now().timestamp_nanos_opt().unwrap_or_default());

	if previous.is_some_and(|previous| uptime < previous) {
		let details = format!("Detected server restart (or failover) of \"{endpoint_name}\"");
		let row = Row::new(vec![("epoch_ns".into(), Value::Int(epoch_ns)), ("details".into(), Value::Text(details))]);

		return Some(StoreMessage {
			endpoint_name: msg.endpoint_name.clone(),
			metric_name: "object_changes".into(),
			db_type: msg.db_type,
			custom_tags: msg.custom_tags.clone(),
			real_dbname: msg.real_dbname.clone(),
			system_identifier: msg.system_identifier.clone(),
			rows: vec![row],
		});
	}

	None
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::endpoint::types::{Endpoint, HostConfig, IntervalMap, Password, ServerVersion};
	use async_trait::async_trait;

	fn sample_endpoint() -> Endpoint {
		Endpoint {
			unique_name: "db1".into(),
			original_name: None,
			host: "localhost".into(),
			port: 5432,
			dbname: "postgres".into(),
			user: "monitor".into(),
			password: Password::Plain("x".into()),
			ssl_required: false,
			db_type: DbType::Plain,
			metrics_primary: IntervalMap::new(),
			metrics_standby: None,
			custom_tags: HashMap::new(),
			host_config: HostConfig::default(),
			only_if_master: false,
			is_enabled: true,
			is_superuser: false,
			min_size_bytes: 0,
			group: "default".into(),
		}
	}

	struct FakeProbe;
	#[async_trait]
	impl VersionProbe for FakeProbe {
		async fn probe_version(&self, _endpoint: &Endpoint) -> Result<ServerVersion> {
			Ok(ServerVersion {
				version_num: 140004,
				version_str: "14.4".into(),
				is_in_recovery: false,
				real_dbname: "postgres".into(),
				system_identifier: "1".into(),
				is_superuser: false,
				extensions: HashMap::new(),
				exec_env: String::new(),
				approx_size_bytes: 0,
				checked_at: Utc::now(),
				size_checked_at: None,
			})
		}

		async fn probe_size(&self, _endpoint: &Endpoint) -> Result<u64> {
			Ok(0)
		}
	}

	struct UptimeExecutor {
		uptimes: std::sync::Mutex<std::collections::VecDeque<i64>>,
	}
	#[async_trait]
	impl MetricExecutor for UptimeExecutor {
		async fn query_rows(&self, _endpoint: &Endpoint, _sql: &str, _timeout: Duration) -> Result<Vec<Row>> {
			let uptime = self.uptimes.lock().unwrap().pop_front().unwrap_or(0);

			Ok(vec![Row::new(vec![
				("epoch_ns".into(), Value::Int(1)),
				("postmaster_uptime_s".into(), Value::Int(uptime)),
			])])
		}
	}

	async fn registry() -> MetricRegistry {
		use crate::metrics_def::types::{ColumnAttrs, MetricAttrs, MetricDefinition, MetricVariant};

		MetricRegistry::from_definitions(vec![MetricDefinition {
			name: "db_stats".into(),
			variants: vec![MetricVariant {
				min_version: 0,
				sql: Some("select".into()),
				sql_superuser: None,
				master_only: false,
				standby_only: false,
				column_attrs: ColumnAttrs::default(),
				metric_attrs: MetricAttrs::default(),
				calls_helper_functions: false,
			}],
		}])
	}

	#[tokio::test]
	async fn uptime_decrease_synthesizes_a_restart_event() {
		let endpoint_cache = EndpointCache::new();

		endpoint_cache.sync_endpoints(vec![sample_endpoint()]).await;

		let (batch_tx, mut batch_rx) = mpsc::channel(16);
		let (_control_tx, control_rx) = mpsc::channel(4);
		let executor = Arc::new(UptimeExecutor {
			uptimes: std::sync::Mutex::new(std::collections::VecDeque::from([3600, 120])),
		});
		let task = FetcherTask::new(
			"db1",
			"db1",
			"db_stats",
			DbType::Plain,
			Duration::from_secs(60),
			Duration::from_secs(60),
			registry().await,
			endpoint_cache,
			Arc::new(InstanceCache::new()),
			Arc::new(FakeProbe),
			executor,
			None,
			Stats::new(),
			batch_tx,
			control_rx,
		);

		let fetch_limiter = fetch_error_limiter();
		let resolve_limiter = resolution_error_limiter();
		let mut change_state = ChangeEventsState::default();
		let mut last_uptime = None;

		task.tick(&fetch_limiter, &resolve_limiter, &mut change_state, &mut last_uptime).await;
		task.tick(&fetch_limiter, &resolve_limiter, &mut change_state, &mut last_uptime).await;

		let first = batch_rx.recv().await.unwrap();

		assert_eq!(first.metric_name, "db_stats");

		let second = batch_rx.recv().await.unwrap();

		assert_eq!(second.metric_name, "object_changes");
		assert_eq!(
			second.rows[0].get("details"),
			Some(&Value::Text("Detected server restart (or failover) of \"db1\"".into()))
		);

		let third = batch_rx.recv().await.unwrap();

		assert_eq!(third.metric_name, "db_stats");
	}

	#[tokio::test]
	async fn disabled_window_from_host_config_skips_the_tick() {
		let mut endpoint = sample_endpoint();

		endpoint.host_config.disabled_windows.insert(
			"db_stats".into(),
			vec![crate::window::DisabledWindow { disabled_days: String::new(), disabled_times: Vec::new() }],
		);

		let endpoint_cache = EndpointCache::new();

		endpoint_cache.sync_endpoints(vec![endpoint]).await;

		let (batch_tx, mut batch_rx) = mpsc::channel(16);
		let (_control_tx, control_rx) = mpsc::channel(4);
		let executor =
			Arc::new(UptimeExecutor { uptimes: std::sync::Mutex::new(std::collections::VecDeque::from([100])) });
		let task = FetcherTask::new(
			"db1",
			"db1",
			"db_stats",
			DbType::Plain,
			Duration::from_secs(60),
			Duration::from_secs(60),
			registry().await,
			endpoint_cache,
			Arc::new(InstanceCache::new()),
			Arc::new(FakeProbe),
			executor,
			None,
			Stats::new(),
			batch_tx,
			control_rx,
		);

		task.tick(
			&fetch_error_limiter(),
			&resolution_error_limiter(),
			&mut ChangeEventsState::default(),
			&mut None,
		)
		.await;

		assert!(batch_rx.try_recv().is_err(), "disabled window must suppress the fetch entirely");
	}

	#[tokio::test]
	async fn stop_control_message_ends_the_run_loop() {
		let endpoint_cache = EndpointCache::new();

		endpoint_cache.sync_endpoints(vec![sample_endpoint()]).await;

		let (batch_tx, _batch_rx) = mpsc::channel(16);
		let (control_tx, control_rx) = mpsc::channel(4);
		let executor = Arc::new(UptimeExecutor { uptimes: std::sync::Mutex::new(std::collections::VecDeque::new()) });
		let task = FetcherTask::new(
			"db1",
			"db1",
			"db_stats",
			DbType::Plain,
			Duration::from_secs(3600),
			Duration::from_secs(60),
			registry().await,
			endpoint_cache,
			Arc::new(InstanceCache::new()),
			Arc::new(FakeProbe),
			executor,
			None,
			Stats::new(),
			batch_tx,
			control_rx,
		);

		control_tx.send(ControlMessage::Stop).await.unwrap();

		let handle = tokio::spawn(task.run());

		tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
	}
}
