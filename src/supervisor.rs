//! Supervisor loop: on each cadence, refreshes metric
//! definitions, loads the endpoint set, and reconciles the desired
//! `(endpoint, metric)` fetcher set against the running one.

// std
use std::collections::HashMap;
// crates.io
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
// self
use crate::{
	_prelude::*,
	cache::instance::InstanceCache,
	endpoint::{
		descriptor::{EndpointCache, VersionProbe},
		types::Endpoint,
	},
	fetch::{
		core::MetricExecutor,
		message::{Row, StoreMessage, Value},
		task::{ControlMessage, FetcherTask},
	},
	gating::{gate_reason, EmergencyGate},
	metrics_def::{loader::MetricSource, registry::MetricRegistry},
	persist::sink::PullSink,
	stats::Stats,
};

/// Supplies the flat (pre-expansion) endpoint list. The file-tree/control-database
/// loader itself is an external collaborator; this is
/// just the seam the supervisor reads through. Metric definitions come from the
/// already-existing `MetricSource` seam (`metrics_def::loader`).
#[async_trait]
pub trait EndpointSource: Send + Sync {
	/// Load the endpoint list prior to continuous-discovery expansion.
	async fn load_endpoints(&self) -> Result<Vec<Endpoint>>;
}

/// Resolves a continuous-discovery or cluster-managed entry's child databases
/// by listing them on a pooled connection to the parent.
#[async_trait]
pub trait DiscoveryExpander: Send + Sync {
	/// Expand `parent` into child endpoints.
	async fn expand_children(&self, parent: &Endpoint) -> Result<Vec<Endpoint>>;
}

/// Builds the SQL-execution seam backing one endpoint's connection pool.
#[async_trait]
pub trait ExecutorFactory: Send + Sync {
	/// Build (or reuse) an executor for `endpoint`.
	async fn build(&self, endpoint: &Endpoint) -> Result<Arc<dyn MetricExecutor>>;
}

struct RunningFetcher {
	control_tx: mpsc::Sender<ControlMessage>,
	interval: Duration,
	handle: tokio::task::JoinHandle<()>,
}

/// Reconciles desired vs running fetchers every `refresh_interval`.
pub struct Supervisor {
	metric_source: Arc<dyn MetricSource>,
	endpoint_source: Arc<dyn EndpointSource>,
	expander: Arc<dyn DiscoveryExpander>,
	executors: Arc<dyn ExecutorFactory>,
	prober: Arc<dyn VersionProbe>,
	registry: MetricRegistry,
	endpoint_cache: EndpointCache,
	instance_cache: Arc<InstanceCache>,
	instance_cache_max: Duration,
	emergency_gate: EmergencyGate,
	stats: Arc<Stats>,
	batch_tx: mpsc::Sender<StoreMessage>,
	pull_sink: Option<Arc<PullSink>>,
	refresh_interval: Duration,
	configured_dbs_sync_interval: Duration,
	running: HashMap<(String, String), RunningFetcher>,
	last_defs_refresh: Option<Instant>,
	last_configured_sync: Option<Instant>,
}
impl Supervisor {
	/// Build a supervisor. `refresh_interval` is `servers_refresh_loop_seconds`;
	/// `configured_dbs_sync_interval` is `monitored_dbs_sync_interval_seconds`.
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		metric_source: Arc<dyn MetricSource>,
		endpoint_source: Arc<dyn EndpointSource>,
		expander: Arc<dyn DiscoveryExpander>,
		executors: Arc<dyn ExecutorFactory>,
		prober: Arc<dyn VersionProbe>,
		registry: MetricRegistry,
		endpoint_cache: EndpointCache,
		instance_cache: Arc<InstanceCache>,
		instance_cache_max: Duration,
		emergency_gate: EmergencyGate,
		stats: Arc<Stats>,
		batch_tx: mpsc::Sender<StoreMessage>,
		pull_sink: Option<Arc<PullSink>>,
		refresh_interval: Duration,
		configured_dbs_sync_interval: Duration,
	) -> Self {
		Self {
			metric_source,
			endpoint_source,
			expander,
			executors,
			prober,
			registry,
			endpoint_cache,
			instance_cache,
			instance_cache_max,
			emergency_gate,
			stats,
			batch_tx,
			pull_sink,
			refresh_interval,
			configured_dbs_sync_interval,
			running: HashMap::new(),
			last_defs_refresh: None,
			last_configured_sync: None,
		}
	}

	/// Run until `cancel` fires, then stop every fetcher and return.
	pub async fn run(mut self, cancel: CancellationToken) {
		let mut ticker = tokio::time::interval(self.refresh_interval);

		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

		loop {
			tokio::select! {
				biased;

				_ = cancel.cancelled() => {
					self.shutdown_all().await;

					return;
				},
				_ = ticker.tick() => {
					if let Err(err) = self.reconcile().await {
						tracing::warn!(error = %err, "supervisor iteration failed");
					}
				},
			}
		}
	}

	async fn shutdown_all(&mut self) {
		for (_, fetcher) in self.running.drain() {
			let _ = fetcher.control_tx.send(ControlMessage::Stop).await;
		}
	}

	/// One supervisor iteration.
	async fn reconcile(&mut self) -> Result<()> {
		self.refresh_definitions_if_stale().await?;

		let endpoints = self.load_expanded_endpoints().await?;

		self.endpoint_cache.sync_endpoints(endpoints.clone()).await;

		let emergency = self.emergency_gate.is_active().await;

		for endpoint in &endpoints {
			self.ensure_probed(endpoint).await;
		}

		let desired = if emergency { Vec::new() } else { self.desired_fetchers(&endpoints).await };

		self.apply_desired(desired).await;
		self.emit_configured_dbs_if_due(&endpoints).await;

		Ok(())
	}

	async fn refresh_definitions_if_stale(&mut self) -> Result<()> {
		let stale = match self.last_defs_refresh {
			Some(at) => at.elapsed() > crate::metrics_def::registry::REFRESH_INTERVAL,
			None => true,
		};

		if !stale {
			return Ok(());
		}

		let definitions = self.metric_source.load().await?;

		self.registry.swap(definitions).await;
		self.last_defs_refresh = Some(Instant::now());

		Ok(())
	}

	async fn load_expanded_endpoints(&self) -> Result<Vec<Endpoint>> {
		let raw = self.endpoint_source.load_endpoints().await?;
		let mut expanded = Vec::with_capacity(raw.len());

		for entry in raw {
			if entry.db_type.expands_children() {
				match self.expander.expand_children(&entry).await {
					Ok(children) => expanded.extend(children),
					Err(err) => tracing::warn!(endpoint = %entry.unique_name, error = %err, "continuous-discovery expansion failed"),
				}
			} else {
				expanded.push(entry);
			}
		}

		Ok(expanded)
	}

	async fn ensure_probed(&self, endpoint: &Endpoint) {
		let now = Utc::now();

		if let Err(err) = self.endpoint_cache.ensure_version(&endpoint.unique_name, self.prober.as_ref(), now).await
		{
			tracing::debug!(endpoint = %endpoint.unique_name, error = %err, "initial connectivity probe failed, will retry next iteration");

			return;
		}

		let _ = self.endpoint_cache.ensure_size(&endpoint.unique_name, self.prober.as_ref(), now).await;
	}

	async fn desired_fetchers(&self, endpoints: &[Endpoint]) -> Vec<(Endpoint, String, Duration)> {
		let mut desired = Vec::new();

		for endpoint in endpoints {
			let in_recovery =
				self.endpoint_cache.cached_version(&endpoint.unique_name).await.map(|v| v.is_in_recovery).unwrap_or(false);

			if gate_reason(endpoint, &self.endpoint_cache, in_recovery).await.is_some() {
				continue;
			}

			for (metric, interval_secs) in endpoint.intervals_for(in_recovery) {
				if *interval_secs == 0 {
					continue;
				}

				desired.push((endpoint.clone(), metric.clone(), Duration::from_secs(*interval_secs)));
			}
		}

		desired
	}

	async fn apply_desired(&mut self, desired: Vec<(Endpoint, String, Duration)>) {
		let mut still_desired = std::collections::HashSet::new();

		for (endpoint, metric, interval) in desired {
			let key = (endpoint.unique_name.clone(), metric.clone());

			still_desired.insert(key.clone());

			match self.running.get(&key) {
				Some(fetcher) if fetcher.interval == interval => {},
				Some(fetcher) => {
					let _ = fetcher.control_tx.send(ControlMessage::Start { interval }).await;

					if let Some(entry) = self.running.get_mut(&key) {
						entry.interval = interval;
					}
				},
				None => {
					let Ok(executor) = self.executors.build(&endpoint).await else {
						tracing::warn!(endpoint = %endpoint.unique_name, metric = %metric, "failed to build executor, skipping this iteration");

						continue;
					};
					let (control_tx, control_rx) = mpsc::channel(4);
					let task = FetcherTask::new(
						endpoint.unique_name.clone(),
						endpoint.original_name.clone().unwrap_or_else(|| endpoint.unique_name.clone()),
						metric.clone(),
						endpoint.db_type,
						interval,
						self.instance_cache_max,
						self.registry.clone(),
						self.endpoint_cache.clone(),
						self.instance_cache.clone(),
						self.prober.clone(),
						executor,
						self.pull_sink.clone(),
						self.stats.clone(),
						self.batch_tx.clone(),
						control_rx,
					);
					let handle = tokio::spawn(task.run());

					self.running.insert(key, RunningFetcher { control_tx, interval, handle });
				},
			}
		}

		let to_remove: Vec<_> =
			self.running.keys().filter(|key| !still_desired.contains(*key)).cloned().collect();

		for key in to_remove {
			if let Some(fetcher) = self.running.remove(&key) {
				let _ = fetcher.control_tx.send(ControlMessage::Stop).await;

				fetcher.handle.abort();
			}
		}
	}

	async fn emit_configured_dbs_if_due(&mut self, endpoints: &[Endpoint]) {
		let due = match self.last_configured_sync {
			Some(at) => at.elapsed() >= self.configured_dbs_sync_interval,
			None => true,
		};

		if !due {
			return;
		}

		self.last_configured_sync = Some(Instant::now());

		for endpoint in endpoints {
			let row = Row::new(vec![
				("epoch_ns".into(), Value::Int(Utc::now().timestamp_nanos_opt().unwrap_or_default())),
				("tag_group".into(), Value::Text(endpoint.group.clone())),
				("tag_master_only".into(), Value::Int(endpoint.only_if_master as i64)),
				(
					"tag_continuous_discovery".into(),
					Value::Text(endpoint.original_name.clone().unwrap_or_default()),
				),
			]);
			let msg = StoreMessage {
				endpoint_name: endpoint.unique_name.clone(),
				metric_name: "configured_dbs".into(),
				db_type: endpoint.db_type,
				custom_tags: endpoint.custom_tags.clone(),
				real_dbname: endpoint.dbname.clone(),
				system_identifier: String::new(),
				rows: vec![row],
			};

			if self.batch_tx.send(msg).await.is_err() {
				return;
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		endpoint::types::{DbType, HostConfig, IntervalMap, Password, ServerVersion},
		fetch::message::Row,
	};
	use std::sync::Mutex as StdMutex;

	fn sample_endpoint(name: &str, interval: u64) -> Endpoint {
		let mut intervals = IntervalMap::new();

		intervals.insert("db_stats".into(), interval);

		Endpoint {
			unique_name: name.into(),
			original_name: None,
			host: "localhost".into(),
			port: 5432,
			dbname: "postgres".into(),
			user: "monitor".into(),
			password: Password::Plain("x".into()),
			ssl_required: false,
			db_type: DbType::Plain,
			metrics_primary: intervals,
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

	struct FakeEndpoints {
		endpoints: Vec<Endpoint>,
	}
	#[async_trait]
	impl EndpointSource for FakeEndpoints {
		async fn load_endpoints(&self) -> Result<Vec<Endpoint>> {
			Ok(self.endpoints.clone())
		}
	}

	struct EmptyMetricSource;
	#[async_trait]
	impl MetricSource for EmptyMetricSource {
		async fn load(&self) -> Result<Vec<crate::metrics_def::types::MetricDefinition>> {
			Ok(Vec::new())
		}
	}

	struct NoopExpander;
	#[async_trait]
	impl DiscoveryExpander for NoopExpander {
		async fn expand_children(&self, parent: &Endpoint) -> Result<Vec<Endpoint>> {
			Ok(vec![parent.clone()])
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
			Ok(u64::MAX)
		}
	}

	struct NoopExecutor;
	#[async_trait]
	impl MetricExecutor for NoopExecutor {
		async fn query_rows(&self, _endpoint: &Endpoint, _sql: &str, _timeout: Duration) -> Result<Vec<Row>> {
			Ok(Vec::new())
		}
	}

	struct FakeExecutors {
		build_calls: StdMutex<u32>,
	}
	#[async_trait]
	impl ExecutorFactory for FakeExecutors {
		async fn build(&self, _endpoint: &Endpoint) -> Result<Arc<dyn MetricExecutor>> {
			*self.build_calls.lock().unwrap() += 1;

			Ok(Arc::new(NoopExecutor))
		}
	}

	fn make_supervisor(endpoints: Vec<Endpoint>) -> Supervisor {
		let (batch_tx, _rx) = mpsc::channel(16);

		Supervisor::new(
			Arc::new(EmptyMetricSource),
			Arc::new(FakeEndpoints { endpoints }),
			Arc::new(NoopExpander),
			Arc::new(FakeExecutors { build_calls: StdMutex::new(0) }),
			Arc::new(FakeProbe),
			MetricRegistry::new(),
			EndpointCache::new(),
			Arc::new(InstanceCache::new()),
			Duration::from_secs(60),
			EmergencyGate::new(None),
			Stats::new(),
			batch_tx,
			None,
			Duration::from_millis(10),
			Duration::from_secs(600),
		)
	}

	#[tokio::test]
	async fn reconcile_spawns_a_fetcher_for_each_desired_metric() {
		let mut supervisor = make_supervisor(vec![sample_endpoint("db1", 60)]);

		supervisor.reconcile().await.unwrap();

		assert_eq!(supervisor.running.len(), 1);
		assert!(supervisor.running.contains_key(&("db1".to_string(), "db_stats".to_string())));
	}

	#[tokio::test]
	async fn removed_endpoint_stops_its_fetcher() {
		let mut supervisor = make_supervisor(vec![sample_endpoint("db1", 60)]);

		supervisor.reconcile().await.unwrap();
		assert_eq!(supervisor.running.len(), 1);

		supervisor.endpoint_source = Arc::new(FakeEndpoints { endpoints: Vec::new() });
		supervisor.reconcile().await.unwrap();

		assert!(supervisor.running.is_empty());
	}

	#[tokio::test]
	async fn emergency_gate_empties_the_desired_set_without_dropping_definitions() {
		let dir = tempfile::tempdir().unwrap();
		let trigger = dir.path().join("pause");

		tokio::fs::write(&trigger, b"").await.unwrap();

		let mut supervisor = make_supervisor(vec![sample_endpoint("db1", 60)]);

		supervisor.emergency_gate = EmergencyGate::new(Some(trigger));
		supervisor.reconcile().await.unwrap();

		assert!(supervisor.running.is_empty());
		assert!(supervisor.endpoint_cache.endpoint("db1").await.is_some(), "definitions/connections stay warm");
	}
}
