//! Composition root: an explicit `Core` struct wires the registry, endpoint
//! cache, instance cache, batcher, persister, stats server, and supervisor
//! from a [`CollectorConfig`] and drives them to completion or cancellation.

// std
use std::{net::SocketAddr, path::PathBuf};
// crates.io
use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
// self
use crate::{
	_prelude::*,
	batch::Batcher,
	cache::instance::InstanceCache,
	config::{CollectorConfig, MetricSourceConfig, SinkConfig},
	endpoint::{
		descriptor::{EndpointCache, VersionProbe},
		types::{Endpoint, ServerVersion},
	},
	fetch::{
		client::EndpointClient,
		core::MetricExecutor,
		message::{Row, StoreMessage, Value},
	},
	gating::EmergencyGate,
	metrics_def::{
		loader::{ControlDbSource, FileTreeSource, MetricSource},
		registry::MetricRegistry,
	},
	persist::{
		sink::{ColumnarSink, GraphingSink, JsonSink, PullSink, Sink},
		Persister,
	},
	stats::{Stats, StatsServer},
	supervisor::{DiscoveryExpander, EndpointSource, ExecutorFactory, Supervisor},
};

/// Owns every subsystem for one run of the collector.
pub struct Core {
	stats: Arc<Stats>,
	endpoint_cache: EndpointCache,
	stats_listen_addr: SocketAddr,
	batcher: Batcher,
	persister: Persister,
	persist_rx: mpsc::Receiver<Vec<StoreMessage>>,
	supervisor: Supervisor,
}
impl Core {
	/// Build every subsystem from `config`, decrypting envelope-protected
	/// passwords with `decryption_key` as each connection is established.
	/// Establishes no connections itself — pools are lazy.
	pub fn new(config: &CollectorConfig, decryption_key: Vec<u8>) -> Result<Self> {
		config.validate()?;

		let decryption_key = Arc::new(decryption_key);
		let metric_source: Arc<dyn MetricSource> = match &config.metric_source {
			MetricSourceConfig::FileTree { root } => Arc::new(FileTreeSource::new(root.clone())),
			MetricSourceConfig::ControlDb { database_url } => {
				Arc::new(ControlDbSource::new(build_pool(database_url)?))
			},
		};

		let mut sinks: Vec<Arc<dyn Sink>> = Vec::with_capacity(config.sinks.len());
		let mut pull_sink: Option<Arc<PullSink>> = None;

		for sink_config in &config.sinks {
			match sink_config {
				SinkConfig::Pull => {
					let sink = Arc::new(PullSink::new());

					pull_sink = Some(sink.clone());
					sinks.push(sink);
				},
				other => sinks.push(build_sink(other)?),
			}
		}

		let pooled = Arc::new(PooledExecutors::new(decryption_key.clone()));
		let executors: Arc<dyn ExecutorFactory> = pooled.clone();
		let prober: Arc<dyn VersionProbe> = pooled;

		let registry = MetricRegistry::new();
		let endpoint_cache = EndpointCache::new();
		let instance_cache = Arc::new(InstanceCache::new());
		let stats = Stats::new();
		let emergency_gate = EmergencyGate::new(config.emergency_pause_trigger_file.clone());

		let (batch_tx, batch_rx) = mpsc::channel(10_000);
		let (persist_tx, persist_rx) = mpsc::channel(10_000);

		let batcher = Batcher::new(Duration::from_secs(config.batch_max_delay_seconds), batch_rx, persist_tx);
		let persister = Persister::new(sinks, config.retry_queue_max, stats.clone());

		let supervisor = Supervisor::new(
			metric_source,
			Arc::new(ConfiguredEndpoints { endpoints: config.endpoints.clone() }),
			Arc::new(PgDiscoveryExpander { decryption_key }),
			executors,
			prober,
			registry,
			endpoint_cache.clone(),
			instance_cache,
			Duration::from_secs(config.instance_cache_max_age_seconds),
			emergency_gate,
			stats.clone(),
			batch_tx,
			pull_sink,
			Duration::from_secs(config.servers_refresh_loop_seconds),
			Duration::from_secs(config.monitored_dbs_sync_interval_seconds),
		);

		Ok(Self {
			stats,
			endpoint_cache,
			stats_listen_addr: config.stats_listen_addr,
			batcher,
			persister,
			persist_rx,
			supervisor,
		})
	}

	/// Run every subsystem until `cancel` fires, then drain in-flight batches
	/// and return.
	pub async fn run(self, cancel: CancellationToken) {
		let Self { stats, endpoint_cache, stats_listen_addr, batcher, persister, persist_rx, supervisor } = self;

		let stats_handle = tokio::spawn({
			let stats = stats.clone();

			async move {
				if let Err(err) = StatsServer::new(stats, endpoint_cache).serve(stats_listen_addr).await {
					tracing::error!(error = %err, "stats server exited");
				}
			}
		});
		let summarizer_handle = tokio::spawn(stats.run_summarizer());
		let batcher_handle = tokio::spawn(batcher.run());
		let persister_handle = tokio::spawn(persister.run(persist_rx));

		supervisor.run(cancel).await;

		let _ = batcher_handle.await;
		let _ = persister_handle.await;
		stats_handle.abort();
		summarizer_handle.abort();
	}
}

fn build_sink(config: &SinkConfig) -> Result<Arc<dyn Sink>> {
	match config {
		SinkConfig::Columnar { database_url, retention_days } => {
			Ok(Arc::new(ColumnarSink::new(build_pool(database_url)?, *retention_days)))
		},
		SinkConfig::Graphing { address } => Ok(Arc::new(GraphingSink::new(address.clone()))),
		SinkConfig::Json { path } => Ok(Arc::new(JsonSink::new(path.clone()))),
		SinkConfig::Pull => Ok(Arc::new(PullSink::new())),
	}
}

fn build_pool(database_url: &str) -> Result<Pool> {
	let config: tokio_postgres::Config = database_url.parse()?;
	let manager = Manager::from_config(config, tokio_postgres::NoTls, ManagerConfig {
		recycling_method: RecyclingMethod::Fast,
	});

	Ok(Pool::builder(manager).max_size(4).build()?)
}

/// Supplies the configured, pre-expansion endpoint list straight from config.
struct ConfiguredEndpoints {
	endpoints: Vec<Endpoint>,
}
#[async_trait]
impl EndpointSource for ConfiguredEndpoints {
	async fn load_endpoints(&self) -> Result<Vec<Endpoint>> {
		Ok(self.endpoints.clone())
	}
}

/// Expands a continuous-discovery parent by listing its sibling databases
/// over a short-lived connection to the parent.
struct PgDiscoveryExpander {
	decryption_key: Arc<Vec<u8>>,
}
#[async_trait]
impl DiscoveryExpander for PgDiscoveryExpander {
	async fn expand_children(&self, parent: &Endpoint) -> Result<Vec<Endpoint>> {
		let client = EndpointClient::connect(parent, &self.decryption_key)?;
		let rows = client
			.query_rows(
				"select datname from pg_database where datistemplate = false and datallowconn",
				Duration::from_secs(10),
			)
			.await?;

		Ok(rows.into_iter().filter_map(|row| child_endpoint_from_row(parent, &row)).collect())
	}
}

fn child_endpoint_from_row(parent: &Endpoint, row: &Row) -> Option<Endpoint> {
	match row.get("datname") {
		Some(Value::Text(name)) => Some(child_endpoint(parent, name)),
		_ => None,
	}
}

fn child_endpoint(parent: &Endpoint, dbname: &str) -> Endpoint {
	let mut child = parent.clone();

	child.unique_name = format!("{}/{}", parent.unique_name, dbname);
	child.original_name = Some(parent.unique_name.clone());
	child.dbname = dbname.to_string();

	child
}

/// Builds and caches one pooled [`EndpointClient`] per endpoint, backing both
/// the [`ExecutorFactory`] (fetch) and [`VersionProbe`] (probing) seams so
/// the connection pool is genuinely reused across fetchers.
struct PooledExecutors {
	decryption_key: Arc<Vec<u8>>,
	clients: AsyncMutex<HashMap<String, EndpointClient>>,
}
impl PooledExecutors {
	fn new(decryption_key: Arc<Vec<u8>>) -> Self {
		Self { decryption_key, clients: AsyncMutex::new(HashMap::new()) }
	}

	async fn client_for(&self, endpoint: &Endpoint) -> Result<EndpointClient> {
		let mut clients = self.clients.lock().await;

		if let Some(client) = clients.get(&endpoint.unique_name) {
			return Ok(client.clone());
		}

		let client = EndpointClient::connect(endpoint, &self.decryption_key)?;

		clients.insert(endpoint.unique_name.clone(), client.clone());

		Ok(client)
	}
}
#[async_trait]
impl ExecutorFactory for PooledExecutors {
	async fn build(&self, endpoint: &Endpoint) -> Result<Arc<dyn MetricExecutor>> {
		Ok(Arc::new(self.client_for(endpoint).await?))
	}
}
#[async_trait]
impl VersionProbe for PooledExecutors {
	async fn probe_version(&self, endpoint: &Endpoint) -> Result<ServerVersion> {
		self.client_for(endpoint).await?.probe_version(endpoint).await
	}

	async fn probe_size(&self, endpoint: &Endpoint) -> Result<u64> {
		self.client_for(endpoint).await?.probe_size(endpoint).await
	}
}
