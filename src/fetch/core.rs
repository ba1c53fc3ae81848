//! Core fetch procedure: resolves server version and metric
//! variant, applies the special-metric short-circuits, executes SQL with
//! superuser fallback, post-processes rows, and updates counters.

// std
use std::collections::HashMap;
// crates.io
use async_trait::async_trait;
// self
use crate::{
	_prelude::*,
	cache::instance::{InstanceCache, InstanceKey},
	endpoint::types::{compare_versions, Endpoint, ServerVersion},
	fetch::message::{FetchMessage, Row, StoreMessage, Value},
	metrics_def::{
		registry::MetricRegistry,
		types::{MetricVariant, ResolveFailure},
	},
	stats::Stats,
};

/// Size threshold above which `db_size`/`table_stats` substitute their
/// `_approx` variant on managed instances.
const APPROX_SIZE_THRESHOLD_BYTES: u64 = 1_000_000_000_000;

/// Execution-environment tag that enables `_approx` substitution.
const MANAGED_EXEC_ENV: &str = "managed";

/// Statement timeout used when a fetch message carries no override.
const DEFAULT_STATEMENT_TIMEOUT: Duration = Duration::from_secs(30);

/// SQL execution seam: production code runs this over
/// `fetch::client::EndpointClient`; tests substitute a fake.
#[async_trait]
pub trait MetricExecutor: Send + Sync {
	/// Run `sql` against `endpoint` under `timeout` and return decoded rows.
	async fn query_rows(&self, endpoint: &Endpoint, sql: &str, timeout: Duration) -> Result<Vec<Row>>;
}
#[async_trait]
impl MetricExecutor for crate::fetch::client::EndpointClient {
	async fn query_rows(&self, _endpoint: &Endpoint, sql: &str, timeout: Duration) -> Result<Vec<Row>> {
		self.query_rows(sql, timeout).await
	}
}

/// Carried diff-state for the `change_events` multi-query flow; held by the
/// owning fetcher task across ticks.
#[derive(Clone, Debug, Default)]
pub struct ChangeEventsState {
	previous: HashMap<String, Row>,
}

/// Which SQL text to try, replacing the goto-based retry the source used with
/// an explicit two-state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Attempt {
	Normal,
	Superuser,
}

/// Run the fetch for one `(endpoint, metric)` tick. Returns zero or more
/// store messages: zero when gated or an empty diff, more than one for the
/// `reco_*` short-circuit (one per recommendation topic).
pub async fn fetch_once(
	msg: &FetchMessage,
	endpoint: &Endpoint,
	server: &ServerVersion,
	registry: &MetricRegistry,
	instance_cache: &InstanceCache,
	executor: &dyn MetricExecutor,
	stats: &Stats,
	instance_cache_max: Duration,
	change_state: &mut ChangeEventsState,
) -> Result<Vec<StoreMessage>> {
	if msg.metric_name == "recommendations" {
		return fetch_recommendations(msg, endpoint, server, registry, executor, stats).await;
	}

	if msg.metric_name == "change_events" {
		return fetch_change_events(msg, endpoint, server, registry, executor, stats, change_state).await;
	}

	if endpoint.db_type.is_pool_proxy() {
		return fetch_pool_proxy(msg, endpoint, server, registry, executor, stats).await;
	}

	let metric_name = substitute_approx(&msg.metric_name, server);
	let resolved = registry
		.resolve(&metric_name, server)
		.await
		.map_err(|failure| resolve_error(&metric_name, failure, server))?;
	let variant = resolved.variant;

	if variant.master_only && server.is_in_recovery {
		return Ok(Vec::new());
	}
	if variant.standby_only && !server.is_in_recovery {
		return Ok(Vec::new());
	}

	let timeout = msg.statement_timeout.unwrap_or(DEFAULT_STATEMENT_TIMEOUT);

	if variant.metric_attrs.is_instance_level && msg.interval_secs > instance_cache_max.as_secs() {
		let key = InstanceKey::new(&msg.original_name, &resolved.storage_name);

		if let Some(rows) = instance_cache.get_if_fresh(&key, instance_cache_max).await {
			stats.record_points_reused(rows.len() as u64);

			return Ok(vec![build_store_message(msg, endpoint, server, &resolved.storage_name, rows)]);
		}
	}

	let rows = execute_with_fallback(&variant, endpoint, executor, timeout).await?;

	if variant.metric_attrs.is_instance_level {
		let key = InstanceKey::new(&msg.original_name, &resolved.storage_name);

		instance_cache.put(key, rows.clone()).await;
	}

	let rows = post_process(rows, endpoint, server);

	stats.record_points_fetched(rows.len() as u64);
	stats.record_dataset_fetched();

	Ok(vec![build_store_message(msg, endpoint, server, &resolved.storage_name, rows)])
}

async fn execute_with_fallback(
	variant: &MetricVariant,
	endpoint: &Endpoint,
	executor: &dyn MetricExecutor,
	timeout: Duration,
) -> Result<Vec<Row>> {
	let mut attempt = if variant.sql.is_some() { Attempt::Normal } else { Attempt::Superuser };

	loop {
		let sql = match attempt {
			Attempt::Normal => variant.sql.as_deref(),
			Attempt::Superuser => variant.sql_superuser.as_deref(),
		};
		let Some(sql) = sql else {
			return Err(Error::MetricNotFound("no usable SQL variant for this server role".into()));
		};

		match executor.query_rows(endpoint, sql, timeout).await {
			Ok(rows) => return Ok(rows),
			Err(err) if attempt == Attempt::Normal && variant.sql_superuser.is_some() => {
				tracing::debug!(error = %err, "normal SQL failed, retrying with superuser variant");

				attempt = Attempt::Superuser;
			},
			Err(err) => return Err(err),
		}
	}
}

/// `reco_*` short-circuit: enumerate every
/// recommendation metric definition, execute each independently, and always
/// emit at least a placeholder row even when execution fails — the source's
/// "dummy row" behavior is preserved deliberately.
async fn fetch_recommendations(
	msg: &FetchMessage,
	endpoint: &Endpoint,
	server: &ServerVersion,
	registry: &MetricRegistry,
	executor: &dyn MetricExecutor,
	stats: &Stats,
) -> Result<Vec<StoreMessage>> {
	let snapshot = registry.snapshot().await;
	let topics: Vec<String> =
		snapshot.metric_names().filter(|name| name.starts_with("reco_")).map(String::from).collect();
	let mut messages = Vec::with_capacity(topics.len());

	for topic in topics {
		let resolved = snapshot.resolve(&topic, server).ok();
		let rows = match &resolved {
			Some(resolved) => {
				match execute_with_fallback(&resolved.variant, endpoint, executor, DEFAULT_STATEMENT_TIMEOUT).await {
					Ok(rows) if !rows.is_empty() => rows,
					_ => vec![placeholder_row()],
				}
			},
			None => vec![placeholder_row()],
		};
		let storage_name = resolved.map(|r| r.storage_name).unwrap_or_else(|| topic.clone());
		let mut rows = post_process(rows, endpoint, server);

		for row in &mut rows {
			row.set("tag_topic", Value::Text(topic.trim_start_matches("reco_").to_string()));
		}

		stats.record_points_fetched(rows.len() as u64);
		stats.record_dataset_fetched();
		messages.push(build_store_message(msg, endpoint, server, &storage_name, rows));
	}

	Ok(messages)
}

fn placeholder_row() -> Row {
	Row::new(vec![("epoch_ns".into(), Value::Int(Utc::now().timestamp_nanos_opt().unwrap_or_default()))])
}

/// `change_events` short-circuit: diffs the current
/// query result against the carried previous snapshot, keyed by `tag_object`.
async fn fetch_change_events(
	msg: &FetchMessage,
	endpoint: &Endpoint,
	server: &ServerVersion,
	registry: &MetricRegistry,
	executor: &dyn MetricExecutor,
	stats: &Stats,
	state: &mut ChangeEventsState,
) -> Result<Vec<StoreMessage>> {
	let resolved = registry
		.resolve("change_events", server)
		.await
		.map_err(|failure| resolve_error("change_events", failure, server))?;
	let rows = execute_with_fallback(&resolved.variant, endpoint, executor, DEFAULT_STATEMENT_TIMEOUT).await?;

	let mut current = HashMap::with_capacity(rows.len());

	for row in &rows {
		if let Some(Value::Text(key)) = row.get("tag_object") {
			current.insert(key.clone(), row.clone());
		}
	}

	let now_ns = Utc::now().timestamp_nanos_opt().unwrap_or_default();
	let mut events = Vec::new();

	for (key, row) in &current {
		match state.previous.get(key) {
			None => events.push(change_event_row(now_ns, key, "created")),
			Some(prev) if prev != row => events.push(change_event_row(now_ns, key, "altered")),
			_ => {},
		}
	}

	for key in state.previous.keys() {
		if !current.contains_key(key) {
			events.push(change_event_row(now_ns, key, "dropped"));
		}
	}

	state.previous = current;

	if events.is_empty() {
		stats.record_dataset_fetched();

		return Ok(Vec::new());
	}

	stats.record_points_fetched(events.len() as u64);
	stats.record_dataset_fetched();

	Ok(vec![build_store_message(msg, endpoint, server, "object_changes", events)])
}

fn change_event_row(now_ns: i64, key: &str, change_type: &str) -> Row {
	Row::new(vec![
		("epoch_ns".into(), Value::Int(now_ns)),
		("tag_object".into(), Value::Text(key.to_string())),
		("change_type".into(), Value::Text(change_type.to_string())),
	])
}

/// Pool-proxy short-circuit: a dedicated fetch path
/// that always applies pgbouncer-style row normalization.
async fn fetch_pool_proxy(
	msg: &FetchMessage,
	endpoint: &Endpoint,
	server: &ServerVersion,
	registry: &MetricRegistry,
	executor: &dyn MetricExecutor,
	stats: &Stats,
) -> Result<Vec<StoreMessage>> {
	let resolved = registry
		.resolve(&msg.metric_name, server)
		.await
		.map_err(|failure| resolve_error(&msg.metric_name, failure, server))?;
	let timeout = msg.statement_timeout.unwrap_or(DEFAULT_STATEMENT_TIMEOUT);
	let rows = execute_with_fallback(&resolved.variant, endpoint, executor, timeout).await?;
	let rows = post_process(rows, endpoint, server);

	stats.record_points_fetched(rows.len() as u64);
	stats.record_dataset_fetched();

	Ok(vec![build_store_message(msg, endpoint, server, &resolved.storage_name, rows)])
}

fn resolve_error(metric: &str, failure: ResolveFailure, server: &ServerVersion) -> Error {
	match failure {
		ResolveFailure::NotFound => Error::MetricNotFound(metric.to_string()),
		ResolveFailure::TooOld => Error::ServerTooOld {
			metric: metric.to_string(),
			min_version: String::new(),
			found_version: server.version_str.clone(),
		},
	}
}

fn substitute_approx(metric: &str, server: &ServerVersion) -> String {
	let eligible = matches!(metric, "db_size" | "table_stats")
		&& server.exec_env == MANAGED_EXEC_ENV
		&& server.approx_size_bytes > APPROX_SIZE_THRESHOLD_BYTES;

	if eligible { format!("{metric}_approx") } else { metric.to_string() }
}

/// Post-process rows: pgbouncer-style normalization for pool types, then
/// enrich with `tag_real_dbname`/`tag_sys_id`.
fn post_process(rows: Vec<Row>, endpoint: &Endpoint, server: &ServerVersion) -> Vec<Row> {
	let rows =
		if endpoint.db_type.needs_pool_normalization() { normalize_pool_rows(rows, endpoint, server) } else { rows };

	tag_rows(rows, server)
}

fn tag_rows(mut rows: Vec<Row>, server: &ServerVersion) -> Vec<Row> {
	for row in &mut rows {
		row.set("tag_real_dbname", Value::Text(server.real_dbname.clone()));
		row.set("tag_sys_id", Value::Text(server.system_identifier.clone()));
	}

	rows
}

/// Filters rows to the configured pool, renames `database` to `tag_database`,
/// and for server versions >= 1.12 converts numeric counter strings to
/// integers.
fn normalize_pool_rows(rows: Vec<Row>, endpoint: &Endpoint, server: &ServerVersion) -> Vec<Row> {
	let convert_numeric = compare_versions(&server.version_str, "1.12") != std::cmp::Ordering::Less;

	rows.into_iter()
		.filter(|row| match row.get("database") {
			Some(Value::Text(name)) => name == &endpoint.dbname,
			_ => true,
		})
		.map(|mut row| {
			row.rename_column("database", "tag_database");

			if convert_numeric {
				for (name, value) in row.columns.iter_mut() {
					if name.starts_with("tag_") || name == "epoch_ns" {
						continue;
					}

					if let Value::Text(text) = value {
						if let Ok(parsed) = text.parse::<i64>() {
							*value = Value::Int(parsed);
						}
					}
				}
			}

			row
		})
		.collect()
}

fn build_store_message(
	msg: &FetchMessage,
	endpoint: &Endpoint,
	server: &ServerVersion,
	storage_name: &str,
	rows: Vec<Row>,
) -> StoreMessage {
	StoreMessage {
		endpoint_name: msg.endpoint_name.clone(),
		metric_name: storage_name.to_string(),
		db_type: msg.db_type,
		custom_tags: endpoint.custom_tags.clone(),
		real_dbname: server.real_dbname.clone(),
		system_identifier: server.system_identifier.clone(),
		rows,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		endpoint::types::{DbType, HostConfig, IntervalMap, Password},
		metrics_def::types::{ColumnAttrs, MetricAttrs, MetricDefinition},
	};
	use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

	fn endpoint() -> Endpoint {
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

	fn server(in_recovery: bool) -> ServerVersion {
		ServerVersion {
			version_num: 140004,
			version_str: "14.4".into(),
			is_in_recovery: in_recovery,
			real_dbname: "postgres".into(),
			system_identifier: "123".into(),
			is_superuser: false,
			extensions: HashMap::new(),
			exec_env: String::new(),
			approx_size_bytes: 0,
			checked_at: Utc::now(),
			size_checked_at: None,
		}
	}

	fn message(metric: &str) -> FetchMessage {
		FetchMessage {
			endpoint_name: "db1".into(),
			original_name: "db1".into(),
			metric_name: metric.into(),
			db_type: DbType::Plain,
			interval_secs: 60,
			statement_timeout: None,
		}
	}

	struct FakeExecutor {
		calls: AtomicUsize,
		rows: Vec<Row>,
		fail_normal: bool,
	}
	#[async_trait]
	impl MetricExecutor for FakeExecutor {
		async fn query_rows(&self, _endpoint: &Endpoint, sql: &str, _timeout: Duration) -> Result<Vec<Row>> {
			self.calls.fetch_add(1, AtomicOrdering::SeqCst);

			if self.fail_normal && sql == "normal" {
				return Err(Error::SinkUnavailable("boom".into()));
			}

			Ok(self.rows.clone())
		}
	}

	fn sample_row() -> Row {
		Row::new(vec![("epoch_ns".into(), Value::Int(1)), ("numbackends".into(), Value::Int(4))])
	}

	fn variant(sql: Option<&str>, sql_superuser: Option<&str>) -> MetricVariant {
		MetricVariant {
			min_version: 0,
			sql: sql.map(String::from),
			sql_superuser: sql_superuser.map(String::from),
			master_only: false,
			standby_only: false,
			column_attrs: ColumnAttrs::default(),
			metric_attrs: MetricAttrs::default(),
			calls_helper_functions: false,
		}
	}

	async fn registry_with(name: &str, variant: MetricVariant) -> MetricRegistry {
		MetricRegistry::from_definitions(vec![MetricDefinition { name: name.into(), variants: vec![variant] }])
	}

	#[tokio::test]
	async fn superuser_fallback_runs_once_after_normal_sql_fails() {
		let registry = registry_with("db_stats", variant(Some("normal"), Some("su"))).await;
		let executor = FakeExecutor { calls: AtomicUsize::new(0), rows: vec![sample_row()], fail_normal: true };

		let outcome = fetch_once(
			&message("db_stats"),
			&endpoint(),
			&server(false),
			&registry,
			&InstanceCache::new(),
			&executor,
			&Stats::default(),
			Duration::from_secs(60),
			&mut ChangeEventsState::default(),
		)
		.await
		.unwrap();

		assert_eq!(executor.calls.load(AtomicOrdering::SeqCst), 2);
		assert_eq!(outcome.len(), 1);
		assert_eq!(outcome[0].rows.len(), 1);
	}

	#[tokio::test]
	async fn master_only_variant_is_skipped_while_in_recovery() {
		let mut v = variant(Some("normal"), None);

		v.master_only = true;

		let registry = registry_with("db_stats", v).await;
		let executor = FakeExecutor { calls: AtomicUsize::new(0), rows: vec![sample_row()], fail_normal: false };

		let outcome = fetch_once(
			&message("db_stats"),
			&endpoint(),
			&server(true),
			&registry,
			&InstanceCache::new(),
			&executor,
			&Stats::default(),
			Duration::from_secs(60),
			&mut ChangeEventsState::default(),
		)
		.await
		.unwrap();

		assert!(outcome.is_empty());
		assert_eq!(executor.calls.load(AtomicOrdering::SeqCst), 0);
	}

	#[tokio::test]
	async fn instance_level_metric_is_served_from_cache_when_fresh_and_interval_exceeds_window() {
		let mut v = variant(Some("normal"), None);

		v.metric_attrs.is_instance_level = true;

		let registry = registry_with("db_stats", v).await;
		let instance_cache = InstanceCache::new();

		instance_cache.put(InstanceKey::new("db1", "db_stats"), vec![sample_row()]).await;

		let executor = FakeExecutor { calls: AtomicUsize::new(0), rows: vec![sample_row(), sample_row()], fail_normal: false };
		let mut msg = message("db_stats");

		msg.interval_secs = 600;

		let stats = Stats::default();
		let outcome = fetch_once(
			&msg,
			&endpoint(),
			&server(false),
			&registry,
			&instance_cache,
			&executor,
			&stats,
			Duration::from_secs(60),
			&mut ChangeEventsState::default(),
		)
		.await
		.unwrap();

		assert_eq!(executor.calls.load(AtomicOrdering::SeqCst), 0, "cache hit must not query");
		assert_eq!(outcome[0].rows.len(), 1);
	}

	#[test]
	fn pool_rows_are_filtered_renamed_and_numeric_converted() {
		let mut server = server(false);

		server.version_str = "1.14".into();

		let rows = vec![
			Row::new(vec![("database".into(), Value::Text("postgres".into())), ("cl_active".into(), Value::Text("3".into()))]),
			Row::new(vec![("database".into(), Value::Text("other".into())), ("cl_active".into(), Value::Text("9".into()))]),
		];
		let normalized = normalize_pool_rows(rows, &endpoint(), &server);

		assert_eq!(normalized.len(), 1, "rows for other pools are filtered out");
		assert_eq!(normalized[0].get("tag_database"), Some(&Value::Text("postgres".into())));
		assert_eq!(normalized[0].get("cl_active"), Some(&Value::Int(3)));
	}

	#[tokio::test]
	async fn change_events_diff_reports_created_and_dropped_objects() {
		let registry = registry_with("change_events", variant(Some("normal"), None)).await;
		let first_rows = vec![Row::new(vec![("tag_object".into(), Value::Text("idx_a".into()))])];
		let executor = FakeExecutor { calls: AtomicUsize::new(0), rows: first_rows, fail_normal: false };
		let mut state = ChangeEventsState::default();

		let first = fetch_once(
			&message("change_events"),
			&endpoint(),
			&server(false),
			&registry,
			&InstanceCache::new(),
			&executor,
			&Stats::default(),
			Duration::from_secs(60),
			&mut state,
		)
		.await
		.unwrap();

		assert_eq!(first.len(), 1);
		assert_eq!(first[0].rows[0].get("change_type"), Some(&Value::Text("created".into())));

		let executor = FakeExecutor { calls: AtomicUsize::new(0), rows: Vec::new(), fail_normal: false };
		let second = fetch_once(
			&message("change_events"),
			&endpoint(),
			&server(false),
			&registry,
			&InstanceCache::new(),
			&executor,
			&Stats::default(),
			Duration::from_secs(60),
			&mut state,
		)
		.await
		.unwrap();

		assert_eq!(second.len(), 1);
		assert_eq!(second[0].rows[0].get("change_type"), Some(&Value::Text("dropped".into())));
	}
}
