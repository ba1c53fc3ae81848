//! Metric definition registry: caches and resolves metric SQL by server
//! version and extension set.

// std
use std::collections::HashMap;
// crates.io
use tokio::sync::RwLock;
// self
use crate::{
	_prelude::*,
	endpoint::types::ServerVersion,
	metrics_def::types::{MetricDefinition, MetricVariant, ResolveFailure},
};

/// Minimum interval between full registry refreshes.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(120);

/// A resolved metric variant plus the storage name to use for the outgoing
/// store message (applies the `metric_storage_name` remap).
#[derive(Clone, Debug)]
pub struct ResolvedMetric {
	/// The variant selected after version lookup and extension overrides.
	pub variant: MetricVariant,
	/// Name to use on the outgoing `StoreMessage` (remapped or original).
	pub storage_name: String,
}

/// In-memory snapshot of every loaded metric definition.
#[derive(Clone, Debug, Default)]
pub struct DefinitionSnapshot {
	definitions: HashMap<String, MetricDefinition>,
}
impl DefinitionSnapshot {
	/// Build a snapshot from a flat list of definitions.
	pub fn from_definitions(definitions: Vec<MetricDefinition>) -> Self {
		Self { definitions: definitions.into_iter().map(|d| (d.name.clone(), d)).collect() }
	}

	/// All metric names currently defined.
	pub fn metric_names(&self) -> impl Iterator<Item = &str> {
		self.definitions.keys().map(String::as_str)
	}

	/// Resolve `metric` for the given server version and extension set:
	/// select the greatest version-gated variant at or below the server's
	/// version, then redirect to an extension override's target metric when
	/// one of its required extensions is installed at the required version.
	pub fn resolve(
		&self,
		metric: &str,
		server: &ServerVersion,
	) -> std::result::Result<ResolvedMetric, ResolveFailure> {
		self.resolve_inner(metric, server, 0)
	}

	fn resolve_inner(
		&self,
		metric: &str,
		server: &ServerVersion,
		depth: u8,
	) -> std::result::Result<ResolvedMetric, ResolveFailure> {
		// Guard against a pathological override cycle; a real config can't
		// usefully nest extension overrides this deep.
		if depth > 16 {
			return Err(ResolveFailure::NotFound);
		}

		let definition = self.definitions.get(metric).ok_or(ResolveFailure::NotFound)?;
		let selected = definition
			.variants
			.iter()
			.rev()
			.find(|variant| variant.min_version <= server.version_num);

		let mut variant = match selected {
			Some(variant) => variant.clone(),
			None => {
				let lowest = definition.min_version().unwrap_or(0);

				return if server.version_num < lowest {
					Err(ResolveFailure::TooOld)
				} else {
					Err(ResolveFailure::NotFound)
				};
			},
		};

		for over in &variant.metric_attrs.extension_overrides {
			if server.extension_at_least(&over.extension, &over.min_version) {
				let target = self.resolve_inner(&over.target_metric, server, depth + 1)?;

				variant.sql = target.variant.sql;
				variant.sql_superuser = target.variant.sql_superuser;
				break;
			}
		}

		let storage_name = variant
			.metric_attrs
			.metric_storage_name
			.clone()
			.unwrap_or_else(|| metric.to_string());

		Ok(ResolvedMetric { variant, storage_name })
	}
}

/// Reader-writer-locked registry; resolution copies the current snapshot so
/// lookups never hold the lock.
#[derive(Clone, Debug)]
pub struct MetricRegistry {
	inner: Arc<RwLock<DefinitionSnapshot>>,
}
impl MetricRegistry {
	/// Construct an empty registry.
	pub fn new() -> Self {
		Self { inner: Arc::new(RwLock::new(DefinitionSnapshot::default())) }
	}

	/// Construct a registry pre-populated with the given definitions.
	pub fn from_definitions(definitions: Vec<MetricDefinition>) -> Self {
		Self { inner: Arc::new(RwLock::new(DefinitionSnapshot::from_definitions(definitions))) }
	}

	/// Atomically swap in a freshly loaded snapshot.
	pub async fn swap(&self, definitions: Vec<MetricDefinition>) {
		let mut guard = self.inner.write().await;

		*guard = DefinitionSnapshot::from_definitions(definitions);
	}

	/// Take a cloned snapshot for lock-free resolution.
	pub async fn snapshot(&self) -> DefinitionSnapshot {
		self.inner.read().await.clone()
	}

	/// Resolve a metric against the current snapshot in one call.
	pub async fn resolve(
		&self,
		metric: &str,
		server: &ServerVersion,
	) -> std::result::Result<ResolvedMetric, ResolveFailure> {
		self.snapshot().await.resolve(metric, server)
	}
}
impl Default for MetricRegistry {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::metrics_def::types::{ColumnAttrs, ExtensionOverride, MetricAttrs};

	fn server(version_num: u32, extensions: &[(&str, &str)]) -> ServerVersion {
		ServerVersion {
			version_num,
			version_str: version_num.to_string(),
			is_in_recovery: false,
			real_dbname: "postgres".into(),
			system_identifier: "1".into(),
			is_superuser: false,
			extensions: extensions.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
			exec_env: String::new(),
			approx_size_bytes: 0,
			checked_at: Utc::now(),
			size_checked_at: None,
		}
	}

	fn variant(min_version: u32, sql: &str) -> MetricVariant {
		MetricVariant {
			min_version,
			sql: Some(sql.into()),
			sql_superuser: None,
			master_only: false,
			standby_only: false,
			column_attrs: ColumnAttrs::default(),
			metric_attrs: MetricAttrs::default(),
			calls_helper_functions: false,
		}
	}

	fn definition(name: &str, variants: Vec<MetricVariant>) -> MetricDefinition {
		MetricDefinition { name: name.into(), variants }
	}

	#[test]
	fn selects_greatest_version_leq_server() {
		// versions 9.6(=90600), 11(=110000), 13(=130000); server at
		// 12.4(=120004) -> expect 11's variant.
		let def = definition(
			"x",
			vec![variant(90600, "v96"), variant(110000, "v11"), variant(130000, "v13")],
		);
		let snapshot = DefinitionSnapshot::from_definitions(vec![def]);
		let resolved = snapshot.resolve("x", &server(120004, &[])).unwrap();

		assert_eq!(resolved.variant.sql.as_deref(), Some("v11"));
	}

	#[test]
	fn server_older_than_min_version_is_too_old() {
		let def = definition(
			"x",
			vec![variant(90600, "v96"), variant(110000, "v11"), variant(130000, "v13")],
		);
		let snapshot = DefinitionSnapshot::from_definitions(vec![def]);

		assert_eq!(snapshot.resolve("x", &server(90400, &[])), Err(ResolveFailure::TooOld));
	}

	#[test]
	fn unknown_metric_is_not_found() {
		let snapshot = DefinitionSnapshot::from_definitions(vec![]);

		assert_eq!(snapshot.resolve("ghost", &server(120000, &[])), Err(ResolveFailure::NotFound));
	}

	#[test]
	fn extension_override_replaces_sql_and_keeps_other_fields() {
		let mut v13 = variant(130000, "v13_default");
		v13.calls_helper_functions = true;
		v13.metric_attrs.extension_overrides.push(ExtensionOverride {
			extension: "pg_stat_statements".into(),
			min_version: "1.8".into(),
			target_metric: "x_pss18".into(),
		});

		let pss = definition("x_pss18", vec![variant(0, "v_pss18_sql")]);
		let def = definition("x", vec![v13]);
		let snapshot = DefinitionSnapshot::from_definitions(vec![def, pss]);
		let resolved =
			snapshot.resolve("x", &server(140000, &[("pg_stat_statements", "1.9")])).unwrap();

		assert_eq!(resolved.variant.sql.as_deref(), Some("v_pss18_sql"));
		assert!(resolved.variant.calls_helper_functions, "non-sql fields must be retained");
	}

	#[test]
	fn extension_override_is_skipped_when_version_too_low() {
		let mut v13 = variant(130000, "v13_default");
		v13.metric_attrs.extension_overrides.push(ExtensionOverride {
			extension: "pg_stat_statements".into(),
			min_version: "1.8".into(),
			target_metric: "x_pss18".into(),
		});

		let pss = definition("x_pss18", vec![variant(0, "v_pss18_sql")]);
		let def = definition("x", vec![v13]);
		let snapshot = DefinitionSnapshot::from_definitions(vec![def, pss]);
		let resolved =
			snapshot.resolve("x", &server(140000, &[("pg_stat_statements", "1.5")])).unwrap();

		assert_eq!(resolved.variant.sql.as_deref(), Some("v13_default"));
	}

	#[test]
	fn storage_name_remap_is_applied() {
		let mut v = variant(0, "sql");

		v.metric_attrs.metric_storage_name = Some("shared_bucket".into());

		let def = definition("x", vec![v]);
		let snapshot = DefinitionSnapshot::from_definitions(vec![def]);
		let resolved = snapshot.resolve("x", &server(1, &[])).unwrap();

		assert_eq!(resolved.storage_name, "shared_bucket");
	}

	#[tokio::test]
	async fn swap_replaces_the_active_snapshot() {
		let registry = MetricRegistry::new();

		assert_eq!(
			registry.resolve("x", &server(1, &[])).await,
			Err(ResolveFailure::NotFound)
		);

		registry.swap(vec![definition("x", vec![variant(0, "sql")])]).await;

		assert!(registry.resolve("x", &server(1, &[])).await.is_ok());
	}
}
