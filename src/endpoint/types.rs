//! Endpoint configuration and server descriptor types.

// crates.io
use serde::{Deserialize, Serialize};
// self
use crate::_prelude::*;

/// Database-type tag for a monitored endpoint.
///
/// Drives per-variant fetch strategy (version probing, child-database
/// expansion, row normalization) instead of dispatching on a raw string.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DbType {
	/// Ordinary standalone database.
	Plain,
	/// Parent entry expanded into child endpoints by listing databases.
	ContinuousDiscovery,
	/// PgBouncer-style connection pooler.
	Pooler,
	/// Database managed by an external cluster orchestrator.
	ClusterManaged,
	/// Cluster-managed database with continuous discovery semantics.
	ClusterContinuous,
	/// Cluster-managed database whose children are discovered by namespace.
	ClusterNamespaceDiscovery,
	/// Pool-proxy endpoint fetched by a dedicated fetcher.
	PoolProxy,
}
impl DbType {
	/// Whether this db-type expands into child endpoints on supervisor refresh.
	pub fn expands_children(self) -> bool {
		matches!(
			self,
			DbType::ContinuousDiscovery
				| DbType::ClusterContinuous
				| DbType::ClusterNamespaceDiscovery
		)
	}

	/// Whether this db-type requires the dedicated pool-proxy fetch strategy.
	pub fn is_pool_proxy(self) -> bool {
		matches!(self, DbType::PoolProxy)
	}

	/// Whether rows from this db-type should go through pgbouncer-style
	/// post-processing (pool filtering, `database` → `tag_database` rename).
	pub fn needs_pool_normalization(self) -> bool {
		matches!(self, DbType::Pooler | DbType::PoolProxy)
	}
}

/// Password material for an endpoint: either plaintext or envelope-encrypted.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum Password {
	/// Password stored in the clear.
	Plain(String),
	/// Password stored as `salt_hex-iv_hex-ciphertext_hex` (see `crypto::envelope`).
	Envelope(String),
}

/// Per-metric interval overrides, in seconds; `0` or absent disables the metric.
pub type IntervalMap = HashMap<String, u64>;

/// Per-metric disabled day/time windows, keyed by metric name.
pub type HostMetricWindows = HashMap<String, Vec<crate::window::DisabledWindow>>;

/// Host-level configuration overrides layered on top of metric attribute
/// defaults — host-config overrides metric-attribute defaults when any entry
/// references the metric.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HostConfig {
	/// Disabled day/time windows keyed by metric name.
	#[serde(default)]
	pub disabled_windows: HostMetricWindows,
}

/// Identity and connection attributes for one monitored target.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Endpoint {
	/// Globally unique endpoint name (stable after continuous-discovery expansion).
	pub unique_name: String,
	/// Name of the entry this endpoint was expanded from, if any.
	#[serde(default)]
	pub original_name: Option<String>,
	/// Connection host.
	pub host: String,
	/// Connection port.
	#[serde(default = "default_port")]
	pub port: u16,
	/// Database name to connect to.
	pub dbname: String,
	/// Connection user.
	pub user: String,
	/// Connection password.
	pub password: Password,
	/// Whether TLS is required for this connection.
	#[serde(default)]
	pub ssl_required: bool,
	/// Database-type tag.
	pub db_type: DbType,
	/// Interval map applied while the server is primary.
	#[serde(default)]
	pub metrics_primary: IntervalMap,
	/// Interval map applied while the server is standby; absent means "same
	/// set as primary, shut down on role change".
	#[serde(default)]
	pub metrics_standby: Option<IntervalMap>,
	/// Custom tags attached to every row emitted for this endpoint.
	#[serde(default)]
	pub custom_tags: HashMap<String, String>,
	/// Host-level configuration overrides.
	#[serde(default)]
	pub host_config: HostConfig,
	/// Only run fetchers while the server is primary.
	#[serde(default)]
	pub only_if_master: bool,
	/// Whether this endpoint is enabled at all.
	#[serde(default = "default_true")]
	pub is_enabled: bool,
	/// Whether the configured user has superuser privileges.
	#[serde(default)]
	pub is_superuser: bool,
	/// Minimum approximate size (bytes) below which fetchers are paused.
	/// Zero means no size floor is enforced.
	#[serde(default)]
	pub min_size_bytes: u64,
	/// Logical group label, used to tag `configured_dbs` synthetic rows.
	#[serde(default)]
	pub group: String,
}
impl Endpoint {
	/// Effective interval map for the given recovery state.
	pub fn intervals_for(&self, in_recovery: bool) -> &IntervalMap {
		if in_recovery {
			self.metrics_standby.as_ref().unwrap_or(&self.metrics_primary)
		} else {
			&self.metrics_primary
		}
	}

	/// Whether fetchers must be torn down entirely on entering recovery,
	/// versus swapped to the standby interval map.
	pub fn shuts_down_on_standby(&self) -> bool {
		self.only_if_master && self.metrics_standby.is_none()
	}

	/// Resolve this endpoint's password to plaintext, decrypting it under
	/// `key` when it is envelope-encrypted.
	pub fn plaintext_password(&self, key: &[u8]) -> Result<String> {
		match &self.password {
			Password::Plain(p) => Ok(p.clone()),
			Password::Envelope(blob) => crate::crypto::envelope::decrypt(blob, key),
		}
	}
}

fn default_port() -> u16 {
	5432
}

fn default_true() -> bool {
	true
}

/// Snapshot of a probed server's version and capabilities.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerVersion {
	/// Semantic version number, e.g. `140004` for 14.4 (pgwatch-style encoding).
	pub version_num: u32,
	/// Textual version string as reported by the server.
	pub version_str: String,
	/// Whether the server is currently in recovery (standby).
	pub is_in_recovery: bool,
	/// Real database name (may differ from the configured `dbname` alias).
	pub real_dbname: String,
	/// System identifier, stable across failovers of the same cluster.
	pub system_identifier: String,
	/// Whether the connected role has superuser privileges.
	pub is_superuser: bool,
	/// Installed extensions mapped to their version string.
	#[serde(default)]
	pub extensions: HashMap<String, String>,
	/// Execution-environment tag (e.g. `"managed"`, `"self-hosted"`).
	#[serde(default)]
	pub exec_env: String,
	/// Approximate total database size in bytes, refreshed separately.
	#[serde(default)]
	pub approx_size_bytes: u64,
	/// Wall-clock time the version record was last refreshed.
	pub checked_at: DateTime<Utc>,
	/// Wall-clock time the size was last refreshed.
	#[serde(default)]
	pub size_checked_at: Option<DateTime<Utc>>,
}
impl ServerVersion {
	/// Whether an installed extension satisfies a minimum version requirement.
	pub fn extension_at_least(&self, name: &str, min_version: &str) -> bool {
		self.extensions
			.get(name)
			.map(|installed| compare_versions(installed, min_version) >= std::cmp::Ordering::Equal)
			.unwrap_or(false)
	}
}

/// Compare two dotted version strings numerically, component by component.
pub fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
	let parse = |s: &str| -> Vec<u64> { s.split('.').map(|part| part.parse().unwrap_or(0)).collect() };
	let (pa, pb) = (parse(a), parse(b));
	let len = pa.len().max(pb.len());

	for i in 0..len {
		let va = pa.get(i).copied().unwrap_or(0);
		let vb = pb.get(i).copied().unwrap_or(0);
		let ord = va.cmp(&vb);

		if ord != std::cmp::Ordering::Equal {
			return ord;
		}
	}

	std::cmp::Ordering::Equal
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn version_compare_handles_uneven_component_counts() {
		assert_eq!(compare_versions("1.8", "1.8.0"), std::cmp::Ordering::Equal);
		assert_eq!(compare_versions("1.9", "1.8"), std::cmp::Ordering::Greater);
		assert_eq!(compare_versions("1.2", "1.10"), std::cmp::Ordering::Less);
	}

	#[test]
	fn plaintext_password_decrypts_envelope_material() {
		let key = b"a 128-bit-or-longer key material";
		let mut endpoint = sample_endpoint();

		endpoint.password = Password::Plain("hunter2".into());
		assert_eq!(endpoint.plaintext_password(key).unwrap(), "hunter2");

		endpoint.password = Password::Envelope(crate::crypto::envelope::encrypt("hunter2", key).unwrap());
		assert_eq!(endpoint.plaintext_password(key).unwrap(), "hunter2");
	}

	#[test]
	fn only_if_master_without_standby_map_shuts_down() {
		let mut endpoint = sample_endpoint();

		endpoint.only_if_master = true;
		endpoint.metrics_standby = None;
		assert!(endpoint.shuts_down_on_standby());

		endpoint.metrics_standby = Some(IntervalMap::new());
		assert!(!endpoint.shuts_down_on_standby());
	}

	fn sample_endpoint() -> Endpoint {
		Endpoint {
			unique_name: "db1".into(),
			original_name: None,
			host: "localhost".into(),
			port: 5432,
			dbname: "postgres".into(),
			user: "monitor".into(),
			password: Password::Plain("secret".into()),
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
}
