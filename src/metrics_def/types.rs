//! Metric definition data model.

// crates.io
use serde::{Deserialize, Serialize};
// self
use crate::{_prelude::*, window::DisabledWindow};

/// Prometheus-oriented hints for a single output column.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ColumnAttrs {
	/// Columns that should be treated as Prometheus labels instead of values.
	#[serde(default)]
	pub label_columns: Vec<String>,
	/// Columns to drop entirely before emitting the row.
	#[serde(default)]
	pub ignore_columns: Vec<String>,
}

/// An extension-based SQL override: when the listed extensions are all
/// installed at or above their minimum versions, the variant's SQL is
/// replaced by the target metric's SQL.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExtensionOverride {
	/// Extension name required for this override to apply.
	pub extension: String,
	/// Minimum installed version of the extension.
	pub min_version: String,
	/// Name of the metric whose SQL variant replaces this one's.
	pub target_metric: String,
}

/// Metric-attribute metadata shared across all versions of a metric, with
/// optional per-version overrides layered on at load time.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MetricAttrs {
	/// Whether the metric's value is identical across sibling databases on
	/// one server, making it eligible for the instance-level cache.
	#[serde(default)]
	pub is_instance_level: bool,
	/// Remap the outgoing store-message metric name to this storage name.
	#[serde(default)]
	pub metric_storage_name: Option<String>,
	/// Default disabled-day/time windows, overridden by host config.
	#[serde(default)]
	pub disabled_windows: Vec<DisabledWindow>,
	/// Per-statement timeout override, in milliseconds.
	#[serde(default)]
	pub statement_timeout_ms: Option<u64>,
	/// Extension-based SQL overrides, evaluated in order.
	#[serde(default)]
	pub extension_overrides: Vec<ExtensionOverride>,
	/// Whether this metric's rows must never be forwarded to external sinks
	/// that are not access-controlled (privacy flag).
	#[serde(default)]
	pub is_private: bool,
}

/// One version-keyed SQL variant of a metric.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricVariant {
	/// Minimum server version (encoded like `ServerVersion::version_num`) this
	/// variant applies to.
	pub min_version: u32,
	/// Normal (non-superuser) SQL text.
	pub sql: Option<String>,
	/// Superuser SQL text, tried as a fallback when the normal SQL fails.
	pub sql_superuser: Option<String>,
	/// Restrict this variant to primary servers only.
	#[serde(default)]
	pub master_only: bool,
	/// Restrict this variant to standby servers only.
	#[serde(default)]
	pub standby_only: bool,
	/// Column attributes.
	#[serde(default)]
	pub column_attrs: ColumnAttrs,
	/// Metric attributes.
	#[serde(default)]
	pub metric_attrs: MetricAttrs,
	/// Whether this variant's SQL calls installed helper functions.
	#[serde(default)]
	pub calls_helper_functions: bool,
}
impl MetricVariant {
	/// Whether the normal SQL path is usable given the `no_helper_functions` flag.
	pub fn normal_sql_usable(&self, no_helper_functions: bool) -> bool {
		self.sql.is_some() && !(no_helper_functions && self.calls_helper_functions)
	}
}

/// A metric definition: a name plus a sorted sequence of version-keyed variants.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MetricDefinition {
	/// Metric name, matching `^[a-z0-9_.]+$`.
	pub name: String,
	/// Version-keyed variants, kept sorted ascending by `min_version`.
	pub variants: Vec<MetricVariant>,
}
impl MetricDefinition {
	/// Insert a variant, maintaining the sorted-by-version invariant.
	pub fn push_variant(&mut self, variant: MetricVariant) {
		let pos = self.variants.partition_point(|v| v.min_version <= variant.min_version);

		self.variants.insert(pos, variant);
	}

	/// Lowest version across all variants (used to classify "too old" failures).
	pub fn min_version(&self) -> Option<u32> {
		self.variants.first().map(|v| v.min_version)
	}
}

/// Encode a decimal `major[.minor]` version string (as used for metric
/// definition tree folder names, e.g. `"9.6"`, `"11"`, `"13"`) into the same
/// `major*10000 + minor*100` scheme as `ServerVersion::version_num`.
pub fn encode_pg_version(decimal: &str) -> Option<u32> {
	let decimal = decimal.trim();
	let mut parts = decimal.splitn(2, '.');
	let major: u32 = parts.next()?.parse().ok()?;
	let minor: u32 = match parts.next() {
		Some(raw) => raw.parse().ok()?,
		None => 0,
	};

	Some(major * 10_000 + minor * 100)
}

/// Reason a metric/version lookup failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ResolveFailure {
	/// No definition exists for the requested metric name at all.
	#[error("metric not found")]
	NotFound,
	/// A definition exists but the server version is older than the lowest
	/// defined variant.
	#[error("server too old")]
	TooOld,
}
