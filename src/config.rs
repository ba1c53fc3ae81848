//! On-disk configuration for the `collectord` binary.
//!
//! This is a deliberately thin loader: the full "file tree or control
//! database" metric-definition config system is an external collaborator
//!. What lives here is just the shape the binary
//! needs to construct a `Core`.

// std
use std::{net::SocketAddr, path::PathBuf};
// crates.io
use serde::{Deserialize, Serialize};
// self
use crate::{_prelude::*, endpoint::types::Endpoint};

/// Where to load metric definitions from.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum MetricSourceConfig {
	/// Directory tree of `<metric>/<version>/metric.sql` files.
	FileTree {
		/// Root directory to walk.
		root: PathBuf,
	},
	/// `pgwatch3.metric` control-database table.
	ControlDb {
		/// Postgres connection string for the control database.
		database_url: String,
	},
}

/// One configured output sink. Capped at two in practice, enforced by
/// [`CollectorConfig::validate`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SinkConfig {
	/// Relational sink: one table per metric.
	Columnar {
		/// Postgres connection string for the metrics store.
		database_url: String,
		/// Days to retain rows before the retention job deletes them.
		#[serde(default = "default_retention_days")]
		retention_days: u32,
	},
	/// Carbon-style line-protocol TCP sink.
	Graphing {
		/// `host:port` of the graphing daemon.
		address: String,
	},
	/// Newline-delimited JSON file sink.
	Json {
		/// Output file path, appended to.
		path: PathBuf,
	},
	/// In-memory pull sink, scraped through the stats HTTP listener.
	Pull,
}

fn default_retention_days() -> u32 {
	30
}

/// Top-level collector configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CollectorConfig {
	/// Source of metric definitions.
	pub metric_source: MetricSourceConfig,
	/// Monitored endpoints, prior to continuous-discovery expansion.
	#[serde(default)]
	pub endpoints: Vec<Endpoint>,
	/// Output sinks.
	#[serde(default)]
	pub sinks: Vec<SinkConfig>,
	/// Cadence for the supervisor's definition/endpoint refresh.
	#[serde(default = "default_refresh_loop_seconds")]
	pub servers_refresh_loop_seconds: u64,
	/// Cadence for `configured_dbs` synthetic metric emission.
	#[serde(default = "default_sync_interval_seconds")]
	pub monitored_dbs_sync_interval_seconds: u64,
	/// Max age before an instance-level cache entry is refetched.
	#[serde(default = "default_instance_cache_max_age_seconds")]
	pub instance_cache_max_age_seconds: u64,
	/// Batching delay before a partial buffer is flushed.
	#[serde(default = "default_batch_max_delay_seconds")]
	pub batch_max_delay_seconds: u64,
	/// Per-sink bounded retry queue capacity.
	#[serde(default = "default_retry_queue_max")]
	pub retry_queue_max: usize,
	/// Address the stats JSON endpoint listens on.
	pub stats_listen_addr: SocketAddr,
	/// Presence of this file pauses every fetcher.
	#[serde(default)]
	pub emergency_pause_trigger_file: Option<PathBuf>,
}
impl CollectorConfig {
	/// Parse from a YAML document and validate cross-field invariants.
	pub fn from_yaml(text: &str) -> Result<Self> {
		let config: Self = serde_yaml::from_str(text)?;

		config.validate()?;

		Ok(config)
	}

	/// Validate invariants serde defaults can't express on their own.
	pub fn validate(&self) -> Result<()> {
		if self.sinks.is_empty() {
			return Err(Error::Config("at least one sink must be configured".into()));
		}

		if self.sinks.len() > 2 {
			return Err(Error::Config("at most two sinks may be configured".into()));
		}

		Ok(())
	}
}

fn default_refresh_loop_seconds() -> u64 {
	120
}

fn default_sync_interval_seconds() -> u64 {
	600
}

fn default_instance_cache_max_age_seconds() -> u64 {
	60
}

fn default_batch_max_delay_seconds() -> u64 {
	5
}

fn default_retry_queue_max() -> usize {
	10_000
}

#[cfg(test)]
mod tests {
	use super::*;

	fn minimal(sinks: &str) -> String {
		format!(
			"metric_source:\n  kind: file_tree\n  root: /etc/pgwatch3/metrics\nsinks:\n{sinks}stats_listen_addr: \"127.0.0.1:8080\"\n"
		)
	}

	#[test]
	fn minimal_document_parses_with_defaults() {
		let config = CollectorConfig::from_yaml(&minimal("  - kind: pull\n")).unwrap();

		assert_eq!(config.servers_refresh_loop_seconds, 120);
		assert_eq!(config.monitored_dbs_sync_interval_seconds, 600);
		assert_eq!(config.sinks.len(), 1);
	}

	#[test]
	fn empty_sinks_are_rejected() {
		assert!(CollectorConfig::from_yaml(&minimal("")).is_err());
	}

	#[test]
	fn more_than_two_sinks_are_rejected() {
		let sinks = "  - kind: pull\n  - kind: json\n    path: /tmp/out.jsonl\n  - kind: pull\n";

		assert!(CollectorConfig::from_yaml(&minimal(sinks)).is_err());
	}
}
