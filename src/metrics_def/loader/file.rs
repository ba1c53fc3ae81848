//! File-tree metric definition source.
//!
//! `<root>/<metric_name>/<version>/metric[_master|_standby|_su].sql`, with
//! optional `metric_attrs.yaml` and `column_attrs.yaml` siblings of the
//! versioned folders. The top-level `00_helpers` folder is reserved and
//! skipped.

// std
use std::path::{Path, PathBuf};
// crates.io
use regex::Regex;
use tokio::fs;
// self
use crate::{
	_prelude::*,
	metrics_def::types::{encode_pg_version, ColumnAttrs, MetricAttrs, MetricDefinition, MetricVariant},
};

const RESERVED_HELPERS_DIR: &str = "00_helpers";

fn metric_name_pattern() -> &'static Regex {
	static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();

	PATTERN.get_or_init(|| Regex::new(r"^[a-z0-9_.]+$").expect("valid metric name regex"))
}

/// Loads metric definitions from a directory tree on disk.
#[derive(Clone, Debug)]
pub struct FileTreeSource {
	root: PathBuf,
}
impl FileTreeSource {
	/// Construct a source rooted at the given directory.
	pub fn new(root: impl Into<PathBuf>) -> Self {
		Self { root: root.into() }
	}
}
#[async_trait::async_trait]
impl super::MetricSource for FileTreeSource {
	async fn load(&self) -> Result<Vec<MetricDefinition>> {
		let mut out = Vec::new();
		let mut entries = fs::read_dir(&self.root).await?;

		while let Some(entry) = entries.next_entry().await? {
			let path = entry.path();

			if !entry.file_type().await?.is_dir() {
				continue;
			}

			let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };

			if name == RESERVED_HELPERS_DIR || !metric_name_pattern().is_match(name) {
				continue;
			}

			if let Some(definition) = load_metric_dir(&path, name).await? {
				out.push(definition);
			}
		}

		Ok(out)
	}
}

async fn load_metric_dir(dir: &Path, name: &str) -> Result<Option<MetricDefinition>> {
	let shared_metric_attrs = load_yaml::<MetricAttrs>(&dir.join("metric_attrs.yaml")).await?;
	let shared_column_attrs = load_yaml::<ColumnAttrs>(&dir.join("column_attrs.yaml")).await?;
	let mut definition = MetricDefinition { name: name.to_string(), variants: Vec::new() };
	let mut entries = fs::read_dir(dir).await?;

	while let Some(entry) = entries.next_entry().await? {
		let path = entry.path();

		if !entry.file_type().await?.is_dir() {
			continue;
		}

		let Some(version_name) = path.file_name().and_then(|n| n.to_str()) else { continue };
		let Some(min_version) = encode_pg_version(version_name) else { continue };

		let sql = read_optional(&path.join("metric.sql")).await?;
		let sql_superuser = read_optional(&path.join("metric_su.sql")).await?;
		let master_sql = read_optional(&path.join("metric_master.sql")).await?;
		let standby_sql = read_optional(&path.join("metric_standby.sql")).await?;
		let (sql, master_only, standby_only) = match (sql, master_sql, standby_sql) {
			(Some(normal), _, _) => (Some(normal), false, false),
			(None, Some(master), _) => (Some(master), true, false),
			(None, None, Some(standby)) => (Some(standby), false, true),
			(None, None, None) if sql_superuser.is_some() => (None, false, false),
			(None, None, None) => continue,
		};

		definition.push_variant(MetricVariant {
			min_version,
			sql,
			sql_superuser,
			master_only,
			standby_only,
			column_attrs: shared_column_attrs.clone().unwrap_or_default(),
			metric_attrs: shared_metric_attrs.clone().unwrap_or_default(),
			calls_helper_functions: false,
		});
	}

	if definition.variants.is_empty() { Ok(None) } else { Ok(Some(definition)) }
}

async fn read_optional(path: &Path) -> Result<Option<String>> {
	match fs::read_to_string(path).await {
		Ok(content) => Ok(Some(content)),
		Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(err) => Err(err.into()),
	}
}

async fn load_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
	match fs::read_to_string(path).await {
		Ok(content) => Ok(Some(serde_yaml::from_str(&content)?)),
		Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(err) => Err(err.into()),
	}
}

/// Preset metric configurations: named bundles of `{metric: interval_seconds}`.
pub type PresetConfigs = HashMap<String, HashMap<String, u64>>;

/// Load the top-level `preset-configs.yaml` if present.
pub async fn load_preset_configs(root: &Path) -> Result<PresetConfigs> {
	match load_yaml::<PresetConfigs>(&root.join("preset-configs.yaml")).await? {
		Some(presets) => Ok(presets),
		None => Ok(PresetConfigs::new()),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::metrics_def::loader::MetricSource;

	#[tokio::test]
	async fn loads_versions_and_attrs_from_disk() {
		let dir = tempfile::tempdir().unwrap();
		let metric_dir = dir.path().join("db_stats");
		let v11 = metric_dir.join("11");

		fs::create_dir_all(&v11).await.unwrap();
		fs::write(v11.join("metric.sql"), "select 1").await.unwrap();
		fs::write(
			metric_dir.join("metric_attrs.yaml"),
			"is_instance_level: true\nstatement_timeout_ms: 5000\n",
		)
		.await
		.unwrap();

		let helpers = dir.path().join(RESERVED_HELPERS_DIR);

		fs::create_dir_all(&helpers).await.unwrap();

		let source = FileTreeSource::new(dir.path());
		let defs = source.load().await.unwrap();

		assert_eq!(defs.len(), 1);
		assert_eq!(defs[0].name, "db_stats");
		assert_eq!(defs[0].variants[0].min_version, 110000);
		assert!(defs[0].variants[0].metric_attrs.is_instance_level);
	}
}
