//! Metric definition sources: file tree or control database, unified behind
//! one trait so the registry refresh loop is agnostic to the backing store.

pub mod db;
pub mod file;

// self
use crate::{_prelude::*, metrics_def::types::MetricDefinition};

/// Backing store for metric definitions.
#[async_trait::async_trait]
pub trait MetricSource: Send + Sync {
	/// Load the full set of metric definitions from this source.
	async fn load(&self) -> Result<Vec<MetricDefinition>>;
}

pub use db::ControlDbSource;
pub use file::FileTreeSource;
