//! Metric definition registry: source of truth is either a file tree or a
//! control database, both parsed into the same in-memory structure.

pub mod loader;
pub mod registry;
pub mod types;

pub use registry::{DefinitionSnapshot, MetricRegistry, ResolvedMetric, REFRESH_INTERVAL};
pub use types::{
	encode_pg_version, ColumnAttrs, ExtensionOverride, MetricAttrs, MetricDefinition, MetricVariant,
	ResolveFailure,
};
