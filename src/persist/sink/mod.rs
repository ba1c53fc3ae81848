//! Pluggable time-series sinks.

pub mod columnar;
pub mod graphing;
pub mod json;
pub mod pull;

pub use columnar::ColumnarSink;
pub use graphing::GraphingSink;
pub use json::JsonSink;
pub use pull::PullSink;

// self
use crate::{_prelude::*, fetch::message::StoreMessage};

/// A destination for batched store messages.
///
/// Implementations never block indefinitely: a transient failure should
/// return promptly so the persister can queue the batch for retry.
#[async_trait::async_trait]
pub trait Sink: Send + Sync {
	/// Write one batch, failing the whole batch on any error.
	async fn write(&self, batch: &[StoreMessage]) -> Result<()>;

	/// Human-readable identity for logs and the stats endpoint.
	fn name(&self) -> &str;
}
