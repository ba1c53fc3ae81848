//! Multi-target database metrics collector — dynamic per-endpoint fetcher
//! scheduling, versioned SQL metric resolution, and pluggable time-series
//! sinks, built for Rust monitoring systems.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

pub mod batch;
pub mod cache;
pub mod config;
pub mod core;
pub mod crypto;
pub mod endpoint;
pub mod fetch;
pub mod gating;
pub mod logging;
#[cfg(feature = "metrics")] pub mod metrics;
pub mod metrics_def;
pub mod persist;
pub mod stats;
pub mod supervisor;
pub mod window;

mod error;

// `clap` is only used by `src/bin/collectord.rs`, which this crate's
// `unused_crate_dependencies` check can't see.
use clap as _;

mod _prelude {
	pub use std::{
		collections::HashMap,
		sync::Arc,
		time::{Duration, SystemTime},
	};

	pub use chrono::{DateTime, Utc};
	pub use tokio::time::Instant;

	pub use crate::{Error, Result};
}

pub use crate::{
	core::Core,
	error::{Error, Result},
};
