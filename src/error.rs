//! Crate-wide error types and `Result` alias.

/// Library-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the collector crate.
#[allow(missing_docs)]
#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	Io(#[from] std::io::Error),
	#[error(transparent)]
	SystemTime(#[from] std::time::SystemTimeError),

	#[error(transparent)]
	Postgres(#[from] tokio_postgres::Error),
	#[error(transparent)]
	Pool(#[from] deadpool_postgres::PoolError),
	#[error(transparent)]
	PoolBuild(#[from] deadpool_postgres::BuildError),
	#[error(transparent)]
	SerdeJson(#[from] serde_json::Error),
	#[error(transparent)]
	SerdeYaml(#[from] serde_yaml::Error),
	#[error(transparent)]
	Url(#[from] url::ParseError),
	#[error(transparent)]
	Hyper(#[from] hyper::Error),

	#[error("metric '{0}' has no defined SQL variant")]
	MetricNotFound(String),
	#[error("metric '{metric}' requires server version >= {min_version}, found {found_version}")]
	ServerTooOld { metric: String, min_version: String, found_version: String },
	#[error("sink '{0}' is unavailable")]
	SinkUnavailable(String),
	#[error("Metrics error: {0}")]
	Metrics(String),
	#[error("Security violation: {0}")]
	Security(String),
	#[error("Validation failed for {field}: {reason}")]
	Validation { field: &'static str, reason: String },
	#[error("Envelope decryption failed: {0}")]
	Envelope(String),
	#[error("Configuration error: {0}")]
	Config(String),
}
#[cfg(feature = "metrics")]
impl<T> From<metrics::SetRecorderError<T>> for Error
where
	T: std::fmt::Display,
{
	fn from(value: metrics::SetRecorderError<T>) -> Self {
		Self::Metrics(value.to_string())
	}
}
