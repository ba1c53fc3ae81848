//! Endpoint configuration, server descriptor state, and the version/size
//! probes that keep it current.

pub mod descriptor;
pub mod types;

pub use descriptor::{
	looks_like_connection_refused, EndpointCache, VersionProbe, SIZE_PROBE_INTERVAL,
	VERSION_PROBE_INTERVAL,
};
pub use types::{
	compare_versions, DbType, Endpoint, HostConfig, HostMetricWindows, IntervalMap, Password,
	ServerVersion,
};
