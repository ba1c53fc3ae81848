//! Server descriptor cache: tracks monitored endpoints and per-endpoint
//! version/size/reachability state, serializing probes per endpoint.

// std
use std::collections::HashMap;
// crates.io
use tokio::sync::{Mutex, RwLock};
// self
use crate::{
	_prelude::*,
	endpoint::types::{Endpoint, ServerVersion},
};

/// Minimum interval between version probes for one endpoint.
pub const VERSION_PROBE_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Minimum interval between size probes for one endpoint.
pub const SIZE_PROBE_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Capability seam for probing a server's version/recovery/size. Production
/// code runs this over `fetch::client::EndpointClient`; tests substitute a
/// fake to avoid a real connection.
#[async_trait::async_trait]
pub trait VersionProbe: Send + Sync {
	/// Probe version, recovery state, extensions, and identity for `endpoint`.
	async fn probe_version(&self, endpoint: &Endpoint) -> Result<ServerVersion>;
	/// Probe the approximate total database size in bytes.
	async fn probe_size(&self, endpoint: &Endpoint) -> Result<u64>;
}

/// Per-endpoint cached state.
struct EndpointState {
	endpoint: Endpoint,
	version: RwLock<Option<ServerVersion>>,
	probe_lock: Mutex<()>,
	reachable: std::sync::atomic::AtomicBool,
	undersized: std::sync::atomic::AtomicBool,
}

/// Tracks the current snapshot of monitored endpoints and their probed state.
#[derive(Clone)]
pub struct EndpointCache {
	states: Arc<RwLock<HashMap<String, Arc<EndpointState>>>>,
}
impl EndpointCache {
	/// Construct an empty cache.
	pub fn new() -> Self {
		Self { states: Arc::new(RwLock::new(HashMap::new())) }
	}

	/// Replace the desired endpoint set, preserving probed state for
	/// endpoints that survive and dropping ones absent from `endpoints`.
	pub async fn sync_endpoints(&self, endpoints: Vec<Endpoint>) {
		let mut states = self.states.write().await;
		let mut next = HashMap::with_capacity(endpoints.len());

		for endpoint in endpoints {
			let name = endpoint.unique_name.clone();
			let existing = states.remove(&name);

			let state = match existing {
				Some(state) => Arc::new(EndpointState {
					endpoint,
					version: RwLock::new(state.version.read().await.clone()),
					probe_lock: Mutex::new(()),
					reachable: std::sync::atomic::AtomicBool::new(
						state.reachable.load(std::sync::atomic::Ordering::Relaxed),
					),
					undersized: std::sync::atomic::AtomicBool::new(
						state.undersized.load(std::sync::atomic::Ordering::Relaxed),
					),
				}),
				None => Arc::new(EndpointState {
					endpoint,
					version: RwLock::new(None),
					probe_lock: Mutex::new(()),
					reachable: std::sync::atomic::AtomicBool::new(true),
					undersized: std::sync::atomic::AtomicBool::new(false),
				}),
			};

			next.insert(name, state);
		}

		*states = next;
	}

	/// Current endpoint configurations, in no particular order.
	pub async fn endpoints(&self) -> Vec<Endpoint> {
		self.states.read().await.values().map(|s| s.endpoint.clone()).collect()
	}

	/// The endpoint configuration for one name, if still monitored.
	pub async fn endpoint(&self, name: &str) -> Option<Endpoint> {
		self.states.read().await.get(name).map(|s| s.endpoint.clone())
	}

	/// Whether this endpoint is currently flagged unreachable.
	pub async fn is_unreachable(&self, name: &str) -> bool {
		match self.states.read().await.get(name) {
			Some(state) => !state.reachable.load(std::sync::atomic::Ordering::Relaxed),
			None => false,
		}
	}

	/// Record the outcome of a fetch for reachability tracking: a
	/// connection-refusal-shaped error sets unreachable, a success clears it.
	pub async fn record_fetch_outcome(&self, name: &str, connection_refused: bool, success: bool) {
		if let Some(state) = self.states.read().await.get(name) {
			if success {
				state.reachable.store(true, std::sync::atomic::Ordering::Relaxed);
			} else if connection_refused {
				state.reachable.store(false, std::sync::atomic::Ordering::Relaxed);
			}
		}
	}

	/// Whether this endpoint is gated off for being undersized.
	pub async fn is_undersized(&self, name: &str) -> bool {
		match self.states.read().await.get(name) {
			Some(state) => state.undersized.load(std::sync::atomic::Ordering::Relaxed),
			None => false,
		}
	}

	/// The cached version record, if one has ever been probed.
	pub async fn cached_version(&self, name: &str) -> Option<ServerVersion> {
		match self.states.read().await.get(name) {
			Some(state) => state.version.read().await.clone(),
			None => None,
		}
	}

	/// Refresh the version record if stale, serialized per endpoint so only
	/// one probe runs concurrently.
	pub async fn ensure_version(
		&self,
		name: &str,
		prober: &dyn VersionProbe,
		now: DateTime<Utc>,
	) -> Result<ServerVersion> {
		let state = {
			let states = self.states.read().await;

			states.get(name).cloned().ok_or_else(|| Error::Validation {
				field: "endpoint",
				reason: format!("'{name}' is not monitored"),
			})?
		};
		let _guard = state.probe_lock.lock().await;
		let stale = {
			let cached = state.version.read().await;

			match cached.as_ref() {
				Some(v) => now.signed_duration_since(v.checked_at)
					> chrono::TimeDelta::from_std(VERSION_PROBE_INTERVAL).unwrap(),
				None => true,
			}
		};

		if !stale {
			return Ok(state.version.read().await.clone().expect("checked above"));
		}

		let probed = prober.probe_version(&state.endpoint).await?;

		*state.version.write().await = Some(probed.clone());

		Ok(probed)
	}

	/// Refresh the approximate size if stale and gate the endpoint when it
	/// falls below the configured floor.
	pub async fn ensure_size(
		&self,
		name: &str,
		prober: &dyn VersionProbe,
		now: DateTime<Utc>,
	) -> Result<()> {
		let state = {
			let states = self.states.read().await;

			states.get(name).cloned().ok_or_else(|| Error::Validation {
				field: "endpoint",
				reason: format!("'{name}' is not monitored"),
			})?
		};

		if state.endpoint.min_size_bytes == 0 {
			state.undersized.store(false, std::sync::atomic::Ordering::Relaxed);

			return Ok(());
		}

		let stale = {
			let cached = state.version.read().await;

			match cached.as_ref().and_then(|v| v.size_checked_at) {
				Some(checked) => now.signed_duration_since(checked)
					> chrono::TimeDelta::from_std(SIZE_PROBE_INTERVAL).unwrap(),
				None => true,
			}
		};

		if !stale {
			return Ok(());
		}

		let size = prober.probe_size(&state.endpoint).await?;
		let undersized = size < state.endpoint.min_size_bytes;

		state.undersized.store(undersized, std::sync::atomic::Ordering::Relaxed);

		let mut cached = state.version.write().await;

		if let Some(v) = cached.as_mut() {
			v.approx_size_bytes = size;
			v.size_checked_at = Some(now);
		}

		Ok(())
	}
}
impl Default for EndpointCache {
	fn default() -> Self {
		Self::new()
	}
}

/// Classifies an error message as "connection refused"-shaped.
pub fn looks_like_connection_refused(message: &str) -> bool {
	let lower = message.to_ascii_lowercase();

	lower.contains("connection refused")
		|| lower.contains("could not connect")
		|| lower.contains("connection timed out")
		|| lower.contains("no route to host")
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::endpoint::types::{DbType, HostConfig, IntervalMap, Password};
	use std::sync::atomic::{AtomicU32, Ordering};

	fn sample_endpoint(name: &str) -> Endpoint {
		Endpoint {
			unique_name: name.into(),
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

	struct CountingProbe {
		calls: AtomicU32,
	}
	#[async_trait::async_trait]
	impl VersionProbe for CountingProbe {
		async fn probe_version(&self, _endpoint: &Endpoint) -> Result<ServerVersion> {
			self.calls.fetch_add(1, Ordering::SeqCst);

			Ok(ServerVersion {
				version_num: 140004,
				version_str: "14.4".into(),
				is_in_recovery: false,
				real_dbname: "postgres".into(),
				system_identifier: "1".into(),
				is_superuser: false,
				extensions: HashMap::new(),
				exec_env: String::new(),
				approx_size_bytes: 0,
				checked_at: Utc::now(),
				size_checked_at: None,
			})
		}

		async fn probe_size(&self, _endpoint: &Endpoint) -> Result<u64> {
			Ok(1024)
		}
	}

	#[tokio::test]
	async fn probe_is_not_repeated_within_the_refresh_window() {
		let cache = EndpointCache::new();

		cache.sync_endpoints(vec![sample_endpoint("db1")]).await;

		let prober = CountingProbe { calls: AtomicU32::new(0) };
		let now = Utc::now();

		cache.ensure_version("db1", &prober, now).await.unwrap();
		cache.ensure_version("db1", &prober, now + chrono::TimeDelta::seconds(30)).await.unwrap();

		assert_eq!(prober.calls.load(Ordering::SeqCst), 1);

		cache
			.ensure_version("db1", &prober, now + chrono::TimeDelta::seconds(301))
			.await
			.unwrap();

		assert_eq!(prober.calls.load(Ordering::SeqCst), 2);
	}

	#[tokio::test]
	async fn removed_endpoints_drop_from_the_cache() {
		let cache = EndpointCache::new();

		cache.sync_endpoints(vec![sample_endpoint("db1"), sample_endpoint("db2")]).await;
		cache.sync_endpoints(vec![sample_endpoint("db1")]).await;

		assert!(cache.endpoint("db1").await.is_some());
		assert!(cache.endpoint("db2").await.is_none());
	}

	#[tokio::test]
	async fn reachability_tracks_fetch_outcomes() {
		let cache = EndpointCache::new();

		cache.sync_endpoints(vec![sample_endpoint("db1")]).await;
		cache.record_fetch_outcome("db1", true, false).await;
		assert!(cache.is_unreachable("db1").await);

		cache.record_fetch_outcome("db1", false, true).await;
		assert!(!cache.is_unreachable("db1").await);
	}
}
