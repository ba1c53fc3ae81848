//! Emergency pause and per-endpoint size/recovery gating.
//!
//! Size and recovery are tracked as two independent gates, each with its own
//! accessor, rather than folded into one combined check — collapsing them
//! would silently hide the size gate whenever an endpoint wasn't also in
//! recovery.

// std
use std::path::{Path, PathBuf};
// self
use crate::{_prelude::*, endpoint::{descriptor::EndpointCache, types::Endpoint}};

/// Reason an endpoint's fetchers are currently shut down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateReason {
	/// The emergency trigger-file is present; the whole monitored set is paused.
	Emergency,
	/// The endpoint's approximate size is below its configured floor.
	Undersized,
	/// The endpoint is `only_if_master` and currently in recovery.
	RecoveryOnly,
}

/// Evaluates the emergency trigger-file.
pub struct EmergencyGate {
	trigger_file: Option<PathBuf>,
}
impl EmergencyGate {
	/// Build a gate watching `trigger_file`, if configured.
	pub fn new(trigger_file: Option<PathBuf>) -> Self {
		Self { trigger_file }
	}

	/// Whether the emergency pause is currently active.
	pub async fn is_active(&self) -> bool {
		match &self.trigger_file {
			Some(path) => path_exists(path).await,
			None => false,
		}
	}
}

async fn path_exists(path: &Path) -> bool {
	tokio::fs::metadata(path).await.is_ok()
}

/// Whether `endpoint`'s fetchers must be shut down this supervisor
/// iteration, and why. Size and recovery gates are
/// evaluated independently — an endpoint can be undersized without being
/// recovery-gated and vice versa.
pub async fn gate_reason(
	endpoint: &Endpoint,
	endpoint_cache: &EndpointCache,
	in_recovery: bool,
) -> Option<GateReason> {
	if endpoint_cache.is_undersized(&endpoint.unique_name).await {
		return Some(GateReason::Undersized);
	}

	if endpoint.only_if_master && in_recovery {
		return Some(GateReason::RecoveryOnly);
	}

	None
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn absent_trigger_file_means_not_paused() {
		let gate = EmergencyGate::new(None);

		assert!(!gate.is_active().await);
	}

	#[tokio::test]
	async fn present_trigger_file_pauses_everything() {
		let dir = tempfile::tempdir().unwrap();
		let trigger = dir.path().join("pause");

		tokio::fs::write(&trigger, b"").await.unwrap();

		let gate = EmergencyGate::new(Some(trigger));

		assert!(gate.is_active().await);
	}

	#[tokio::test]
	async fn size_and_recovery_gates_are_independent() {
		let cache = EndpointCache::new();
		let mut endpoint = crate::endpoint::types::Endpoint {
			unique_name: "db1".into(),
			original_name: None,
			host: "localhost".into(),
			port: 5432,
			dbname: "postgres".into(),
			user: "monitor".into(),
			password: crate::endpoint::types::Password::Plain("x".into()),
			ssl_required: false,
			db_type: crate::endpoint::types::DbType::Plain,
			metrics_primary: crate::endpoint::types::IntervalMap::new(),
			metrics_standby: None,
			custom_tags: HashMap::new(),
			host_config: Default::default(),
			only_if_master: true,
			is_enabled: true,
			is_superuser: false,
			min_size_bytes: 0,
			group: "default".into(),
		};

		cache.sync_endpoints(vec![endpoint.clone()]).await;

		assert_eq!(gate_reason(&endpoint, &cache, false).await, None);
		assert_eq!(gate_reason(&endpoint, &cache, true).await, Some(GateReason::RecoveryOnly));

		endpoint.only_if_master = false;
		assert_eq!(gate_reason(&endpoint, &cache, true).await, None);
	}
}
