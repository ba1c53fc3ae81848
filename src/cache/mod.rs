//! Instance-level row caching.

pub mod instance;

pub use instance::{InstanceCache, InstanceKey};
