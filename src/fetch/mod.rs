//! Fetch pipeline: client, message types, and the core fetch procedure.

pub mod client;
pub mod core;
pub mod message;
pub mod task;

pub use client::EndpointClient;
pub use core::{fetch_once, ChangeEventsState, MetricExecutor};
pub use message::{FetchMessage, Row, StoreMessage, Value};
pub use task::{ControlMessage, FetcherTask};
