//! Fetch inputs and store outputs.

// crates.io
use serde::{Deserialize, Serialize};
// self
use crate::{_prelude::*, endpoint::types::DbType};

/// A single cell value. Three shapes plus a null marker — downstream sinks
/// convert per-sink.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum Value {
	/// Signed integer value.
	Int(i64),
	/// Floating-point value.
	Float(f64),
	/// Text value.
	Text(String),
	/// SQL NULL.
	Null,
}
impl Value {
	/// The value as `f64`, for sinks that only carry numeric measurements
	/// (e.g. the graphing sink, which skips non-numeric columns with a log).
	pub fn as_f64(&self) -> Option<f64> {
		match self {
			Value::Int(v) => Some(*v as f64),
			Value::Float(v) => Some(*v),
			Value::Text(_) | Value::Null => None,
		}
	}

	/// Whether this value is `Null` or an empty text value.
	pub fn is_null_or_empty(&self) -> bool {
		matches!(self, Value::Null) || matches!(self, Value::Text(s) if s.is_empty())
	}

	/// Convert to a `serde_json::Value`, used by the JSON and columnar sinks.
	pub fn to_json(&self) -> serde_json::Value {
		match self {
			Value::Int(v) => serde_json::Value::from(*v),
			Value::Float(v) => serde_json::Value::from(*v),
			Value::Text(v) => serde_json::Value::from(v.clone()),
			Value::Null => serde_json::Value::Null,
		}
	}
}

/// One ordered mapping from column name to value. A required `epoch_ns`
/// column carries nanosecond epoch; columns named `tag_*` are tag dimensions.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Row {
	/// Columns in their original query order.
	pub columns: Vec<(String, Value)>,
}
impl Row {
	/// Build a row from an ordered vector of `(name, value)` pairs.
	pub fn new(columns: Vec<(String, Value)>) -> Self {
		Self { columns }
	}

	/// Look up a column by name.
	pub fn get(&self, name: &str) -> Option<&Value> {
		self.columns.iter().find(|(col, _)| col == name).map(|(_, v)| v)
	}

	/// Nanosecond epoch carried by the required `epoch_ns` column, if present.
	pub fn epoch_ns(&self) -> Option<i64> {
		match self.get("epoch_ns") {
			Some(Value::Int(v)) => Some(*v),
			_ => None,
		}
	}

	/// Iterate over columns whose name begins with `tag_`.
	pub fn tag_columns(&self) -> impl Iterator<Item = (&str, &Value)> {
		self.columns
			.iter()
			.filter(|(name, _)| name.starts_with("tag_"))
			.map(|(name, value)| (name.as_str(), value))
	}

	/// Iterate over non-tag, non-`epoch_ns` value columns.
	pub fn value_columns(&self) -> impl Iterator<Item = (&str, &Value)> {
		self.columns
			.iter()
			.filter(|(name, _)| name != "epoch_ns" && !name.starts_with("tag_"))
			.map(|(name, value)| (name.as_str(), value))
	}

	/// Rename a column in place, preserving its position.
	pub fn rename_column(&mut self, from: &str, to: &str) {
		for (name, _) in self.columns.iter_mut() {
			if name == from {
				*name = to.to_string();
			}
		}
	}

	/// Insert or overwrite a column at the end of the row.
	pub fn set(&mut self, name: impl Into<String>, value: Value) {
		let name = name.into();

		if let Some(existing) = self.columns.iter_mut().find(|(col, _)| *col == name) {
			existing.1 = value;
		} else {
			self.columns.push((name, value));
		}
	}
}

/// Inputs to a single fetch: what to run, where, and how.
#[derive(Clone, Debug)]
pub struct FetchMessage {
	/// Endpoint's unique (post-discovery) name.
	pub endpoint_name: String,
	/// Endpoint's original (pre-discovery) name.
	pub original_name: String,
	/// Metric name to fetch.
	pub metric_name: String,
	/// Database-type tag.
	pub db_type: DbType,
	/// Fetch interval in seconds.
	pub interval_secs: u64,
	/// Statement-timeout override, if any.
	pub statement_timeout: Option<Duration>,
}

/// Outputs of a single fetch: a batch of rows plus routing metadata.
#[derive(Clone, Debug)]
pub struct StoreMessage {
	/// Endpoint's unique name.
	pub endpoint_name: String,
	/// Metric name (possibly remapped via `metric_storage_name`).
	pub metric_name: String,
	/// Database-type tag.
	pub db_type: DbType,
	/// Custom tags configured on the endpoint.
	pub custom_tags: HashMap<String, String>,
	/// Real database name as reported by the server.
	pub real_dbname: String,
	/// System identifier as reported by the server.
	pub system_identifier: String,
	/// The fetched rows.
	pub rows: Vec<Row>,
}
impl StoreMessage {
	/// Total number of rows, used for drop accounting.
	pub fn point_count(&self) -> usize {
		self.rows.len()
	}
}
