//! Control-database metric definition source.
//!
//! Parses the same logical shape as the file tree, sourced from rows in a
//! `pgwatch3.metric` control table instead of a directory. The control
//! database is itself Postgres-family, so this reuses the crate's
//! `tokio_postgres` stack (see `fetch::client`).

// self
use crate::{
	_prelude::*,
	metrics_def::types::{ColumnAttrs, MetricAttrs, MetricDefinition, MetricVariant},
};

/// Loads metric definitions from a control database table.
#[derive(Clone)]
pub struct ControlDbSource {
	pool: deadpool_postgres::Pool,
}
impl ControlDbSource {
	/// Construct a source backed by the given connection pool.
	pub fn new(pool: deadpool_postgres::Pool) -> Self {
		Self { pool }
	}
}
#[async_trait::async_trait]
impl super::MetricSource for ControlDbSource {
	async fn load(&self) -> Result<Vec<MetricDefinition>> {
		let client = self.pool.get().await?;
		let rows = client
			.query(
				"select m_name, m_pg_version_from, m_sql, m_sql_su, m_master_only, \
				 m_standby_only, m_column_attrs, m_metric_attrs, m_is_helper \
				 from pgwatch3.metric order by m_name, m_pg_version_from",
				&[],
			)
			.await?;
		let mut by_name: HashMap<String, MetricDefinition> = HashMap::new();

		for row in rows {
			let name: String = row.try_get("m_name")?;
			let min_version: i32 = row.try_get("m_pg_version_from")?;
			let sql: Option<String> = row.try_get("m_sql")?;
			let sql_superuser: Option<String> = row.try_get("m_sql_su")?;
			let master_only: bool = row.try_get("m_master_only")?;
			let standby_only: bool = row.try_get("m_standby_only")?;
			let calls_helper_functions: bool = row.try_get("m_is_helper")?;
			let column_attrs: Option<serde_json::Value> = row.try_get("m_column_attrs")?;
			let metric_attrs: Option<serde_json::Value> = row.try_get("m_metric_attrs")?;
			let column_attrs = column_attrs
				.map(serde_json::from_value::<ColumnAttrs>)
				.transpose()?
				.unwrap_or_default();
			let metric_attrs = metric_attrs
				.map(serde_json::from_value::<MetricAttrs>)
				.transpose()?
				.unwrap_or_default();

			let entry =
				by_name.entry(name.clone()).or_insert_with(|| MetricDefinition { name, variants: Vec::new() });

			entry.push_variant(MetricVariant {
				min_version: min_version as u32,
				sql,
				sql_superuser,
				master_only,
				standby_only,
				column_attrs,
				metric_attrs,
				calls_helper_functions,
			});
		}

		Ok(by_name.into_values().collect())
	}
}
