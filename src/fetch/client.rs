//! Thin `tokio_postgres` wrapper used to execute resolved metric SQL
//! against one endpoint's connection pool.

// crates.io
use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use tokio_postgres::{types::Type, Config, NoTls};
// self
use crate::{
	_prelude::*,
	endpoint::descriptor::VersionProbe,
	endpoint::types::{Endpoint, ServerVersion},
	fetch::message::{Row, Value},
};

/// Statement timeout applied to the version/size probe queries themselves.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

const VERSION_PROBE_SQL: &str = "select \
	current_setting('server_version_num')::int8 as version_num, \
	version() as version_str, \
	pg_is_in_recovery() as is_in_recovery, \
	current_database() as real_dbname, \
	(select system_identifier::text from pg_control_system()) as system_identifier, \
	(select rolsuper from pg_roles where rolname = current_user) as is_superuser";

const EXTENSIONS_PROBE_SQL: &str = "select extname, extversion from pg_extension";

const SIZE_PROBE_SQL: &str = "select pg_database_size(current_database()) as size";

/// A pooled connection to one monitored endpoint.
///
/// Idle/open caps shrink while the endpoint is dormant and are restored when
/// reactivated; only the supervisor mutates the pool cap.
#[derive(Clone)]
pub struct EndpointClient {
	pool: Pool,
}
impl EndpointClient {
	/// Build a pooled client for the given endpoint, decrypting its password
	/// with `key` when it is envelope-encrypted.
	pub fn connect(endpoint: &Endpoint, key: &[u8]) -> Result<Self> {
		let password = endpoint.plaintext_password(key)?;
		let mut config = Config::new();

		config
			.host(&endpoint.host)
			.port(endpoint.port)
			.dbname(&endpoint.dbname)
			.user(&endpoint.user)
			.password(password);

		let manager = Manager::from_config(
			config,
			NoTls,
			ManagerConfig { recycling_method: RecyclingMethod::Fast },
		);
		let pool = Pool::builder(manager).max_size(4).build()?;

		Ok(Self { pool })
	}

	/// Shrink the idle/open pool caps while this endpoint is dormant.
	pub fn shrink(&self) {
		self.pool.resize(1);
	}

	/// Restore the pool caps when this endpoint is reactivated.
	pub fn restore(&self, max_size: usize) {
		self.pool.resize(max_size);
	}

	/// Execute `sql` under the given statement timeout and decode the result
	/// into the crate's own `Row` representation.
	pub async fn query_rows(&self, sql: &str, timeout: Duration) -> Result<Vec<Row>> {
		let client = self.pool.get().await?;

		client.batch_execute(&format!("set statement_timeout = {}", timeout.as_millis())).await?;

		let rows = client.query(sql, &[]).await?;

		Ok(rows.iter().map(decode_row).collect())
	}
}
#[async_trait]
impl VersionProbe for EndpointClient {
	async fn probe_version(&self, _endpoint: &Endpoint) -> Result<ServerVersion> {
		let row = self
			.query_rows(VERSION_PROBE_SQL, PROBE_TIMEOUT)
			.await?
			.into_iter()
			.next()
			.ok_or_else(|| Error::Validation { field: "probe_version", reason: "server returned no rows".into() })?;

		let version_num = match row.get("version_num") {
			Some(Value::Int(v)) => *v as u32,
			_ => 0,
		};
		let version_str = match row.get("version_str") {
			Some(Value::Text(v)) => v.clone(),
			_ => String::new(),
		};
		let is_in_recovery = matches!(row.get("is_in_recovery"), Some(Value::Int(1)));
		let real_dbname = match row.get("real_dbname") {
			Some(Value::Text(v)) => v.clone(),
			_ => String::new(),
		};
		let system_identifier = match row.get("system_identifier") {
			Some(Value::Text(v)) => v.clone(),
			_ => String::new(),
		};
		let is_superuser = matches!(row.get("is_superuser"), Some(Value::Int(1)));

		let extensions = self
			.query_rows(EXTENSIONS_PROBE_SQL, PROBE_TIMEOUT)
			.await?
			.into_iter()
			.filter_map(|row| match (row.get("extname"), row.get("extversion")) {
				(Some(Value::Text(name)), Some(Value::Text(version))) => Some((name.clone(), version.clone())),
				_ => None,
			})
			.collect();

		Ok(ServerVersion {
			version_num,
			version_str,
			is_in_recovery,
			real_dbname,
			system_identifier,
			is_superuser,
			extensions,
			// Managed-vs-self-hosted detection depends on cloud-provider-specific
			// extensions/settings; left for a future probe heuristic.
			exec_env: String::new(),
			approx_size_bytes: 0,
			checked_at: Utc::now(),
			size_checked_at: None,
		})
	}

	async fn probe_size(&self, _endpoint: &Endpoint) -> Result<u64> {
		let size = self
			.query_rows(SIZE_PROBE_SQL, PROBE_TIMEOUT)
			.await?
			.into_iter()
			.next()
			.and_then(|row| row.get("size").cloned());

		match size {
			Some(Value::Int(n)) => Ok(n as u64),
			_ => Ok(0),
		}
	}
}

fn decode_row(row: &tokio_postgres::Row) -> Row {
	let columns = row
		.columns()
		.iter()
		.enumerate()
		.map(|(i, col)| (col.name().to_string(), decode_value(row, i, col.type_())))
		.collect();

	Row::new(columns)
}

fn decode_value(row: &tokio_postgres::Row, index: usize, ty: &Type) -> Value {
	match *ty {
		Type::INT2 => row.try_get::<_, Option<i16>>(index).ok().flatten().map_or(Value::Null, |v| Value::Int(v as i64)),
		Type::INT4 => row.try_get::<_, Option<i32>>(index).ok().flatten().map_or(Value::Null, |v| Value::Int(v as i64)),
		Type::INT8 => row.try_get::<_, Option<i64>>(index).ok().flatten().map_or(Value::Null, Value::Int),
		Type::FLOAT4 => row.try_get::<_, Option<f32>>(index).ok().flatten().map_or(Value::Null, |v| Value::Float(v as f64)),
		Type::FLOAT8 => row.try_get::<_, Option<f64>>(index).ok().flatten().map_or(Value::Null, Value::Float),
		Type::BOOL => row
			.try_get::<_, Option<bool>>(index)
			.ok()
			.flatten()
			.map_or(Value::Null, |v| Value::Int(v as i64)),
		Type::TIMESTAMP | Type::TIMESTAMPTZ => row
			.try_get::<_, Option<chrono::DateTime<Utc>>>(index)
			.ok()
			.flatten()
			.map_or(Value::Null, |v| Value::Int(v.timestamp_nanos_opt().unwrap_or_default())),
		_ => row.try_get::<_, Option<String>>(index).ok().flatten().map_or(Value::Null, Value::Text),
	}
}
