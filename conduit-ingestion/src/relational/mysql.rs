use async_stream::try_stream;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use conduit_types::{Batch, Column, ColumnType, ForeignKey, Index, Record, TableSchema, Value};
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, Opts, OptsBuilder, Pool, Row};
use tracing::{debug, info, instrument, warn};

use crate::error::SourceError;
use crate::relational::{choose_incremental_column, optional_str, optional_u16, require_str};
use crate::source::{BatchStream, SourceAdapter, SourceConfig};

/// `relational_db` source kind, MySQL-like.
pub struct MySqlSource {
    pool: Option<Pool>,
    database: String,
}

impl Default for MySqlSource {
    fn default() -> Self {
        Self {
            pool: None,
            database: String::new(),
        }
    }
}

impl MySqlSource {
    async fn conn(&self) -> Result<Conn, SourceError> {
        let pool = self
            .pool
            .as_ref()
            .ok_or_else(|| SourceError::Connection("not connected".into()))?;
        pool.get_conn()
            .await
            .map_err(|e| SourceError::Connection(e.to_string()))
    }

    fn map_mysql_type(data_type: &str) -> ColumnType {
        match data_type {
            "tinyint" | "smallint" => ColumnType::Int16,
            "int" | "mediumint" => ColumnType::Int32,
            "bigint" => ColumnType::Int64,
            "float" => ColumnType::Float32,
            "double" => ColumnType::Float64,
            "decimal" | "numeric" => ColumnType::Decimal {
                precision: 38,
                scale: 10,
            },
            "tinyint(1)" | "bool" | "boolean" => ColumnType::Bool,
            "blob" | "varbinary" | "binary" => ColumnType::Bytes,
            "date" => ColumnType::Date,
            "time" => ColumnType::Time,
            "datetime" | "timestamp" => ColumnType::Timestamp,
            "json" => ColumnType::Json,
            "varchar" | "char" => ColumnType::String,
            "text" | "mediumtext" | "longtext" => ColumnType::Text,
            other => {
                warn!(mysql_type = other, "unmapped mysql type, falling back to text");
                ColumnType::Text
            }
        }
    }

    fn row_to_record(row: Row, columns: &[Column]) -> Record {
        let mut record = Record::new();
        for (idx, col) in columns.iter().enumerate() {
            let value = match &col.ty {
                ColumnType::Int16 | ColumnType::Int32 | ColumnType::Int64 => row
                    .as_ref(idx)
                    .and_then(|v| mysql_async::from_value_opt::<i64>(v.clone()).ok())
                    .map(Value::Int)
                    .unwrap_or(Value::Null),
                ColumnType::Float32 | ColumnType::Float64 => row
                    .as_ref(idx)
                    .and_then(|v| mysql_async::from_value_opt::<f64>(v.clone()).ok())
                    .map(Value::Float)
                    .unwrap_or(Value::Null),
                ColumnType::Bool => row
                    .as_ref(idx)
                    .and_then(|v| mysql_async::from_value_opt::<i64>(v.clone()).ok())
                    .map(|v| Value::Bool(v != 0))
                    .unwrap_or(Value::Null),
                ColumnType::Timestamp => row
                    .as_ref(idx)
                    .and_then(|v| mysql_async::from_value_opt::<NaiveDateTime>(v.clone()).ok())
                    .map(|v| Value::String(DateTime::<Utc>::from_naive_utc_and_offset(v, Utc).to_rfc3339()))
                    .unwrap_or(Value::Null),
                ColumnType::Date => row
                    .as_ref(idx)
                    .and_then(|v| mysql_async::from_value_opt::<NaiveDate>(v.clone()).ok())
                    .map(|v| Value::String(v.to_string()))
                    .unwrap_or(Value::Null),
                _ => row
                    .as_ref(idx)
                    .and_then(|v| mysql_async::from_value_opt::<String>(v.clone()).ok())
                    .map(Value::String)
                    .unwrap_or(Value::Null),
            };
            record.insert(col.name.clone(), value);
        }
        record
    }
}

#[async_trait]
impl SourceAdapter for MySqlSource {
    fn kind(&self) -> &'static str {
        "mysql"
    }

    #[instrument(skip(self, config))]
    async fn connect(&mut self, config: &SourceConfig) -> Result<(), SourceError> {
        let host = require_str(config, "host")?;
        let database = require_str(config, "database")?;
        let username = require_str(config, "username")?;
        let password = optional_str(config, "password").unwrap_or("");
        let port = optional_u16(config, "port", 3306);

        let opts: Opts = OptsBuilder::default()
            .ip_or_hostname(host)
            .tcp_port(port)
            .db_name(Some(database))
            .user(Some(username))
            .pass(Some(password))
            .into();

        let pool = Pool::new(opts);
        // Validate eagerly so connect() fails fast per spec.md I1/§4.2.
        pool.get_conn()
            .await
            .map_err(|e| SourceError::Connection(e.to_string()))?;

        info!(host, database, "connected to mysql source");
        self.pool = Some(pool);
        self.database = database.to_string();
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(pool) = self.pool.take() {
            let _ = pool.disconnect().await;
        }
    }

    #[instrument(skip(self))]
    async fn list_tables(&mut self) -> Result<Vec<String>, SourceError> {
        let mut conn = self.conn().await?;
        let tables: Vec<String> = conn
            .query(format!(
                "SELECT table_name FROM information_schema.tables \
                 WHERE table_schema = '{}' AND table_type = 'BASE TABLE'",
                self.database
            ))
            .await
            .map_err(|e| SourceError::Connection(e.to_string()))?;
        Ok(tables)
    }

    #[instrument(skip(self))]
    async fn get_schema(&mut self, table_id: &str) -> Result<TableSchema, SourceError> {
        let mut conn = self.conn().await?;
        let rows: Vec<(String, String, String, Option<String>)> = conn
            .query(format!(
                "SELECT column_name, data_type, is_nullable, column_default \
                 FROM information_schema.columns \
                 WHERE table_schema = '{}' AND table_name = '{table_id}' \
                 ORDER BY ordinal_position",
                self.database
            ))
            .await
            .map_err(|e| SourceError::Schema {
                table: table_id.to_string(),
                message: e.to_string(),
            })?;

        let columns = rows
            .into_iter()
            .map(|(name, data_type, nullable, default_expr)| Column {
                ty: Self::map_mysql_type(&data_type),
                name,
                nullable: nullable == "YES",
                length: None,
                default_expr,
                full_type: Some(data_type),
            })
            .collect();

        let mut schema = TableSchema::new(columns);
        schema.primary_key = self.get_primary_key_columns(table_id).await.unwrap_or_default();
        debug!(table = table_id, columns = schema.columns.len(), "fetched schema");
        Ok(schema)
    }

    fn read_data(&self, table_id: &str, batch_size: usize) -> BatchStream {
        let pool = self.pool.clone();
        let table_id = table_id.to_string();
        Box::pin(try_stream! {
            let pool = pool.ok_or_else(|| SourceError::Connection("not connected".into()))?;
            let mut conn = pool.get_conn().await
                .map_err(|e| SourceError::Transient { table: table_id.clone(), message: e.to_string() })?;
            let rows: Vec<Row> = conn
                .query(format!("SELECT * FROM `{table_id}`"))
                .await
                .map_err(|e| SourceError::Transient { table: table_id.clone(), message: e.to_string() })?;

            let columns: Vec<Column> = rows
                .first()
                .map(|r| {
                    r.columns_ref()
                        .iter()
                        .map(|c| Column::new(c.name_str().to_string(), ColumnType::Text, true))
                        .collect()
                })
                .unwrap_or_default();

            for chunk in rows.chunks(batch_size.max(1)) {
                let batch: Batch = chunk
                    .iter()
                    .map(|row| Self::row_to_record(row.clone(), &columns))
                    .collect();
                yield batch;
            }
        })
    }

    fn read_incremental(
        &self,
        table_id: &str,
        watermark: DateTime<Utc>,
        batch_size: usize,
    ) -> BatchStream {
        let pool = self.pool.clone();
        let table_id = table_id.to_string();
        let database = self.database.clone();
        Box::pin(try_stream! {
            let pool = pool.ok_or_else(|| SourceError::Connection("not connected".into()))?;
            let mut conn = pool.get_conn().await
                .map_err(|e| SourceError::Transient { table: table_id.clone(), message: e.to_string() })?;

            let col_rows: Vec<(String, String)> = conn
                .query(format!(
                    "SELECT column_name, data_type FROM information_schema.columns \
                     WHERE table_schema = '{database}' AND table_name = '{table_id}' \
                     ORDER BY ordinal_position"
                ))
                .await
                .map_err(|e| SourceError::Schema { table: table_id.clone(), message: e.to_string() })?;
            let columns: Vec<Column> = col_rows
                .into_iter()
                .map(|(name, dt)| Column::new(name, Self::map_mysql_type(&dt), true))
                .collect();

            let query = match choose_incremental_column(&[], &columns) {
                Some(col) => format!(
                    "SELECT * FROM `{table_id}` WHERE `{col}` > '{}'",
                    watermark.naive_utc()
                ),
                None => format!("SELECT * FROM `{table_id}`"),
            };

            let rows: Vec<Row> = conn
                .query(query)
                .await
                .map_err(|e| SourceError::Transient { table: table_id.clone(), message: e.to_string() })?;

            for chunk in rows.chunks(batch_size.max(1)) {
                let batch: Batch = chunk
                    .iter()
                    .map(|row| Self::row_to_record(row.clone(), &columns))
                    .collect();
                yield batch;
            }
        })
    }

    async fn get_primary_key_columns(&mut self, table_id: &str) -> Result<Vec<String>, SourceError> {
        let mut conn = self.conn().await?;
        let rows: Vec<String> = conn
            .query(format!(
                "SELECT column_name FROM information_schema.key_column_usage \
                 WHERE table_schema = '{}' AND table_name = '{table_id}' \
                 AND constraint_name = 'PRIMARY' ORDER BY ordinal_position",
                self.database
            ))
            .await
            .map_err(|e| SourceError::Transient {
                table: table_id.to_string(),
                message: e.to_string(),
            })?;
        Ok(rows)
    }

    async fn get_foreign_keys(&mut self, _table_id: &str) -> Result<Vec<ForeignKey>, SourceError> {
        Ok(Vec::new())
    }

    async fn get_unique_constraints(&mut self, _table_id: &str) -> Result<Vec<Index>, SourceError> {
        Ok(Vec::new())
    }

    async fn get_indexes(&mut self, _table_id: &str) -> Result<Vec<Index>, SourceError> {
        Ok(Vec::new())
    }
}
