use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conduit_types::{Batch, Column, ColumnType, ForeignKey, Index, Record, TableSchema, Value};
use tiberius::{AuthMethod, Client, Config, Row};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info, instrument, warn};

use crate::error::SourceError;
use crate::relational::{choose_incremental_column, optional_str, require_str};
use crate::source::{BatchStream, SourceAdapter, SourceConfig};

type MsSqlClient = Arc<Mutex<Client<Compat<TcpStream>>>>;

/// `relational_db` source kind, SQL-Server-like. Empty `username`/`password`
/// selects trusted (Windows/Kerberos) auth per spec.md §6.
///
/// tiberius's `Client` requires `&mut self` for every query, so the
/// connection is kept behind a `tokio::sync::Mutex` rather than the bare
/// `Arc` the Postgres/MySQL adapters use — `read_data`/`read_incremental`
/// still take `&self` per the `SourceAdapter` contract.
pub struct MsSqlSource {
    client: Option<MsSqlClient>,
}

impl Default for MsSqlSource {
    fn default() -> Self {
        Self { client: None }
    }
}

impl MsSqlSource {
    fn map_mssql_type(type_name: &str) -> ColumnType {
        match type_name {
            "tinyint" | "smallint" => ColumnType::Int16,
            "int" => ColumnType::Int32,
            "bigint" => ColumnType::Int64,
            "real" => ColumnType::Float32,
            "float" => ColumnType::Float64,
            "decimal" | "numeric" | "money" => ColumnType::Decimal {
                precision: 38,
                scale: 10,
            },
            "bit" => ColumnType::Bool,
            "varbinary" | "binary" | "image" => ColumnType::Bytes,
            "date" => ColumnType::Date,
            "time" => ColumnType::Time,
            "datetime" | "datetime2" | "smalldatetime" => ColumnType::Timestamp,
            "uniqueidentifier" => ColumnType::Uuid,
            "varchar" | "char" | "nvarchar" | "nchar" => ColumnType::String,
            "text" | "ntext" => ColumnType::Text,
            other => {
                warn!(mssql_type = other, "unmapped SQL Server type, falling back to text");
                ColumnType::Text
            }
        }
    }

    fn row_to_record(row: &Row, columns: &[Column]) -> Record {
        let mut record = Record::new();
        for (idx, col) in columns.iter().enumerate() {
            let value = match &col.ty {
                ColumnType::Int16 => row.get::<i16, _>(idx).map(|v| Value::Int(v as i64)),
                ColumnType::Int32 => row.get::<i32, _>(idx).map(|v| Value::Int(v as i64)),
                ColumnType::Int64 => row.get::<i64, _>(idx).map(Value::Int),
                ColumnType::Float32 => row.get::<f32, _>(idx).map(|v| Value::Float(v as f64)),
                ColumnType::Float64 => row.get::<f64, _>(idx).map(Value::Float),
                ColumnType::Bool => row.get::<bool, _>(idx).map(Value::Bool),
                _ => row.get::<&str, _>(idx).map(|v| Value::String(v.to_string())),
            };
            record.insert(col.name.clone(), value.unwrap_or(Value::Null));
        }
        record
    }

    async fn fetch_columns(
        client: &MsSqlClient,
        schema: &str,
        table: &str,
    ) -> Result<Vec<Column>, SourceError> {
        let mut guard = client.lock().await;
        let stream = guard
            .query(
                "SELECT c.name, t.name, c.is_nullable, c.max_length \
                 FROM sys.columns c \
                 JOIN sys.types t ON t.user_type_id = c.user_type_id \
                 JOIN sys.tables tb ON tb.object_id = c.object_id \
                 JOIN sys.schemas s ON s.schema_id = tb.schema_id \
                 WHERE s.name = @P1 AND tb.name = @P2 ORDER BY c.column_id",
                &[&schema, &table],
            )
            .await
            .map_err(|e| SourceError::Schema {
                table: format!("{schema}.{table}"),
                message: e.to_string(),
            })?;
        let rows = stream.into_first_result().await.map_err(|e| SourceError::Schema {
            table: format!("{schema}.{table}"),
            message: e.to_string(),
        })?;
        Ok(rows
            .iter()
            .map(|row| {
                let name: &str = row.get(0).unwrap_or_default();
                let type_name: &str = row.get(1).unwrap_or_default();
                let nullable: bool = row.get(2).unwrap_or(true);
                let max_length: i16 = row.get(3).unwrap_or(-1);
                Column {
                    name: name.to_string(),
                    ty: Self::map_mssql_type(type_name),
                    nullable,
                    length: if max_length > 0 { Some(max_length as u32) } else { None },
                    default_expr: None,
                    full_type: Some(type_name.to_string()),
                }
            })
            .collect())
    }
}

#[async_trait]
impl SourceAdapter for MsSqlSource {
    fn kind(&self) -> &'static str {
        "mssql"
    }

    #[instrument(skip(self, config))]
    async fn connect(&mut self, config: &SourceConfig) -> Result<(), SourceError> {
        let server = require_str(config, "server")?;
        let username = optional_str(config, "username").unwrap_or("");
        let password = optional_str(config, "password").unwrap_or("");

        let mut tiberius_config = Config::new();
        tiberius_config.host(server);
        tiberius_config.trust_cert();
        if username.is_empty() && password.is_empty() {
            tiberius_config.authentication(AuthMethod::Integrated);
        } else {
            tiberius_config.authentication(AuthMethod::sql_server(username, password));
        }

        let tcp = TcpStream::connect(tiberius_config.get_addr())
            .await
            .map_err(|e| SourceError::Connection(e.to_string()))?;
        tcp.set_nodelay(true)
            .map_err(|e| SourceError::Connection(e.to_string()))?;

        let client = Client::connect(tiberius_config, tcp.compat_write())
            .await
            .map_err(|e| SourceError::Connection(e.to_string()))?;

        info!(server, "connected to SQL Server source");
        self.client = Some(Arc::new(Mutex::new(client)));
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.client = None;
    }

    #[instrument(skip(self))]
    async fn list_tables(&mut self) -> Result<Vec<String>, SourceError> {
        let client = self
            .client
            .clone()
            .ok_or_else(|| SourceError::Connection("not connected".into()))?;
        let mut guard = client.lock().await;
        let stream = guard
            .query(
                "SELECT s.name, t.name FROM sys.tables t \
                 JOIN sys.schemas s ON s.schema_id = t.schema_id",
                &[],
            )
            .await
            .map_err(|e| SourceError::Connection(e.to_string()))?;
        let rows = stream
            .into_first_result()
            .await
            .map_err(|e| SourceError::Connection(e.to_string()))?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let schema: &str = row.get(0).unwrap_or("dbo");
                let table: &str = row.get(1).unwrap_or("");
                format!("{schema}.{table}")
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn get_schema(&mut self, table_id: &str) -> Result<TableSchema, SourceError> {
        let client = self
            .client
            .clone()
            .ok_or_else(|| SourceError::Connection("not connected".into()))?;
        let (schema, table) = table_id.split_once('.').unwrap_or(("dbo", table_id));
        let columns = Self::fetch_columns(&client, schema, table).await?;
        debug!(table = table_id, columns = columns.len(), "fetched schema");
        Ok(TableSchema::new(columns))
    }

    fn read_data(&self, table_id: &str, batch_size: usize) -> BatchStream {
        let client = self.client.clone();
        let table_id = table_id.to_string();
        Box::pin(try_stream! {
            let client = client.ok_or_else(|| SourceError::Connection("not connected".into()))?;
            let (schema, table) = table_id.split_once('.').unwrap_or(("dbo", table_id.as_str()));
            let columns = MsSqlSource::fetch_columns(&client, schema, table).await?;

            let mut guard = client.lock().await;
            let stream = guard
                .query(format!("SELECT * FROM [{schema}].[{table}]"), &[])
                .await
                .map_err(|e| SourceError::Transient { table: table_id.clone(), message: e.to_string() })?;
            let rows = stream
                .into_first_result()
                .await
                .map_err(|e| SourceError::Transient { table: table_id.clone(), message: e.to_string() })?;
            drop(guard);

            for chunk in rows.chunks(batch_size.max(1)) {
                let batch: Batch = chunk.iter().map(|row| MsSqlSource::row_to_record(row, &columns)).collect();
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
        let client = self.client.clone();
        let table_id = table_id.to_string();
        Box::pin(try_stream! {
            let client = client.ok_or_else(|| SourceError::Connection("not connected".into()))?;
            let (schema, table) = table_id.split_once('.').unwrap_or(("dbo", table_id.as_str()));
            let columns = MsSqlSource::fetch_columns(&client, schema, table).await?;
            let watermark_column = choose_incremental_column(&[], &columns);

            let mut guard = client.lock().await;
            let query = match &watermark_column {
                Some(col) => format!(
                    "SELECT * FROM [{schema}].[{table}] WHERE [{col}] > '{}'",
                    watermark.naive_utc()
                ),
                None => format!("SELECT * FROM [{schema}].[{table}]"),
            };
            let stream = guard
                .query(query, &[])
                .await
                .map_err(|e| SourceError::Transient { table: table_id.clone(), message: e.to_string() })?;
            let rows = stream
                .into_first_result()
                .await
                .map_err(|e| SourceError::Transient { table: table_id.clone(), message: e.to_string() })?;
            drop(guard);

            for chunk in rows.chunks(batch_size.max(1)) {
                let batch: Batch = chunk.iter().map(|row| MsSqlSource::row_to_record(row, &columns)).collect();
                yield batch;
            }
        })
    }

    fn incremental_is_exact(&self) -> bool {
        // Conservative: falls back to a full read when no PK/timestamp/integer
        // column exists (DESIGN.md "Open Question decisions").
        false
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
