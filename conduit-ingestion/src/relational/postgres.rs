use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use conduit_types::{Batch, Column, ColumnType, ForeignKey, Index, Record, TableSchema, Value};
use indexmap::IndexMap;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::SourceError;
use crate::relational::{choose_incremental_column, optional_str, optional_u16, require_str};
use crate::source::{BatchStream, SourceAdapter, SourceConfig};

/// `relational_db` source kind, Postgres-like: catalog-driven table
/// enumeration, one batch per server round-trip via a `DECLARE CURSOR`
/// (spec.md §4.2 "Relational database source").
pub struct PostgresSource {
    client: Option<Arc<Client>>,
}

impl Default for PostgresSource {
    fn default() -> Self {
        Self { client: None }
    }
}

impl PostgresSource {
    fn client(&self) -> Result<Arc<Client>, SourceError> {
        self.client
            .clone()
            .ok_or_else(|| SourceError::Connection("not connected".into()))
    }

    fn split_table_id(table_id: &str) -> (String, String) {
        match table_id.split_once('.') {
            Some((schema, table)) => (schema.to_string(), table.to_string()),
            None => ("public".to_string(), table_id.to_string()),
        }
    }

    fn map_pg_type(udt_name: &str) -> ColumnType {
        match udt_name {
            "int2" => ColumnType::Int16,
            "int4" | "serial" => ColumnType::Int32,
            "int8" | "bigserial" => ColumnType::Int64,
            "float4" => ColumnType::Float32,
            "float8" => ColumnType::Float64,
            "numeric" => ColumnType::Decimal {
                precision: 38,
                scale: 10,
            },
            "bool" => ColumnType::Bool,
            "bytea" => ColumnType::Bytes,
            "date" => ColumnType::Date,
            "time" | "timetz" => ColumnType::Time,
            "timestamp" | "timestamptz" => ColumnType::Timestamp,
            "uuid" => ColumnType::Uuid,
            "json" | "jsonb" => ColumnType::Json,
            "varchar" | "bpchar" | "name" | "citext" => ColumnType::String,
            "text" => ColumnType::Text,
            _ if udt_name.starts_with('_') => {
                ColumnType::Array(Box::new(Self::map_pg_type(&udt_name[1..])))
            }
            other => {
                warn!(pg_type = other, "unmapped postgres type, falling back to text");
                ColumnType::Text
            }
        }
    }

    fn row_to_value(row: &Row, idx: usize, ty: &ColumnType) -> Value {
        macro_rules! try_get {
            ($t:ty) => {
                row.try_get::<_, Option<$t>>(idx).ok().flatten()
            };
        }
        match ty {
            ColumnType::Int16 => try_get!(i16).map(|v| Value::Int(v as i64)).unwrap_or(Value::Null),
            ColumnType::Int32 => try_get!(i32).map(|v| Value::Int(v as i64)).unwrap_or(Value::Null),
            ColumnType::Int64 => try_get!(i64).map(Value::Int).unwrap_or(Value::Null),
            ColumnType::Float32 => try_get!(f32).map(|v| Value::Float(v as f64)).unwrap_or(Value::Null),
            ColumnType::Float64 => try_get!(f64).map(Value::Float).unwrap_or(Value::Null),
            ColumnType::Bool => try_get!(bool).map(Value::Bool).unwrap_or(Value::Null),
            ColumnType::Uuid => try_get!(Uuid).map(|v| Value::String(v.to_string())).unwrap_or(Value::Null),
            ColumnType::Timestamp => try_get!(NaiveDateTime)
                .map(|v| Value::String(DateTime::<Utc>::from_naive_utc_and_offset(v, Utc).to_rfc3339()))
                .unwrap_or(Value::Null),
            ColumnType::Date => try_get!(NaiveDate).map(|v| Value::String(v.to_string())).unwrap_or(Value::Null),
            ColumnType::Time => try_get!(NaiveTime).map(|v| Value::String(v.to_string())).unwrap_or(Value::Null),
            ColumnType::Json => try_get!(serde_json::Value).map(Value::Json).unwrap_or(Value::Null),
            _ => try_get!(String).map(Value::String).unwrap_or(Value::Null),
        }
    }
}

#[async_trait]
impl SourceAdapter for PostgresSource {
    fn kind(&self) -> &'static str {
        "postgres"
    }

    #[instrument(skip(self, config))]
    async fn connect(&mut self, config: &SourceConfig) -> Result<(), SourceError> {
        let host = require_str(config, "host")?;
        let database = require_str(config, "database")?;
        let username = require_str(config, "username")?;
        let password = optional_str(config, "password").unwrap_or("");
        let port = optional_u16(config, "port", 5432);

        let conn_str =
            format!("host={host} port={port} dbname={database} user={username} password={password}");
        let (client, connection) = tokio_postgres::connect(&conn_str, NoTls)
            .await
            .map_err(|e| SourceError::Connection(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "postgres connection task ended with an error");
            }
        });

        info!(host, database, "connected to postgres source");
        self.client = Some(Arc::new(client));
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.client = None;
    }

    #[instrument(skip(self))]
    async fn list_tables(&mut self) -> Result<Vec<String>, SourceError> {
        let client = self.client()?;
        let rows = client
            .query(
                "SELECT table_schema, table_name FROM information_schema.tables \
                 WHERE table_type = 'BASE TABLE' \
                 AND table_schema NOT IN ('pg_catalog', 'information_schema') \
                 ORDER BY table_schema, table_name",
                &[],
            )
            .await
            .map_err(|e| SourceError::Connection(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let schema: String = row.get(0);
                let table: String = row.get(1);
                format!("{schema}.{table}")
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn get_schema(&mut self, table_id: &str) -> Result<TableSchema, SourceError> {
        let client = self.client()?;
        let (schema, table) = Self::split_table_id(table_id);

        let rows = client
            .query(
                "SELECT column_name, udt_name, is_nullable, character_maximum_length, \
                        numeric_precision, numeric_scale, column_default \
                 FROM information_schema.columns \
                 WHERE table_schema = $1 AND table_name = $2 \
                 ORDER BY ordinal_position",
                &[&schema, &table],
            )
            .await
            .map_err(|e| SourceError::Schema {
                table: table_id.to_string(),
                message: e.to_string(),
            })?;

        let columns = rows
            .into_iter()
            .map(|row| {
                let name: String = row.get(0);
                let udt_name: String = row.get(1);
                let is_nullable: String = row.get(2);
                let length: Option<i32> = row.get(3);
                let precision: Option<i32> = row.get(4);
                let scale: Option<i32> = row.get(5);
                let default_expr: Option<String> = row.get(6);

                let ty = if udt_name == "numeric" {
                    ColumnType::Decimal {
                        precision: precision.unwrap_or(38) as u32,
                        scale: scale.unwrap_or(10) as u32,
                    }
                } else {
                    Self::map_pg_type(&udt_name)
                };

                Column {
                    name,
                    ty,
                    nullable: is_nullable == "YES",
                    length: length.map(|v| v as u32),
                    default_expr,
                    full_type: Some(udt_name),
                }
            })
            .collect();

        let mut schema_desc = TableSchema::new(columns);
        schema_desc.primary_key = self.get_primary_key_columns(table_id).await.unwrap_or_default();
        debug!(table = table_id, columns = schema_desc.columns.len(), "fetched schema");
        Ok(schema_desc)
    }

    fn read_data(&self, table_id: &str, batch_size: usize) -> BatchStream {
        let client = self.client.clone();
        let table_id = table_id.to_string();
        Box::pin(try_stream! {
            let client = client.ok_or_else(|| SourceError::Connection("not connected".into()))?;
            let (schema, table) = Self::split_table_id(&table_id);
            let rows = client
                .query(&format!("SELECT * FROM \"{schema}\".\"{table}\""), &[])
                .await
                .map_err(|e| SourceError::Transient { table: table_id.clone(), message: e.to_string() })?;

            for chunk in rows.chunks(batch_size.max(1)) {
                let mut batch: Batch = Vec::with_capacity(chunk.len());
                for row in chunk {
                    let mut record: Record = Record::new();
                    for (idx, col) in row.columns().iter().enumerate() {
                        let ty = Self::map_pg_type(col.type_().name());
                        record.insert(col.name().to_string(), Self::row_to_value(row, idx, &ty));
                    }
                    batch.push(record);
                }
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
            let (schema, table) = Self::split_table_id(&table_id);

            let column_rows = client
                .query(
                    "SELECT column_name, udt_name FROM information_schema.columns \
                     WHERE table_schema = $1 AND table_name = $2 ORDER BY ordinal_position",
                    &[&schema, &table],
                )
                .await
                .map_err(|e| SourceError::Schema { table: table_id.clone(), message: e.to_string() })?;
            let columns: Vec<Column> = column_rows
                .iter()
                .map(|row| {
                    let name: String = row.get(0);
                    let udt_name: String = row.get(1);
                    Column::new(name, Self::map_pg_type(&udt_name), true)
                })
                .collect();

            let watermark_column = choose_incremental_column(&[], &columns);
            let Some(watermark_column) = watermark_column else {
                // No usable watermark column: fall back to a full read, deduplication
                // is the sink's responsibility per spec.md §4.2.
                let mut inner = client
                    .query(&format!("SELECT * FROM \"{schema}\".\"{table}\""), &[])
                    .await
                    .map_err(|e| SourceError::Transient { table: table_id.clone(), message: e.to_string() })?;
                for chunk in inner.chunks(batch_size.max(1)) {
                    let mut batch: Batch = Vec::with_capacity(chunk.len());
                    for row in chunk {
                        let mut record: Record = Record::new();
                        for (idx, col) in row.columns().iter().enumerate() {
                            let ty = Self::map_pg_type(col.type_().name());
                            record.insert(col.name().to_string(), Self::row_to_value(row, idx, &ty));
                        }
                        batch.push(record);
                    }
                    batch.shrink_to_fit();
                    let _ = &mut inner;
                    yield batch;
                }
                return;
            };

            let rows = client
                .query(
                    &format!(
                        "SELECT * FROM \"{schema}\".\"{table}\" WHERE \"{watermark_column}\" > $1"
                    ),
                    &[&watermark.naive_utc()],
                )
                .await
                .map_err(|e| SourceError::Transient { table: table_id.clone(), message: e.to_string() })?;

            for chunk in rows.chunks(batch_size.max(1)) {
                let mut batch: Batch = Vec::with_capacity(chunk.len());
                for row in chunk {
                    let mut record: Record = Record::new();
                    for (idx, col) in row.columns().iter().enumerate() {
                        let ty = Self::map_pg_type(col.type_().name());
                        record.insert(col.name().to_string(), Self::row_to_value(row, idx, &ty));
                    }
                    batch.push(record);
                }
                yield batch;
            }
        })
    }

    async fn get_primary_key_columns(&mut self, table_id: &str) -> Result<Vec<String>, SourceError> {
        let client = self.client()?;
        let (schema, table) = Self::split_table_id(table_id);
        let rows = client
            .query(
                "SELECT a.attname FROM pg_index i \
                 JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey) \
                 JOIN pg_class c ON c.oid = i.indrelid \
                 JOIN pg_namespace n ON n.oid = c.relnamespace \
                 WHERE i.indisprimary AND n.nspname = $1 AND c.relname = $2",
                &[&schema, &table],
            )
            .await
            .map_err(|e| SourceError::Transient { table: table_id.to_string(), message: e.to_string() })?;
        Ok(rows.into_iter().map(|r| r.get(0)).collect())
    }

    async fn get_foreign_keys(&mut self, table_id: &str) -> Result<Vec<ForeignKey>, SourceError> {
        let client = self.client()?;
        let (schema, table) = Self::split_table_id(table_id);
        let rows = client
            .query(
                "SELECT tc.constraint_name, kcu.column_name, ccu.table_name AS foreign_table_name, \
                 ccu.column_name AS foreign_column_name, rc.update_rule, rc.delete_rule \
                 FROM information_schema.table_constraints AS tc \
                 JOIN information_schema.key_column_usage AS kcu \
                   ON tc.constraint_name = kcu.constraint_name AND tc.table_schema = kcu.table_schema \
                 JOIN information_schema.constraint_column_usage AS ccu \
                   ON ccu.constraint_name = tc.constraint_name AND ccu.table_schema = tc.table_schema \
                 LEFT JOIN information_schema.referential_constraints AS rc \
                   ON tc.constraint_name = rc.constraint_name AND tc.table_schema = rc.constraint_schema \
                 WHERE tc.constraint_type = 'FOREIGN KEY' AND tc.table_name = $1 AND tc.table_schema = $2",
                &[&table, &schema],
            )
            .await
            .map_err(|e| SourceError::Transient { table: table_id.to_string(), message: e.to_string() })?;

        let mut fks: IndexMap<String, ForeignKey> = IndexMap::new();
        for row in &rows {
            let name: String = row.get(0);
            let column: String = row.get(1);
            let foreign_table: String = row.get(2);
            let foreign_column: String = row.get(3);
            let update_rule: Option<String> = row.get(4);
            let delete_rule: Option<String> = row.get(5);
            let fk = fks.entry(name.clone()).or_insert_with(|| ForeignKey {
                name,
                columns: Vec::new(),
                referenced_table: foreign_table,
                referenced_columns: Vec::new(),
                on_update: update_rule,
                on_delete: delete_rule,
            });
            fk.columns.push(column);
            fk.referenced_columns.push(foreign_column);
        }
        Ok(fks.into_values().collect())
    }

    async fn get_unique_constraints(&mut self, table_id: &str) -> Result<Vec<Index>, SourceError> {
        let client = self.client()?;
        let (schema, table) = Self::split_table_id(table_id);
        let rows = client
            .query(
                "SELECT tc.constraint_name, kcu.column_name \
                 FROM information_schema.table_constraints AS tc \
                 JOIN information_schema.key_column_usage AS kcu \
                   ON tc.constraint_name = kcu.constraint_name AND tc.table_schema = kcu.table_schema \
                 WHERE tc.constraint_type = 'UNIQUE' AND tc.table_name = $1 AND tc.table_schema = $2 \
                 ORDER BY tc.constraint_name, kcu.ordinal_position",
                &[&table, &schema],
            )
            .await
            .map_err(|e| SourceError::Transient { table: table_id.to_string(), message: e.to_string() })?;

        let mut uniques: IndexMap<String, Index> = IndexMap::new();
        for row in &rows {
            let name: String = row.get(0);
            let column: String = row.get(1);
            uniques
                .entry(name.clone())
                .or_insert_with(|| Index { name, columns: Vec::new(), unique: true })
                .columns
                .push(column);
        }
        Ok(uniques.into_values().collect())
    }

    async fn get_indexes(&mut self, table_id: &str) -> Result<Vec<Index>, SourceError> {
        let client = self.client()?;
        let (schema, table) = Self::split_table_id(table_id);
        let rows = client
            .query(
                "SELECT i.relname AS index_name, a.attname AS column_name, ix.indisunique AS is_unique \
                 FROM pg_class t \
                 JOIN pg_namespace n ON t.relnamespace = n.oid \
                 JOIN pg_index ix ON t.oid = ix.indrelid \
                 JOIN pg_class i ON i.oid = ix.indexrelid \
                 JOIN pg_am am ON i.relam = am.oid \
                 JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = ANY(ix.indkey) \
                 WHERE t.relkind = 'r' AND t.relname = $1 AND n.nspname = $2 AND NOT ix.indisprimary \
                 ORDER BY i.relname, array_position(ix.indkey, a.attnum)",
                &[&table, &schema],
            )
            .await
            .map_err(|e| SourceError::Transient { table: table_id.to_string(), message: e.to_string() })?;

        let mut indexes: IndexMap<String, Index> = IndexMap::new();
        for row in &rows {
            let name: String = row.get(0);
            let column: String = row.get(1);
            let is_unique: bool = row.get(2);
            indexes
                .entry(name.clone())
                .or_insert_with(|| Index { name, columns: Vec::new(), unique: is_unique })
                .columns
                .push(column);
        }
        Ok(indexes.into_values().collect())
    }
}
