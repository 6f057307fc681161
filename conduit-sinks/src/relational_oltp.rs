//! Relational OLTP sink (cross-RDBMS migration target). One adapter, two
//! dialects — grounded on `mysql_dest.py` and `postgresql_dest.py`, which
//! differ only in quoting, upsert syntax, and a handful of type names.
//!
//! Like the OLAP sink, writes are built as literal `INSERT` statements
//! rather than prepared-statement batches: the column set is only known
//! at batch time (schema evolution across a run), so a compile-time-typed
//! parameter list isn't available here.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use async_trait::async_trait;
use conduit_types::{Batch, Column, ColumnType, ForeignKey, Index, Record, TableSchema, Value};
use mysql_async::prelude::Queryable;
use tokio_postgres::{Client as PgClient, NoTls};
use tracing::{debug, info, instrument, warn};

use crate::error::SinkError;
use crate::retry::{retry_with_backoff, SINK_WRITE_ATTEMPTS, SINK_WRITE_DELAYS};
use crate::sink::{SinkAdapter, SinkConfig, DEFAULT_WRITE_BATCH_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    MySql,
}

enum Conn {
    Postgres(PgClient),
    MySql(mysql_async::Pool),
}

pub struct RelationalOltpSink {
    dialect: Dialect,
    conn: Option<Conn>,
}

impl RelationalOltpSink {
    pub fn postgres() -> Self {
        Self { dialect: Dialect::Postgres, conn: None }
    }

    pub fn mysql() -> Self {
        Self { dialect: Dialect::MySql, conn: None }
    }

    fn quote(&self, ident: &str) -> String {
        match self.dialect {
            Dialect::Postgres => format!("\"{ident}\""),
            Dialect::MySql => format!("`{ident}`"),
        }
    }

    /// Identifiers longer than 64 bytes get a deterministic hash suffix
    /// rather than being truncated to an ambiguous prefix (spec.md §4.3,
    /// `convert_constraint_name` in `mysql_dest.py`).
    fn truncate_identifier(name: &str) -> String {
        if name.len() <= 64 {
            return name.to_string();
        }
        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        format!("{}_{:08x}", &name[..55], (hasher.finish() as u32))
    }

    fn dialect_type(&self, ty: &ColumnType, length: Option<u32>) -> String {
        match self.dialect {
            Dialect::MySql => mysql_type(ty, length),
            Dialect::Postgres => postgres_type(ty, length),
        }
    }

    /// Translates a source default expression, per spec.md §4.3:
    /// vendor `now()`/`current_timestamp` become the dialect's equivalent,
    /// sequence defaults are dropped (auto-increment handles them), and
    /// anything unrecognized is dropped with a warning rather than failing
    /// table creation.
    fn translate_default(&self, expr: &str, column: &str) -> Option<String> {
        let lower = expr.to_lowercase();
        if lower.contains("nextval") {
            return None;
        }
        if lower == "true" || lower == "false" {
            return Some(lower.to_uppercase());
        }
        if lower.contains("now()") || lower.contains("current_timestamp") {
            return Some("CURRENT_TIMESTAMP".to_string());
        }
        if lower.contains("current_date") {
            return Some("CURRENT_DATE".to_string());
        }
        if lower.contains("current_time") {
            return Some("CURRENT_TIME".to_string());
        }
        if lower == "null" {
            return None;
        }
        warn!(column, default_expr = expr, "unrecognized default expression, dropping it");
        None
    }

    fn escape_string(&self, value: &str) -> String {
        match self.dialect {
            Dialect::Postgres => value.replace('\'', "''"),
            Dialect::MySql => value.replace('\\', "\\\\").replace('\'', "\\'"),
        }
    }

    fn value_sql(&self, value: &Value) -> String {
        match value {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => match self.dialect {
                Dialect::Postgres => b.to_string(),
                Dialect::MySql => if *b { "1" } else { "0" }.to_string(),
            },
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::String(s) => format!("'{}'", self.escape_string(s)),
            Value::Json(j) => format!("'{}'", self.escape_string(&j.to_string())),
        }
    }

    async fn execute(&self, sql: &str) -> Result<(), SinkError> {
        match self.conn.as_ref() {
            Some(Conn::Postgres(client)) => client
                .batch_execute(sql)
                .await
                .map(|_| ())
                .map_err(|e| classify_postgres_error(sql, e)),
            Some(Conn::MySql(pool)) => {
                let mut conn = pool.get_conn().await.map_err(|e| classify_mysql_error(sql, e))?;
                conn.query_drop(sql).await.map_err(|e| classify_mysql_error(sql, e))
            }
            None => Err(SinkError::Connection("not connected".into())),
        }
    }

    async fn table_columns(&self, table: &str) -> Vec<String> {
        match self.conn.as_ref() {
            Some(Conn::Postgres(client)) => client
                .query(
                    "SELECT column_name FROM information_schema.columns WHERE table_name = $1",
                    &[&table],
                )
                .await
                .map(|rows| rows.iter().map(|r| r.get::<_, String>(0)).collect())
                .unwrap_or_default(),
            Some(Conn::MySql(pool)) => {
                let Ok(mut conn) = pool.get_conn().await else { return Vec::new() };
                let columns: Vec<String> = conn
                    .query(format!(
                        "SELECT column_name FROM information_schema.columns WHERE table_name = '{table}'"
                    ))
                    .await
                    .unwrap_or_default();
                columns
            }
            None => Vec::new(),
        }
    }
}

fn classify_postgres_error(table_or_sql: &str, e: tokio_postgres::Error) -> SinkError {
    let message = e.to_string();
    if message.to_lowercase().contains("lock") {
        SinkError::SessionLock { table: table_or_sql.to_string(), message }
    } else {
        SinkError::Transient { table: table_or_sql.to_string(), message }
    }
}

fn classify_mysql_error(table_or_sql: &str, e: mysql_async::Error) -> SinkError {
    let message = e.to_string();
    if message.to_lowercase().contains("lock") {
        SinkError::SessionLock { table: table_or_sql.to_string(), message }
    } else {
        SinkError::Transient { table: table_or_sql.to_string(), message }
    }
}

fn mysql_type(ty: &ColumnType, length: Option<u32>) -> String {
    match ty {
        ColumnType::Int16 => "SMALLINT".to_string(),
        ColumnType::Int32 => "INT".to_string(),
        ColumnType::Int64 => "BIGINT".to_string(),
        ColumnType::Float32 => "FLOAT".to_string(),
        ColumnType::Float64 => "DOUBLE".to_string(),
        ColumnType::Decimal { precision, scale } => format!("DECIMAL({precision},{scale})"),
        ColumnType::Bool => "BOOLEAN".to_string(),
        ColumnType::String => format!("VARCHAR({})", length.unwrap_or(255)),
        ColumnType::Text => "TEXT".to_string(),
        ColumnType::Bytes => "BLOB".to_string(),
        ColumnType::Date => "DATE".to_string(),
        ColumnType::Time => "TIME".to_string(),
        ColumnType::Timestamp => "DATETIME".to_string(),
        ColumnType::Uuid => "CHAR(36)".to_string(),
        ColumnType::Json => "JSON".to_string(),
        ColumnType::Array(_) => "JSON".to_string(),
    }
}

fn postgres_type(ty: &ColumnType, length: Option<u32>) -> String {
    match ty {
        ColumnType::Int16 => "SMALLINT".to_string(),
        ColumnType::Int32 => "INTEGER".to_string(),
        ColumnType::Int64 => "BIGINT".to_string(),
        ColumnType::Float32 => "REAL".to_string(),
        ColumnType::Float64 => "DOUBLE PRECISION".to_string(),
        ColumnType::Decimal { precision, scale } => format!("NUMERIC({precision},{scale})"),
        ColumnType::Bool => "BOOLEAN".to_string(),
        ColumnType::String => format!("VARCHAR({})", length.unwrap_or(255)),
        ColumnType::Text => "TEXT".to_string(),
        ColumnType::Bytes => "BYTEA".to_string(),
        ColumnType::Date => "DATE".to_string(),
        ColumnType::Time => "TIME".to_string(),
        ColumnType::Timestamp => "TIMESTAMP".to_string(),
        ColumnType::Uuid => "UUID".to_string(),
        ColumnType::Json => "JSONB".to_string(),
        ColumnType::Array(_) => "JSONB".to_string(),
    }
}

#[async_trait]
impl SinkAdapter for RelationalOltpSink {
    fn kind(&self) -> &'static str {
        match self.dialect {
            Dialect::Postgres => "postgres",
            Dialect::MySql => "mysql",
        }
    }

    #[instrument(skip(self, config))]
    async fn connect(&mut self, config: &SinkConfig) -> Result<(), SinkError> {
        let host = config.get("host").and_then(|v| v.as_str()).ok_or(SinkError::MissingConfig("host"))?;
        let database = config.get("database").and_then(|v| v.as_str()).ok_or(SinkError::MissingConfig("database"))?;
        let username = config.get("username").and_then(|v| v.as_str()).unwrap_or("");
        let password = config.get("password").and_then(|v| v.as_str()).unwrap_or("");

        match self.dialect {
            Dialect::Postgres => {
                let port = config.get("port").and_then(|v| v.as_u64()).unwrap_or(5432);
                let conn_str = format!(
                    "host={host} port={port} dbname={database} user={username} password={password}"
                );
                let (client, connection) = tokio_postgres::connect(&conn_str, NoTls)
                    .await
                    .map_err(|e| SinkError::Connection(e.to_string()))?;
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        warn!(error = %e, "postgres sink connection task ended");
                    }
                });
                self.conn = Some(Conn::Postgres(client));
            }
            Dialect::MySql => {
                let port = config.get("port").and_then(|v| v.as_u64()).unwrap_or(3306) as u16;
                let opts = mysql_async::OptsBuilder::default()
                    .ip_or_hostname(host)
                    .tcp_port(port)
                    .db_name(Some(database))
                    .user(Some(username))
                    .pass(Some(password));
                let pool = mysql_async::Pool::new(opts);
                pool.get_conn().await.map_err(|e| SinkError::Connection(e.to_string()))?;
                self.conn = Some(Conn::MySql(pool));
            }
        }
        info!(host, database, dialect = ?self.dialect, "connected to relational OLTP sink");
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(Conn::MySql(pool)) = self.conn.take() {
            let _ = pool.disconnect().await;
        }
    }

    fn map_types(&self, source_schema: &TableSchema, _source_kind: &str) -> TableSchema {
        let columns = source_schema
            .columns
            .iter()
            .map(|col| {
                let full_type = self.dialect_type(&col.ty, col.length);
                let default_expr = col.default_expr.as_deref().and_then(|e| self.translate_default(e, &col.name));
                Column {
                    name: Self::truncate_identifier(&col.name),
                    ty: col.ty.clone(),
                    nullable: col.nullable,
                    length: col.length,
                    default_expr,
                    full_type: Some(full_type),
                }
            })
            .collect();
        TableSchema {
            columns,
            primary_key: source_schema.primary_key.clone(),
            foreign_keys: source_schema.foreign_keys.clone(),
            unique_constraints: source_schema.unique_constraints.clone(),
            indexes: source_schema.indexes.clone(),
        }
    }

    #[instrument(skip(self))]
    async fn table_exists(&mut self, table_id: &str, _source_kind: &str) -> Result<bool, SinkError> {
        Ok(!self.table_columns(table_id).await.is_empty())
    }

    #[instrument(skip(self, sink_schema))]
    async fn create_table(
        &mut self,
        table_id: &str,
        sink_schema: &TableSchema,
        _source_kind: &str,
        primary_key: &[String],
    ) -> Result<(), SinkError> {
        if self.table_exists(table_id, _source_kind).await.unwrap_or(false) {
            debug!(table_id, "table already exists, skipping creation");
            return Ok(());
        }
        let mut defs: Vec<String> = sink_schema
            .columns
            .iter()
            .map(|c| {
                let ty = c.full_type.clone().unwrap_or_else(|| self.dialect_type(&c.ty, c.length));
                let nullability = if c.nullable { "" } else { " NOT NULL" };
                let default = c
                    .default_expr
                    .as_ref()
                    .map(|d| format!(" DEFAULT {d}"))
                    .unwrap_or_default();
                format!("{} {ty}{nullability}{default}", self.quote(&c.name))
            })
            .collect();
        if !primary_key.is_empty() {
            let pk_cols: Vec<String> = primary_key.iter().map(|c| self.quote(c)).collect();
            defs.push(format!("PRIMARY KEY ({})", pk_cols.join(", ")));
        }
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.quote(table_id),
            defs.join(", ")
        );
        self.execute(&sql).await.map_err(|e| SinkError::Schema { table: table_id.to_string(), message: e.to_string() })?;
        info!(table_id, dialect = ?self.dialect, "created relational table");
        Ok(())
    }

    #[instrument(skip(self, batch))]
    async fn write_data(
        &mut self,
        table_id: &str,
        batch: &Batch,
        _source_kind: &str,
        primary_key: &[String],
    ) -> Result<usize, SinkError> {
        if batch.is_empty() {
            return Ok(0);
        }
        let existing_columns = self.table_columns(table_id).await;
        let mut columns: Vec<String> = batch.iter().flat_map(|r| r.keys().cloned()).collect();
        columns.sort();
        columns.dedup();
        for col in &columns {
            if !existing_columns.iter().any(|c| c == col) {
                let sql = format!(
                    "ALTER TABLE {} ADD COLUMN {} {}",
                    self.quote(table_id),
                    self.quote(col),
                    self.dialect_type(&ColumnType::Text, None)
                );
                if let Err(e) = self.execute(&sql).await {
                    warn!(table_id, column = col.as_str(), error = %e, "could not add column");
                }
            }
        }

        let all_keys_are_pk = !primary_key.is_empty() && primary_key.len() == columns.len();
        let mut written = 0usize;
        for chunk in batch.chunks(DEFAULT_WRITE_BATCH_SIZE) {
            match self.write_chunk(table_id, chunk, &columns, primary_key, all_keys_are_pk).await {
                Ok(n) => written += n,
                Err(_) => {
                    warn!(table_id, "batch write exhausted retries, falling back to per-record inserts");
                    for record in chunk {
                        match self.write_chunk(table_id, std::slice::from_ref(record), &columns, primary_key, all_keys_are_pk).await {
                            Ok(n) => written += n,
                            Err(e) => warn!(table_id, error = %e, "dropping record that failed to write"),
                        }
                    }
                }
            }
        }
        Ok(written)
    }

    #[instrument(skip(self, indexes))]
    async fn create_indexes(&mut self, table_id: &str, indexes: &[Index]) -> Result<(), SinkError> {
        for index in indexes {
            let name = Self::truncate_identifier(&index.name);
            let cols = index.columns.iter().map(|c| self.quote(c)).collect::<Vec<_>>().join(", ");
            let unique = if index.unique { "UNIQUE " } else { "" };
            let sql = format!("CREATE {unique}INDEX {} ON {} ({cols})", self.quote(&name), self.quote(table_id));
            if let Err(e) = self.execute(&sql).await {
                warn!(table_id, index = name.as_str(), error = %e, "could not create index");
            }
        }
        Ok(())
    }

    #[instrument(skip(self, uniques))]
    async fn create_unique_constraints(&mut self, table_id: &str, uniques: &[Index]) -> Result<(), SinkError> {
        for unique in uniques {
            let name = Self::truncate_identifier(&unique.name);
            let cols = unique.columns.iter().map(|c| self.quote(c)).collect::<Vec<_>>().join(", ");
            let sql = format!(
                "ALTER TABLE {} ADD CONSTRAINT {} UNIQUE ({cols})",
                self.quote(table_id),
                self.quote(&name)
            );
            if let Err(e) = self.execute(&sql).await {
                warn!(table_id, constraint = name.as_str(), error = %e, "could not create unique constraint");
            }
        }
        Ok(())
    }

    #[instrument(skip(self, fks))]
    async fn create_foreign_keys(&mut self, table_id: &str, fks: &[ForeignKey]) -> Result<(), SinkError> {
        for fk in fks {
            let name = Self::truncate_identifier(&fk.name);
            let cols = fk.columns.iter().map(|c| self.quote(c)).collect::<Vec<_>>().join(", ");
            let ref_cols = fk.referenced_columns.iter().map(|c| self.quote(c)).collect::<Vec<_>>().join(", ");
            let mut sql = format!(
                "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({cols}) REFERENCES {} ({ref_cols})",
                self.quote(table_id),
                self.quote(&name),
                self.quote(&fk.referenced_table),
            );
            if let Some(on_update) = &fk.on_update {
                sql.push_str(&format!(" ON UPDATE {on_update}"));
            }
            if let Some(on_delete) = &fk.on_delete {
                sql.push_str(&format!(" ON DELETE {on_delete}"));
            }
            if let Err(e) = self.execute(&sql).await {
                warn!(table_id, foreign_key = name.as_str(), error = %e, "could not create foreign key");
            }
        }
        Ok(())
    }
}

impl RelationalOltpSink {
    async fn write_chunk(
        &self,
        table_id: &str,
        records: &[Record],
        columns: &[String],
        primary_key: &[String],
        all_keys_are_pk: bool,
    ) -> Result<usize, SinkError> {
        if records.is_empty() {
            return Ok(0);
        }
        let column_list = columns.iter().map(|c| self.quote(c)).collect::<Vec<_>>().join(", ");
        let value_rows: Vec<String> = records
            .iter()
            .map(|record| {
                let values: Vec<String> = columns
                    .iter()
                    .map(|c| self.value_sql(record.get(c).unwrap_or(&Value::Null)))
                    .collect();
                format!("({})", values.join(", "))
            })
            .collect();

        let sql = match self.dialect {
            Dialect::MySql if !primary_key.is_empty() && !all_keys_are_pk => {
                let updates: Vec<String> = columns
                    .iter()
                    .filter(|c| !primary_key.contains(c))
                    .map(|c| format!("{} = VALUES({})", self.quote(c), self.quote(c)))
                    .collect();
                format!(
                    "INSERT INTO {} ({column_list}) VALUES {} ON DUPLICATE KEY UPDATE {}",
                    self.quote(table_id),
                    value_rows.join(", "),
                    updates.join(", ")
                )
            }
            Dialect::MySql if all_keys_are_pk => {
                format!("INSERT IGNORE INTO {} ({column_list}) VALUES {}", self.quote(table_id), value_rows.join(", "))
            }
            Dialect::Postgres if !primary_key.is_empty() && !all_keys_are_pk => {
                let pk_cols = primary_key.iter().map(|c| self.quote(c)).collect::<Vec<_>>().join(", ");
                let updates: Vec<String> = columns
                    .iter()
                    .filter(|c| !primary_key.contains(c))
                    .map(|c| format!("{} = EXCLUDED.{}", self.quote(c), self.quote(c)))
                    .collect();
                format!(
                    "INSERT INTO {} ({column_list}) VALUES {} ON CONFLICT ({pk_cols}) DO UPDATE SET {}",
                    self.quote(table_id),
                    value_rows.join(", "),
                    updates.join(", ")
                )
            }
            Dialect::Postgres if all_keys_are_pk => {
                let pk_cols = primary_key.iter().map(|c| self.quote(c)).collect::<Vec<_>>().join(", ");
                format!(
                    "INSERT INTO {} ({column_list}) VALUES {} ON CONFLICT ({pk_cols}) DO NOTHING",
                    self.quote(table_id),
                    value_rows.join(", ")
                )
            }
            _ => format!("INSERT INTO {} ({column_list}) VALUES {}", self.quote(table_id), value_rows.join(", ")),
        };

        retry_with_backoff(
            SINK_WRITE_ATTEMPTS,
            &SINK_WRITE_DELAYS,
            |_attempt| {
                let sql = sql.clone();
                async move { self.execute(&sql).await }
            },
            SinkError::is_retryable,
        )
        .await?;
        Ok(records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_identifier_hashes_long_names() {
        let long = "a".repeat(80);
        let truncated = RelationalOltpSink::truncate_identifier(&long);
        assert_eq!(truncated.len(), 55 + 1 + 8);
        assert!(truncated.starts_with(&"a".repeat(55)));
    }

    #[test]
    fn translate_default_maps_vendor_now_to_current_timestamp() {
        let sink = RelationalOltpSink::postgres();
        assert_eq!(sink.translate_default("now()", "created_at"), Some("CURRENT_TIMESTAMP".to_string()));
        assert_eq!(sink.translate_default("nextval('seq')", "id"), None);
    }

    #[test]
    fn mysql_type_applies_varchar_length() {
        assert_eq!(mysql_type(&ColumnType::String, Some(64)), "VARCHAR(64)");
        assert_eq!(mysql_type(&ColumnType::Json, None), "JSON");
    }
}
