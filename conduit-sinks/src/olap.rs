//! OLAP columnar sink (ClickHouse-like). Engine/sort-key choice is driven
//! by table family (spec.md §4.3); grounded line-for-line on
//! `clickhouse_dest.py`'s `create_table`/`write_data`/`_sanitize_column_name`.
//!
//! The upstream `clickhouse` crate's `Client::insert` expects a
//! compile-time-known `Row` type. Our batches carry a dynamic, per-run
//! column set (schema drift across SaaS pages, work-item field evolution),
//! so writes here go through hand-built parameterless `INSERT ... VALUES`
//! statements instead — the same shape the original's dynamic
//! `column_names=` insert produces, just rendered as SQL text rather than
//! bound columns.

use std::collections::HashSet;

use async_trait::async_trait;
use clickhouse::Client;
use conduit_types::{Batch, Column, ColumnType, ForeignKey, Index, Record, TableSchema, Value};
use tracing::{debug, info, instrument, warn};

use crate::error::SinkError;
use crate::sink::{SinkAdapter, SinkConfig};

/// Bulk insert sub-batch size (spec.md §4.3: "OLAP sink uses 5000 for bulk
/// speed").
const OLAP_WRITE_BATCH_SIZE: usize = 5000;

/// How the caller addresses the ClickHouse wire protocol. The crates.io
/// `clickhouse` crate only speaks the HTTP interface, so `Native` is
/// accepted for config compatibility (operators may still paste the
/// native-protocol port) and is translated to the HTTP port rather than
/// attempted directly — per spec.md §9's "a clean implementation should
/// accept an explicit protocol hint rather than guessing".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Protocol {
    Http,
    Native,
}

impl Protocol {
    fn from_config(raw: Option<&str>) -> Self {
        match raw {
            Some("native") => Protocol::Native,
            _ => Protocol::Http,
        }
    }
}

/// Table family, per spec.md §4.3's OLAP sink contract. Families are
/// derived from `source_kind` plus, for `workitem_saas`, the fixed table
/// name (those seven names are part of the source/sink contract, not
/// arbitrary user data).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TableFamily {
    /// `projects`/`teams`: small, fully replaced each run, ordered by id.
    FixedDimension,
    /// SaaS CRM module tables: dedup-on-merge keyed by load time, every
    /// non-id column a nullable string.
    SaasCrmModule,
    /// `workitems_main` (ordered by id) / `workitems_updates` and
    /// `workitems_revisions` (ordered by rev): natural revision key,
    /// id/rev non-nullable.
    WorkItemRevisioned,
    /// `workitems_comments` / `workitems_relations`: no natural key, the
    /// engine's replacing semantics over a monotonic load-time column does
    /// the deduplication instead of an app-level id check.
    WorkItemLoadTime,
    /// Everything else (relational-sourced tables): `HR_`-prefixed,
    /// unordered.
    Other,
}

fn classify(source_kind: &str, table_id: &str) -> TableFamily {
    match source_kind {
        "workitem_saas" => match table_id {
            "projects" | "teams" => TableFamily::FixedDimension,
            "workitems_main" | "workitems_updates" | "workitems_revisions" => {
                TableFamily::WorkItemRevisioned
            }
            "workitems_comments" | "workitems_relations" => TableFamily::WorkItemLoadTime,
            _ => TableFamily::Other,
        },
        "crm_saas" => TableFamily::SaasCrmModule,
        _ => TableFamily::Other,
    }
}

/// The seven fixed work-item SaaS table ids map to their `DEVOPS_*` sink
/// names verbatim (spec.md §6); unrecognized ids (there shouldn't be any,
/// since this source only ever emits these seven) fall back to an
/// upper-cased, `DEVOPS_`-prefixed rendering rather than panicking.
fn devops_table_name(table_id: &str) -> String {
    match table_id {
        "projects" => "DEVOPS_PROJECTS".to_string(),
        "teams" => "DEVOPS_TEAMS".to_string(),
        "workitems_main" => "DEVOPS_WORKITEMS_MAIN".to_string(),
        "workitems_updates" => "DEVOPS_WORKITEMS_UPDATES".to_string(),
        "workitems_comments" => "DEVOPS_WORKITEMS_COMMENTS".to_string(),
        "workitems_relations" => "DEVOPS_WORKITEMS_RELATIONS".to_string(),
        "workitems_revisions" => "DEVOPS_WORKITEMS_REVISIONS".to_string(),
        other => format!("DEVOPS_{}", other.to_uppercase()),
    }
}

fn destination_table_name(source_kind: &str, table_id: &str, family: TableFamily) -> String {
    match family {
        TableFamily::WorkItemRevisioned | TableFamily::WorkItemLoadTime | TableFamily::FixedDimension
            if source_kind == "workitem_saas" =>
        {
            devops_table_name(table_id)
        }
        // The CRM SaaS source is Zoho-shaped regardless of its registered
        // adapter kind string (spec.md §6: "SaaS CRM -> zoho_<module>").
        TableFamily::SaasCrmModule => format!("zoho_{}", table_id.to_lowercase()),
        _ => format!("HR_{table_id}"),
    }
}

/// Replaces every non-alphanumeric/underscore byte with `_`, prefixes a
/// leading digit, lowercases, and resolves collisions with `_1`, `_2`, ...
struct ColumnSanitizer {
    used: HashSet<String>,
}

impl ColumnSanitizer {
    fn seeded<S: Into<String>>(seed: impl IntoIterator<Item = S>) -> Self {
        Self {
            used: seed.into_iter().map(Into::into).collect(),
        }
    }

    fn sanitize(&mut self, name: &str) -> String {
        let mut cleaned: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
            .collect();
        if cleaned.is_empty() {
            cleaned = "field".to_string();
        }
        if cleaned.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false) {
            cleaned = format!("_{cleaned}");
        }
        cleaned = cleaned.to_lowercase();
        let mut candidate = cleaned.clone();
        let mut counter = 1;
        while self.used.contains(&candidate) {
            candidate = format!("{cleaned}_{counter}");
            counter += 1;
        }
        self.used.insert(candidate.clone());
        candidate
    }
}

fn clickhouse_type(ty: &ColumnType) -> String {
    match ty {
        ColumnType::Int16 => "Int16".to_string(),
        ColumnType::Int32 => "Int32".to_string(),
        ColumnType::Int64 => "Int64".to_string(),
        ColumnType::Float32 => "Float32".to_string(),
        ColumnType::Float64 => "Float64".to_string(),
        ColumnType::Decimal { precision, scale } => format!("Decimal({precision}, {scale})"),
        ColumnType::Bool => "UInt8".to_string(),
        ColumnType::String | ColumnType::Text => "String".to_string(),
        ColumnType::Bytes => "String".to_string(),
        ColumnType::Date => "Date".to_string(),
        ColumnType::Time => "String".to_string(),
        ColumnType::Timestamp => "DateTime64(3)".to_string(),
        ColumnType::Uuid => "UUID".to_string(),
        ColumnType::Json => "String".to_string(),
        ColumnType::Array(inner) => format!("Array({})", clickhouse_type(inner)),
    }
}

fn quote_ident(name: &str) -> String {
    format!("`{name}`")
}

fn escape_string(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

fn value_as_id_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::String(s) => s.clone(),
        Value::Json(j) => j.to_string(),
    }
}

fn value_sql(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::String(s) => format!("'{}'", escape_string(s)),
        Value::Json(j) => format!("'{}'", escape_string(&j.to_string())),
    }
}

pub struct OlapSink {
    client: Option<Client>,
}

impl Default for OlapSink {
    fn default() -> Self {
        Self { client: None }
    }
}

impl OlapSink {
    fn client(&self) -> Result<&Client, SinkError> {
        self.client.as_ref().ok_or_else(|| SinkError::Connection("not connected".into()))
    }

    async fn describe_columns(&self, table: &str) -> HashSet<String> {
        #[derive(clickhouse::Row, serde::Deserialize)]
        struct DescribeRow {
            name: String,
        }
        let client = match self.client.as_ref() {
            Some(c) => c,
            None => return HashSet::new(),
        };
        let sql = format!("DESCRIBE TABLE {table}");
        client
            .query(&sql)
            .fetch_all::<DescribeRow>()
            .await
            .map(|rows| rows.into_iter().map(|r| r.name).collect())
            .unwrap_or_default()
    }

    async fn existing_ids(&self, table: &str, id_column: &str) -> HashSet<String> {
        #[derive(clickhouse::Row, serde::Deserialize)]
        struct IdRow {
            id: String,
        }
        let client = match self.client.as_ref() {
            Some(c) => c,
            None => return HashSet::new(),
        };
        let sql = format!("SELECT {} AS id FROM {table}", quote_ident(id_column));
        client
            .query(&sql)
            .fetch_all::<IdRow>()
            .await
            .map(|rows| rows.into_iter().map(|r| r.id).collect())
            .unwrap_or_default()
    }

    async fn ensure_columns(
        &self,
        table: &str,
        existing: &mut HashSet<String>,
        columns: &[(String, &'static str)],
    ) -> Result<(), SinkError> {
        let client = self.client()?;
        for (name, ty) in columns {
            if existing.contains(name) {
                continue;
            }
            let sql = format!("ALTER TABLE {table} ADD COLUMN IF NOT EXISTS {} Nullable({ty})", quote_ident(name));
            match client.query(&sql).execute().await {
                Ok(()) => {
                    existing.insert(name.clone());
                }
                Err(e) => warn!(table, column = name.as_str(), error = %e, "could not add column"),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SinkAdapter for OlapSink {
    fn kind(&self) -> &'static str {
        "olap"
    }

    #[instrument(skip(self, config))]
    async fn connect(&mut self, config: &SinkConfig) -> Result<(), SinkError> {
        let host = config
            .get("host")
            .and_then(|v| v.as_str())
            .ok_or(SinkError::MissingConfig("host"))?;
        let protocol = Protocol::from_config(config.get("protocol").and_then(|v| v.as_str()));
        let requested_port = config.get("port").and_then(|v| v.as_u64()).map(|p| p as u16);
        let port = match (protocol, requested_port) {
            (Protocol::Native, _) | (_, Some(9000)) => {
                warn!(host, "native ClickHouse protocol requested; this driver speaks HTTP only, using port 8123");
                8123
            }
            (Protocol::Http, Some(p)) => p,
            (Protocol::Http, None) => 8123,
        };
        let database = config.get("database").and_then(|v| v.as_str()).unwrap_or("default");
        let user = config.get("username").and_then(|v| v.as_str()).unwrap_or("default");
        let password = config.get("password").and_then(|v| v.as_str()).unwrap_or("");

        let mut client = Client::default()
            .with_url(format!("http://{host}:{port}"))
            .with_database(database)
            .with_user(user);
        if !password.is_empty() {
            client = client.with_password(password);
        }

        info!(host, port, database, "connected to ClickHouse sink");
        self.client = Some(client);
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.client = None;
    }

    fn map_types(&self, source_schema: &TableSchema, _source_kind: &str) -> TableSchema {
        let columns = source_schema
            .columns
            .iter()
            .map(|col| Column {
                name: col.name.clone(),
                ty: col.ty.clone(),
                nullable: col.nullable,
                length: col.length,
                default_expr: None,
                full_type: Some(clickhouse_type(&col.ty)),
            })
            .collect();
        TableSchema {
            columns,
            primary_key: source_schema.primary_key.clone(),
            foreign_keys: Vec::new(),
            unique_constraints: Vec::new(),
            indexes: Vec::new(),
        }
    }

    #[instrument(skip(self))]
    async fn table_exists(&mut self, table_id: &str, source_kind: &str) -> Result<bool, SinkError> {
        let family = classify(source_kind, table_id);
        let table = destination_table_name(source_kind, table_id, family);
        let client = self.client()?;
        #[derive(clickhouse::Row, serde::Deserialize)]
        struct ExistsRow {
            result: u8,
        }
        let sql = format!("EXISTS TABLE {table}");
        let exists = client
            .query(&sql)
            .fetch_one::<ExistsRow>()
            .await
            .map(|row| row.result == 1)
            .unwrap_or(false);
        Ok(exists)
    }

    #[instrument(skip(self, sink_schema))]
    async fn create_table(
        &mut self,
        table_id: &str,
        sink_schema: &TableSchema,
        source_kind: &str,
        primary_key: &[String],
    ) -> Result<(), SinkError> {
        if self.table_exists(table_id, source_kind).await.unwrap_or(false) {
            debug!(table_id, "table already exists, skipping creation");
            return Ok(());
        }
        let family = classify(source_kind, table_id);
        let table = destination_table_name(source_kind, table_id, family);
        let id_column = primary_key.first().cloned().unwrap_or_else(|| "id".to_string());

        let create_sql = match family {
            TableFamily::FixedDimension | TableFamily::Other => {
                let columns_def: Vec<String> = sink_schema
                    .columns
                    .iter()
                    .map(|c| {
                        let ty = c.full_type.clone().unwrap_or_else(|| clickhouse_type(&c.ty));
                        let ty = if c.nullable { format!("Nullable({ty})") } else { ty };
                        format!("{} {ty}", quote_ident(&c.name))
                    })
                    .collect();
                let order_by = if matches!(family, TableFamily::FixedDimension) {
                    quote_ident(&id_column)
                } else {
                    "tuple()".to_string()
                };
                format!(
                    "CREATE TABLE IF NOT EXISTS {table} ({}) ENGINE = MergeTree() ORDER BY {order_by}",
                    columns_def.join(", ")
                )
            }
            TableFamily::SaasCrmModule => format!(
                "CREATE TABLE IF NOT EXISTS {table} ({} String, load_time DateTime DEFAULT now()) \
                 ENGINE = ReplacingMergeTree(load_time) ORDER BY load_time",
                quote_ident(&id_column)
            ),
            TableFamily::WorkItemRevisioned => {
                if table_id == "workitems_main" {
                    format!(
                        "CREATE TABLE IF NOT EXISTS {table} ({} String) ENGINE = MergeTree() ORDER BY {}",
                        quote_ident(&id_column),
                        quote_ident(&id_column)
                    )
                } else {
                    format!(
                        "CREATE TABLE IF NOT EXISTS {table} (`work_item_id` String, `rev` Int64) \
                         ENGINE = MergeTree() ORDER BY rev"
                    )
                }
            }
            TableFamily::WorkItemLoadTime => format!(
                "CREATE TABLE IF NOT EXISTS {table} (`work_item_id` String, load_time DateTime DEFAULT now()) \
                 ENGINE = ReplacingMergeTree(load_time) ORDER BY load_time"
            ),
        };

        let client = self.client()?;
        client
            .query(&create_sql)
            .execute()
            .await
            .map_err(|e| SinkError::Schema { table: table.clone(), message: e.to_string() })?;
        info!(table, "created ClickHouse table");
        Ok(())
    }

    #[instrument(skip(self, batch))]
    async fn write_data(
        &mut self,
        table_id: &str,
        batch: &Batch,
        source_kind: &str,
        primary_key: &[String],
    ) -> Result<usize, SinkError> {
        if batch.is_empty() {
            return Ok(0);
        }
        let family = classify(source_kind, table_id);
        let table = destination_table_name(source_kind, table_id, family);
        let id_column = primary_key.first().cloned().unwrap_or_else(|| "id".to_string());

        let records: Vec<&Record> = if matches!(family, TableFamily::SaasCrmModule) {
            let existing = self.existing_ids(&table, &id_column).await;
            let filtered: Vec<&Record> = batch
                .iter()
                .filter(|r| match r.get(&id_column) {
                    Some(v) => !existing.contains(&value_as_id_string(v)),
                    None => true,
                })
                .collect();
            if filtered.len() < batch.len() {
                info!(
                    table,
                    total = batch.len(),
                    duplicates = batch.len() - filtered.len(),
                    "dropped already-present records"
                );
            }
            filtered
        } else {
            batch.iter().collect()
        };
        if records.is_empty() {
            return Ok(0);
        }

        let mut existing_columns = self.describe_columns(&table).await;
        let mut sanitizer = ColumnSanitizer::seeded([id_column.as_str(), "load_time", "rev"]);
        let mut all_fields: Vec<String> = records
            .iter()
            .flat_map(|r| r.keys())
            .filter(|k| *k != &id_column && k.as_str() != "rev")
            .cloned()
            .collect();
        all_fields.sort();
        all_fields.dedup();
        let column_map: Vec<(String, String)> = all_fields
            .into_iter()
            .map(|field| {
                let sanitized = sanitizer.sanitize(&field);
                (field, sanitized)
            })
            .collect();
        let to_add: Vec<(String, &'static str)> =
            column_map.iter().map(|(_, col)| (col.clone(), "String")).collect();
        self.ensure_columns(&table, &mut existing_columns, &to_add).await?;

        let has_rev = matches!(family, TableFamily::WorkItemRevisioned) && table_id != "workitems_main";
        let mut column_names = vec![id_column.clone()];
        if has_rev {
            column_names.push("rev".to_string());
        }
        for (_, sanitized) in &column_map {
            column_names.push(sanitized.clone());
        }

        let mut inserted = 0usize;
        for chunk in records.chunks(OLAP_WRITE_BATCH_SIZE) {
            let mut value_rows = Vec::with_capacity(chunk.len());
            for record in chunk {
                let mut row = vec![value_sql(record.get(&id_column).unwrap_or(&Value::Null))];
                if has_rev {
                    row.push(value_sql(record.get("rev").unwrap_or(&Value::Null)));
                }
                for (field, _) in &column_map {
                    row.push(value_sql(record.get(field).unwrap_or(&Value::Null)));
                }
                value_rows.push(format!("({})", row.join(", ")));
            }
            let insert_sql = format!(
                "INSERT INTO {table} ({}) VALUES {}",
                column_names.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", "),
                value_rows.join(", ")
            );
            let client = self.client()?;
            client
                .query(&insert_sql)
                .execute()
                .await
                .map_err(|e| SinkError::Transient { table: table.clone(), message: e.to_string() })?;
            inserted += chunk.len();
        }
        debug!(table, inserted, "wrote batch to ClickHouse");
        Ok(inserted)
    }

    async fn create_indexes(&mut self, table_id: &str, _indexes: &[Index]) -> Result<(), SinkError> {
        debug!(table_id, "ClickHouse sink has no secondary-index concept, skipping");
        Ok(())
    }

    async fn create_unique_constraints(&mut self, table_id: &str, _uniques: &[Index]) -> Result<(), SinkError> {
        debug!(table_id, "ClickHouse sink has no unique-constraint concept, skipping");
        Ok(())
    }

    async fn create_foreign_keys(&mut self, table_id: &str, _fks: &[ForeignKey]) -> Result<(), SinkError> {
        debug!(table_id, "ClickHouse sink has no foreign-key concept, skipping");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizer_replaces_non_alnum_and_resolves_collisions() {
        let mut s = ColumnSanitizer::seeded(["id"]);
        assert_eq!(s.sanitize("First Name"), "first_name");
        assert_eq!(s.sanitize("first-name"), "first_name_1");
        assert_eq!(s.sanitize("2fa_enabled"), "_2fa_enabled");
    }

    #[test]
    fn classify_maps_fixed_workitem_tables() {
        assert_eq!(classify("workitem_saas", "projects"), TableFamily::FixedDimension);
        assert_eq!(classify("workitem_saas", "workitems_updates"), TableFamily::WorkItemRevisioned);
        assert_eq!(classify("workitem_saas", "workitems_comments"), TableFamily::WorkItemLoadTime);
        assert_eq!(classify("crm_saas", "Leads"), TableFamily::SaasCrmModule);
        assert_eq!(classify("postgres", "orders"), TableFamily::Other);
    }

    #[test]
    fn destination_name_prefixes_non_workitem_relational_tables() {
        assert_eq!(destination_table_name("postgres", "orders", TableFamily::Other), "HR_orders");
        assert_eq!(
            destination_table_name("workitem_saas", "projects", TableFamily::FixedDimension),
            "DEVOPS_PROJECTS"
        );
        assert_eq!(
            destination_table_name("workitem_saas", "workitems_updates", TableFamily::WorkItemRevisioned),
            "DEVOPS_WORKITEMS_UPDATES"
        );
        assert_eq!(
            destination_table_name("crm_saas", "Leads", TableFamily::SaasCrmModule),
            "zoho_leads"
        );
    }
}
