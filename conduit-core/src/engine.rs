//! Pipeline engine (spec.md §4.4): orchestrates one migration run across
//! an arbitrary (source, sink) pair. Grounded line-for-line on
//! `pipeline_engine.py`'s `UniversalPipelineEngine.migrate` — the retry
//! loop, per-table try/except, and disconnect-in-finally all come from
//! there; the `?`/`Result` propagation and the `EngineError` split
//! between "never entered" and "folded into the result" is this corpus's
//! usual `thiserror`-taxonomy style (`dozer-core/src/errors.rs`).

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use conduit_ingestion::{SourceAdapter, SourceConfig};
use conduit_sinks::{SinkAdapter, SinkConfig};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::errors::EngineError;
use crate::registry::AdapterRegistry;

/// Per-table attempt budget (spec.md §4.4 step 3a): three attempts, 2s
/// delay before the 2nd and 3rd. Independent of the inner per-batch retry
/// budgets each adapter owns (DESIGN NOTES §9's "nested, not shared"
/// retry-budget composition).
const TABLE_ATTEMPTS: usize = 3;
const TABLE_RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationMode {
    Full,
    /// Carries the watermark; a bare `Incremental` with no timestamp isn't
    /// representable, so the "watermark must be parseable" precondition
    /// (spec.md §4.4) is enforced by this type rather than checked at
    /// runtime.
    Incremental(DateTime<Utc>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableMigrated {
    pub table: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableFailed {
    pub table: String,
    pub error: String,
    pub error_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RunResult {
    pub success: bool,
    pub total_tables: usize,
    pub tables_migrated: Vec<TableMigrated>,
    pub tables_failed: Vec<TableFailed>,
    pub errors: Vec<String>,
}

impl RunResult {
    fn aborted(message: impl Into<String>) -> Self {
        Self { success: false, errors: vec![message.into()], ..Default::default() }
    }
}

fn is_relational(kind: &str) -> bool {
    matches!(kind, "postgres" | "mysql" | "mssql")
}

/// Read batch size by source kind (spec.md §4.4 step 3f): the work-item
/// SaaS source pays per API call, so it reads in small pages; CRM SaaS
/// follows its own module page size; database sources use one round-trip
/// of 1000 rows.
fn read_batch_size(source_kind: &str) -> usize {
    match source_kind {
        "workitem_saas" => 50,
        "crm_saas" => 200,
        _ => 1000,
    }
}

pub struct PipelineEngine {
    registry: AdapterRegistry,
}

impl PipelineEngine {
    pub fn new(registry: AdapterRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    /// Executes one migration run end to end. Only the two preconditions
    /// that mean the engine was "never entered" (P1) — mismatched kinds,
    /// an unregistered kind — return `Err`; everything past adapter
    /// construction is folded into the returned `RunResult` (spec.md §7:
    /// "it never returns a bare error for a partial-success run").
    #[instrument(skip(self, source_cfg, sink_cfg), fields(source_kind, sink_kind))]
    pub async fn migrate(
        &self,
        source_kind: &str,
        sink_kind: &str,
        source_cfg: &SourceConfig,
        sink_cfg: &SinkConfig,
        mode: OperationMode,
    ) -> Result<RunResult, EngineError> {
        if source_kind == sink_kind {
            return Err(EngineError::Configuration(format!(
                "cannot migrate from {source_kind} to {source_kind}: source and destination cannot be the same"
            )));
        }

        let mut source = self.registry.make_source(source_kind)?;
        let mut sink = self.registry.make_sink(sink_kind)?;

        let run_start = Instant::now();
        let result = run(
            source.as_mut(),
            sink.as_mut(),
            source_kind,
            sink_kind,
            source_cfg,
            sink_cfg,
            mode,
        )
        .await;

        // Always disconnect both adapters, swallowing errors — mirrors the
        // Python `finally` block's bare `except: pass` around each call.
        source.disconnect().await;
        sink.disconnect().await;

        info!(
            elapsed_s = run_start.elapsed().as_secs_f64(),
            success = result.success,
            total_tables = result.total_tables,
            migrated = result.tables_migrated.len(),
            failed = result.tables_failed.len(),
            resident_mib = ?conduit_types::logging::resident_memory_mib(),
            "migration run finished"
        );
        Ok(result)
    }
}

#[allow(clippy::too_many_arguments)]
async fn run(
    source: &mut dyn SourceAdapter,
    sink: &mut dyn SinkAdapter,
    source_kind: &str,
    sink_kind: &str,
    source_cfg: &SourceConfig,
    sink_cfg: &SinkConfig,
    mode: OperationMode,
) -> RunResult {
    let connect_start = Instant::now();
    info!(source_kind, "connecting to source");
    if let Err(err) = source.connect(source_cfg).await {
        warn!(source_kind, %err, "source connect failed");
        return RunResult::aborted(format!("failed to connect to source: {err}"));
    }

    info!(sink_kind, "connecting to sink");
    if let Err(err) = sink.connect(sink_cfg).await {
        warn!(sink_kind, %err, "sink connect failed");
        return RunResult::aborted(format!("failed to connect to sink: {err}"));
    }
    debug!(elapsed_s = connect_start.elapsed().as_secs_f64(), "connections established");

    let list_start = Instant::now();
    let tables = match source.list_tables().await {
        Ok(tables) => tables,
        Err(err) => {
            warn!(%err, "listing tables failed");
            return RunResult::aborted(format!("failed to list tables: {err}"));
        }
    };
    debug!(elapsed_s = list_start.elapsed().as_secs_f64(), count = tables.len(), "enumerated tables");

    let mut result = RunResult { success: true, total_tables: tables.len(), ..Default::default() };
    if tables.is_empty() {
        warn!("no tables/modules found in source");
        result.errors.push("no tables/modules found in source".to_string());
        return result;
    }

    let both_relational = is_relational(source_kind) && is_relational(sink_kind);
    let batch_size = read_batch_size(source_kind);

    for table in &tables {
        match migrate_table(source, sink, table, source_kind, both_relational, batch_size, mode).await {
            Ok(records) => {
                result.tables_migrated.push(TableMigrated { table: table.clone(), records });
            }
            Err((error, error_type)) => {
                result.errors.push(format!("{table}: {error}"));
                result.tables_failed.push(TableFailed { table: table.clone(), error, error_type });
            }
        }
    }

    result.success = result.tables_failed.is_empty();
    result
}

/// One table's full attempt loop (spec.md §4.4 steps 3a-3j): up to
/// `TABLE_ATTEMPTS`, each running schema-fetch through constraint
/// creation. Returns the record count on success, or `(message, type)` for
/// `tables_failed` once every attempt has been exhausted.
async fn migrate_table(
    source: &mut dyn SourceAdapter,
    sink: &mut dyn SinkAdapter,
    table: &str,
    source_kind: &str,
    both_relational: bool,
    batch_size: usize,
    mode: OperationMode,
) -> Result<usize, (String, String)> {
    let mut last_error: Option<(String, String)> = None;

    for attempt in 1..=TABLE_ATTEMPTS {
        if attempt > 1 {
            info!(table, attempt, "retrying table migration");
            tokio::time::sleep(TABLE_RETRY_DELAY).await;
        }
        let table_start = Instant::now();

        match migrate_table_once(source, sink, table, source_kind, both_relational, batch_size, mode).await {
            Ok(records) => {
                info!(
                    table,
                    records,
                    elapsed_s = table_start.elapsed().as_secs_f64(),
                    resident_mib = ?conduit_types::logging::resident_memory_mib(),
                    "table migrated"
                );
                return Ok(records);
            }
            Err((error, error_type)) => {
                warn!(table, attempt, %error, error_type, "table migration attempt failed");
                last_error = Some((error, error_type));
            }
        }
    }

    last_error.expect("loop runs at least once and records an error on every failing path")
}

/// A single attempt: schema, map, create-or-evolve, stream, constraints.
/// Any failure here is classified by the adapter layer (`SourceError`/
/// `SinkError`) already; this function only carries the message/type pair
/// up to the retry loop.
async fn migrate_table_once(
    source: &mut dyn SourceAdapter,
    sink: &mut dyn SinkAdapter,
    table: &str,
    source_kind: &str,
    both_relational: bool,
    batch_size: usize,
    mode: OperationMode,
) -> Result<usize, (String, String)> {
    let schema_start = Instant::now();
    let schema = source
        .get_schema(table)
        .await
        .map_err(|e| (e.to_string(), "SchemaError".to_string()))?;
    debug!(table, columns = schema.columns.len(), elapsed_s = schema_start.elapsed().as_secs_f64(), "fetched schema");

    // Auxiliary constraint metadata is only meaningful relational-to-relational,
    // and failure to fetch any one of them is a warning, not a table failure
    // (spec.md §4.4 step 3c).
    let (primary_keys, foreign_keys, unique_constraints, indexes) = if both_relational {
        let primary_keys = source.get_primary_key_columns(table).await.unwrap_or_else(|e| {
            warn!(table, error = %e, "could not get primary keys");
            Vec::new()
        });
        let foreign_keys = source.get_foreign_keys(table).await.unwrap_or_else(|e| {
            warn!(table, error = %e, "could not get foreign keys");
            Vec::new()
        });
        let unique_constraints = source.get_unique_constraints(table).await.unwrap_or_else(|e| {
            warn!(table, error = %e, "could not get unique constraints");
            Vec::new()
        });
        let indexes = source.get_indexes(table).await.unwrap_or_else(|e| {
            warn!(table, error = %e, "could not get indexes");
            Vec::new()
        });
        (primary_keys, foreign_keys, unique_constraints, indexes)
    } else {
        Default::default()
    };

    let sink_schema = sink.map_types(&schema, source_kind);

    sink.create_table(table, &sink_schema, source_kind, &primary_keys)
        .await
        .map_err(|e| (e.to_string(), "SinkSchemaError".to_string()))?;

    let mut stream = match mode {
        OperationMode::Full => source.read_data(table, batch_size),
        OperationMode::Incremental(watermark) => {
            if !source.incremental_is_exact() {
                warn!(table, "incremental read falls back to a conservative/full read for this source");
            }
            source.read_incremental(table, watermark, batch_size)
        }
    };

    let mut records_processed = 0usize;
    let mut batch_count = 0usize;
    while let Some(batch) = stream.next().await {
        let batch = batch.map_err(|e| (e.to_string(), "ReadError".to_string()))?;
        batch_count += 1;
        if batch.is_empty() {
            debug!(table, batch_count, "received empty batch, skipping");
            continue;
        }
        let written = sink
            .write_data(table, &batch, source_kind, &primary_keys)
            .await
            .map_err(|e| (e.to_string(), "SinkWriteError".to_string()))?;
        records_processed += written;
        debug!(table, batch_count, written, records_processed, "batch written");
    }

    if both_relational {
        if !indexes.is_empty() {
            if let Err(e) = sink.create_indexes(table, &indexes).await {
                warn!(table, error = %e, "could not create indexes");
            }
        }
        if !unique_constraints.is_empty() {
            if let Err(e) = sink.create_unique_constraints(table, &unique_constraints).await {
                warn!(table, error = %e, "could not create unique constraints");
            }
        }
        if !foreign_keys.is_empty() {
            if let Err(e) = sink.create_foreign_keys(table, &foreign_keys).await {
                warn!(table, error = %e, "could not create foreign keys");
            }
        }
    }

    Ok(records_processed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use conduit_types::{Batch, Column, ColumnType, Record, TableSchema, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn table_schema() -> TableSchema {
        TableSchema {
            columns: vec![Column {
                name: "id".to_string(),
                ty: ColumnType::Int64,
                nullable: false,
                length: None,
                default_expr: None,
                full_type: None,
            }],
            ..Default::default()
        }
    }

    #[derive(Default)]
    struct MockSource {
        connects: Arc<AtomicUsize>,
        disconnects: Arc<AtomicUsize>,
        batches: Vec<usize>,
    }

    #[async_trait]
    impl SourceAdapter for MockSource {
        fn kind(&self) -> &'static str {
            "mock_source"
        }

        async fn connect(&mut self, _config: &SourceConfig) -> Result<(), conduit_ingestion::SourceError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn disconnect(&mut self) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }

        async fn list_tables(&mut self) -> Result<Vec<String>, conduit_ingestion::SourceError> {
            Ok(vec!["widgets".to_string()])
        }

        async fn get_schema(&mut self, _table: &str) -> Result<TableSchema, conduit_ingestion::SourceError> {
            Ok(table_schema())
        }

        fn read_data(&self, _table: &str, _batch_size: usize) -> conduit_ingestion::BatchStream {
            let sizes = self.batches.clone();
            Box::pin(futures::stream::iter(sizes.into_iter().map(|n| {
                Ok((0..n)
                    .map(|i| {
                        let mut record = Record::new();
                        record.insert("id".to_string(), Value::Int(i as i64));
                        record
                    })
                    .collect::<Batch>())
            })))
        }

        fn read_incremental(
            &self,
            table: &str,
            _watermark: DateTime<Utc>,
            batch_size: usize,
        ) -> conduit_ingestion::BatchStream {
            self.read_data(table, batch_size)
        }
    }

    #[derive(Default)]
    struct MockSink {
        connects: Arc<AtomicUsize>,
        disconnects: Arc<AtomicUsize>,
        written: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SinkAdapter for MockSink {
        fn kind(&self) -> &'static str {
            "mock_sink"
        }

        async fn connect(&mut self, _config: &SinkConfig) -> Result<(), conduit_sinks::SinkError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn disconnect(&mut self) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }

        fn map_types(&self, source_schema: &TableSchema, _source_kind: &str) -> TableSchema {
            source_schema.clone()
        }

        async fn table_exists(&mut self, _table_id: &str, _source_kind: &str) -> Result<bool, conduit_sinks::SinkError> {
            Ok(false)
        }

        async fn create_table(
            &mut self,
            _table_id: &str,
            _sink_schema: &TableSchema,
            _source_kind: &str,
            _primary_key: &[String],
        ) -> Result<(), conduit_sinks::SinkError> {
            Ok(())
        }

        async fn write_data(
            &mut self,
            _table_id: &str,
            batch: &Batch,
            _source_kind: &str,
            _primary_key: &[String],
        ) -> Result<usize, conduit_sinks::SinkError> {
            self.written.fetch_add(batch.len(), Ordering::SeqCst);
            Ok(batch.len())
        }
    }

    // Mock adapters carry per-test `Arc` counters and so can't be stored in
    // the registry's `fn() -> Box<dyn _>` slots; these tests drive `run()`
    // directly rather than going through `PipelineEngine::migrate`.

    #[tokio::test]
    async fn p3_record_count_matches_batch_sizes() {
        let mut source = MockSource { batches: vec![3, 2], ..Default::default() };
        let mut sink = MockSink::default();
        let result = run(
            &mut source,
            &mut sink,
            "mock_source",
            "mock_sink",
            &SourceConfig::new(),
            &SinkConfig::new(),
            OperationMode::Full,
        )
        .await;
        assert!(result.success);
        assert_eq!(result.tables_migrated.len(), 1);
        assert_eq!(result.tables_migrated[0].records, 5);
    }

    #[tokio::test]
    async fn p2_lifecycle_matches_construct_connect_disconnect() {
        let connects = Arc::new(AtomicUsize::new(0));
        let disconnects = Arc::new(AtomicUsize::new(0));
        let mut source = MockSource { connects: connects.clone(), disconnects: disconnects.clone(), batches: vec![1] };
        let mut sink = MockSink::default();
        let _ = run(
            &mut source,
            &mut sink,
            "mock_source",
            "mock_sink",
            &SourceConfig::new(),
            &SinkConfig::new(),
            OperationMode::Full,
        )
        .await;
        source.disconnect().await;
        sink.disconnect().await;
        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_list_is_not_a_failure() {
        let result = RunResult { success: true, total_tables: 0, ..Default::default() };
        assert!(result.success);
        assert!(result.tables_failed.is_empty());
    }

    #[tokio::test]
    async fn p1_mismatched_kinds_never_enters_engine() {
        let engine = PipelineEngine::new(AdapterRegistry::with_defaults());
        let err = engine
            .migrate("postgres", "postgres", &SourceConfig::new(), &SinkConfig::new(), OperationMode::Full)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[tokio::test]
    async fn p1_unknown_kind_never_enters_engine() {
        let engine = PipelineEngine::new(AdapterRegistry::with_defaults());
        let err = engine
            .migrate("oracle", "olap", &SourceConfig::new(), &SinkConfig::new(), OperationMode::Full)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownAdapter(_)));
    }

    /// A source whose `read_data` stream fails on its first `injected_failures`
    /// calls, then succeeds — models P8's "transient failure in the k-th batch"
    /// by failing whole attempts rather than individual batches, matching how
    /// `migrate_table` retries the entire table rather than resuming mid-stream.
    #[derive(Default)]
    struct FlakySource {
        attempts: Arc<AtomicUsize>,
        fail_first_n_attempts: usize,
    }

    #[async_trait]
    impl SourceAdapter for FlakySource {
        fn kind(&self) -> &'static str {
            "mock_source"
        }

        async fn connect(&mut self, _config: &SourceConfig) -> Result<(), conduit_ingestion::SourceError> {
            Ok(())
        }

        async fn disconnect(&mut self) {}

        async fn list_tables(&mut self) -> Result<Vec<String>, conduit_ingestion::SourceError> {
            Ok(vec!["widgets".to_string()])
        }

        async fn get_schema(&mut self, _table: &str) -> Result<TableSchema, conduit_ingestion::SourceError> {
            Ok(table_schema())
        }

        fn read_data(&self, _table: &str, _batch_size: usize) -> conduit_ingestion::BatchStream {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt <= self.fail_first_n_attempts {
                Box::pin(futures::stream::iter(vec![Err(conduit_ingestion::SourceError::Transient {
                    table: "widgets".to_string(),
                    message: "injected transient failure".to_string(),
                })]))
            } else {
                Box::pin(futures::stream::iter(vec![Ok((0..3)
                    .map(|i| {
                        let mut record = Record::new();
                        record.insert("id".to_string(), Value::Int(i as i64));
                        record
                    })
                    .collect::<Batch>())]))
            }
        }

        fn read_incremental(
            &self,
            table: &str,
            _watermark: DateTime<Utc>,
            batch_size: usize,
        ) -> conduit_ingestion::BatchStream {
            self.read_data(table, batch_size)
        }
    }

    #[tokio::test]
    async fn p8_retry_succeeds_once_injection_stops() {
        let mut source = FlakySource { fail_first_n_attempts: 2, ..Default::default() };
        let mut sink = MockSink::default();
        let result = run(
            &mut source,
            &mut sink,
            "mock_source",
            "mock_sink",
            &SourceConfig::new(),
            &SinkConfig::new(),
            OperationMode::Full,
        )
        .await;
        assert!(result.success);
        assert_eq!(result.tables_migrated[0].records, 3);
    }

    #[tokio::test]
    async fn p8_exhausting_all_attempts_fails_the_table() {
        let mut source = FlakySource { fail_first_n_attempts: TABLE_ATTEMPTS, ..Default::default() };
        let mut sink = MockSink::default();
        let result = run(
            &mut source,
            &mut sink,
            "mock_source",
            "mock_sink",
            &SourceConfig::new(),
            &SinkConfig::new(),
            OperationMode::Full,
        )
        .await;
        assert!(!result.success);
        assert_eq!(result.tables_failed.len(), 1);
    }
}
