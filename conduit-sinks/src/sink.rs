use async_trait::async_trait;
use conduit_types::{Batch, ForeignKey, Index, TableSchema};

use crate::error::SinkError;

/// Kind-specific connection parameters, mirroring `conduit_ingestion::SourceConfig`
/// (spec.md §6: "unknown keys ignored").
pub type SinkConfig = serde_json::Map<String, serde_json::Value>;

/// Default sub-batch size for `write_data` (spec.md §4.3). Individual sinks
/// override this where the engine family benefits from a different size
/// (the OLAP sink uses a larger bulk size).
pub const DEFAULT_WRITE_BATCH_SIZE: usize = 1000;

/// Capability set every sink must implement (spec.md §4.3). Single-tenant,
/// same as `SourceAdapter`: one adapter instance holds at most one live
/// connection.
#[async_trait]
pub trait SinkAdapter: Send + Sync {
    /// Registry key this adapter was constructed under (e.g. `"clickhouse"`).
    fn kind(&self) -> &'static str;

    async fn connect(&mut self, config: &SinkConfig) -> Result<(), SinkError>;

    /// Idempotent.
    async fn disconnect(&mut self);

    async fn test_connection(&mut self, config: &SinkConfig) -> bool {
        match self.connect(config).await {
            Ok(()) => {
                self.disconnect().await;
                true
            }
            Err(_) => false,
        }
    }

    /// Pure, total: translates a source column descriptor into a
    /// sink-native one. Never fails; an unrecognized semantic type falls
    /// back to the sink's widest string type with a logged warning.
    /// `source_kind` lets a sink apply kind-specific policy (the OLAP sink
    /// stores every SaaS CRM field as nullable string regardless of the
    /// inferred type).
    fn map_types(&self, source_schema: &TableSchema, source_kind: &str) -> TableSchema;

    async fn table_exists(&mut self, table_id: &str, source_kind: &str) -> Result<bool, SinkError>;

    /// Create-if-not-exists; never drops or recreates an existing table.
    async fn create_table(
        &mut self,
        table_id: &str,
        sink_schema: &TableSchema,
        source_kind: &str,
        primary_key: &[String],
    ) -> Result<(), SinkError>;

    /// Writes `batch`, sub-batched at the sink's own limit. Returns the
    /// number of records actually written (may be fewer than `batch.len()`
    /// when duplicate suppression drops already-present rows). May evolve
    /// the destination schema first (add missing columns as nullable).
    async fn write_data(
        &mut self,
        table_id: &str,
        batch: &Batch,
        source_kind: &str,
        primary_key: &[String],
    ) -> Result<usize, SinkError>;

    /// Best-effort; logs and returns `Ok(())` rather than failing the run
    /// on a duplicate-name or violating-data error (spec.md §4.3).
    async fn create_indexes(&mut self, _table_id: &str, _indexes: &[Index]) -> Result<(), SinkError> {
        Ok(())
    }

    async fn create_unique_constraints(
        &mut self,
        _table_id: &str,
        _uniques: &[Index],
    ) -> Result<(), SinkError> {
        Ok(())
    }

    async fn create_foreign_keys(&mut self, _table_id: &str, _fks: &[ForeignKey]) -> Result<(), SinkError> {
        Ok(())
    }
}
