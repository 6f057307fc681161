use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conduit_types::{Batch, ForeignKey, Index, TableSchema};
use futures::Stream;

use crate::error::SourceError;

/// Finite lazy sequence of batches (DESIGN NOTES §9, "Generators in the
/// source"): a bounded stream produced by a task that terminates on
/// end-of-data or error. The last item may be an `Err` — exhaustion is
/// signaled by the stream simply ending.
pub type BatchStream = Pin<Box<dyn Stream<Item = Result<Batch, SourceError>> + Send>>;

/// Kind-specific connection parameters. Adapters read the keys they need
/// and ignore the rest (spec.md §6: "unknown keys ignored").
pub type SourceConfig = serde_json::Map<String, serde_json::Value>;

/// Capability set every source must implement (spec.md §4.2). One adapter
/// instance is single-tenant (I1): it holds at most one live connection.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Registry key this adapter was constructed under (e.g. `"postgres"`).
    fn kind(&self) -> &'static str;

    async fn connect(&mut self, config: &SourceConfig) -> Result<(), SourceError>;

    /// Idempotent.
    async fn disconnect(&mut self);

    /// Stateless probe: connects, then disconnects, reporting whether both
    /// steps succeeded. The default implementation satisfies spec.md's
    /// "constructs, connects, closes" sequence for any adapter that
    /// doesn't need a bespoke probe.
    async fn test_connection(&mut self, config: &SourceConfig) -> bool {
        match self.connect(config).await {
            Ok(()) => {
                self.disconnect().await;
                true
            }
            Err(_) => false,
        }
    }

    /// Every table the adapter will be asked about this run. I2: these are
    /// exactly the identifiers `get_schema`/`read_data`/`read_incremental`
    /// accept.
    async fn list_tables(&mut self) -> Result<Vec<String>, SourceError>;

    /// Deterministic within a run.
    async fn get_schema(&mut self, table: &str) -> Result<TableSchema, SourceError>;

    /// Finite; each batch has at most `batch_size` records, the last batch
    /// may be shorter or empty.
    fn read_data(&self, table: &str, batch_size: usize) -> BatchStream;

    /// Yields only records whose modified-time marker is strictly greater
    /// than `watermark`. Adapters that cannot honor this must fall back to
    /// `read_data` and report `incremental_is_exact() == false` rather than
    /// silently returning zero rows.
    fn read_incremental(&self, table: &str, watermark: DateTime<Utc>, batch_size: usize)
        -> BatchStream;

    /// Whether `read_incremental` is an exact high-watermark filter or a
    /// conservative fallback (DESIGN.md "Open Question decisions" — a
    /// policy knob, not an invariant). Defaults to exact; adapters that
    /// fall back override this.
    fn incremental_is_exact(&self) -> bool {
        true
    }

    /// Optional capabilities used only when the sink is relational. Empty
    /// return is legal and means "unknown or none".
    async fn get_primary_key_columns(&mut self, _table: &str) -> Result<Vec<String>, SourceError> {
        Ok(Vec::new())
    }

    async fn get_foreign_keys(&mut self, _table: &str) -> Result<Vec<ForeignKey>, SourceError> {
        Ok(Vec::new())
    }

    async fn get_unique_constraints(&mut self, _table: &str) -> Result<Vec<Index>, SourceError> {
        Ok(Vec::new())
    }

    async fn get_indexes(&mut self, _table: &str) -> Result<Vec<Index>, SourceError> {
        Ok(Vec::new())
    }
}
