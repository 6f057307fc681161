//! Request/response DTOs for the HTTP surface (spec.md §4.5). JSON shapes
//! grounded on `app.py`'s `/migrate`/`/test-connection`/`/health` bodies;
//! `conduit_core::RunResult` is returned as-is from `/migrate` rather than
//! re-wrapped, since its field names already match the original's
//! `{success, total_tables, tables_migrated, tables_failed, errors}`.

use conduit_ingestion::SourceConfig;
use conduit_sinks::SinkConfig;
use serde::{Deserialize, Serialize};

fn default_operation_type() -> String {
    "full".to_string()
}

#[derive(Debug, Deserialize)]
pub struct MigrateRequest {
    pub source_type: String,
    pub dest_type: String,
    pub source: SourceConfig,
    pub destination: SinkConfig,
    #[serde(default = "default_operation_type")]
    pub operation_type: String,
    pub last_sync_time: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TestConnectionRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub adapter_type: String,
    pub config: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct TestConnectionResponse {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub available_sources: Vec<&'static str>,
    pub available_destinations: Vec<&'static str>,
}
