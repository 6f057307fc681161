use std::sync::Arc;

use actix_web::{get, post, web, HttpResponse};
use chrono::{DateTime, Utc};
use conduit_core::{OperationMode, PipelineEngine};
use conduit_ingestion::SourceAdapter;
use conduit_sinks::SinkAdapter;
use tracing::{info, instrument};

use crate::errors::ApiError;
use crate::models::{HealthResponse, MigrateRequest, TestConnectionRequest, TestConnectionResponse};

/// Accepts the same `Z`-suffixed or offset ISO-8601 forms the original's
/// `datetime.fromisoformat(s.replace('Z', '+00:00'))` did.
fn parse_watermark(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc))
}

#[get("/health")]
pub async fn health(engine: web::Data<Arc<PipelineEngine>>) -> HttpResponse {
    let registry = engine.registry();
    HttpResponse::Ok().json(HealthResponse {
        status: "healthy",
        service: "conduit",
        available_sources: registry.list_sources(),
        available_destinations: registry.list_sinks(),
    })
}

#[post("/migrate")]
#[instrument(skip(engine, body))]
pub async fn migrate(
    engine: web::Data<Arc<PipelineEngine>>,
    body: web::Json<MigrateRequest>,
) -> Result<HttpResponse, ApiError> {
    let req = body.into_inner();

    let mode = match req.operation_type.as_str() {
        "full" => OperationMode::Full,
        "incremental" => {
            let raw = req.last_sync_time.as_deref().ok_or_else(|| {
                ApiError::Validation("last_sync_time is required for incremental migration".to_string())
            })?;
            let watermark = parse_watermark(raw)
                .map_err(|e| ApiError::Validation(format!("invalid last_sync_time format: {e}")))?;
            OperationMode::Incremental(watermark)
        }
        other => {
            return Err(ApiError::Validation(format!(
                "operation_type must be 'full' or 'incremental', got '{other}'"
            )))
        }
    };

    info!(
        source_type = req.source_type.as_str(),
        dest_type = req.dest_type.as_str(),
        operation_type = req.operation_type.as_str(),
        "starting migration"
    );
    let result = engine
        .migrate(&req.source_type, &req.dest_type, &req.source, &req.destination, mode)
        .await?;

    let mut response = if result.success { HttpResponse::Ok() } else { HttpResponse::InternalServerError() };
    Ok(response.json(result))
}

#[post("/test-connection")]
pub async fn test_connection(
    engine: web::Data<Arc<PipelineEngine>>,
    body: web::Json<TestConnectionRequest>,
) -> Result<HttpResponse, ApiError> {
    let req = body.into_inner();
    let registry = engine.registry();

    let (valid, error) = match req.kind.as_str() {
        "source" => match registry.make_source(&req.adapter_type) {
            Ok(mut adapter) => (adapter.test_connection(&req.config).await, None),
            Err(e) => (false, Some(e.to_string())),
        },
        "destination" => match registry.make_sink(&req.adapter_type) {
            Ok(mut adapter) => (adapter.test_connection(&req.config).await, None),
            Err(e) => (false, Some(e.to_string())),
        },
        other => (false, Some(format!("type must be 'source' or 'destination', got '{other}'"))),
    };

    // Never a non-200 status here (spec.md §4.5): a failed probe is
    // reported *in* the body, not as an HTTP error.
    Ok(HttpResponse::Ok().json(TestConnectionResponse { valid, error }))
}
