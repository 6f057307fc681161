use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use conduit_core::EngineError;
use thiserror::Error;

/// Control-plane error taxonomy. Grounded on `dozer-api/src/errors.rs`'s
/// `ApiError` + `ResponseError` pairing; validation failures and engine
/// failures that mean "the engine was never entered" (spec.md §7) both
/// surface as 400, matching `app.py`'s `except ValueError` branch.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl actix_web::error::ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Engine(e) if e.is_client_error() => StatusCode::BAD_REQUEST,
            ApiError::Engine(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(serde_json::json!({
            "error": self.to_string(),
            "success": false,
        }))
    }
}
