use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use conduit_core::PipelineEngine;
use tracing::info;
use tracing_actix_web::TracingLogger;

use crate::routes;

/// HTTP control plane (spec.md §4.5). Grounded on
/// `dozer-api/src/rest/api_server.rs`'s `ApiServer::new`/`run` shape,
/// without the auth/OpenAPI-generation machinery that crate also carries
/// — this surface has exactly three routes and no per-endpoint schema.
#[derive(Clone)]
pub struct ApiServer {
    host: String,
    port: u16,
}

impl Default for ApiServer {
    fn default() -> Self {
        Self { host: "0.0.0.0".to_string(), port: 5011 }
    }
}

impl ApiServer {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    /// Runs until the process is signaled to stop. `engine` is shared
    /// across all worker threads (spec.md §5: "each HTTP request runs on
    /// its own worker thread"); each request gets its own migration run,
    /// there is no run-level state shared back into the registry.
    pub async fn run(&self, engine: Arc<PipelineEngine>) -> std::io::Result<()> {
        let address = format!("{}:{}", self.host, self.port);
        info!(address = address.as_str(), "starting conduit API server");
        HttpServer::new(move || {
            App::new()
                .wrap(TracingLogger::default())
                .wrap(Cors::permissive())
                .app_data(web::Data::new(engine.clone()))
                .configure(routes::configure)
        })
        .bind(&address)?
        .run()
        .await
    }
}
