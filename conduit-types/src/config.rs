//! Process-wide service configuration, read once at startup.
//!
//! Mirrors `original_source/universal_migration_service/app.py`'s
//! `UNIVERSAL_MIGRATION_SERVICE_PORT`/`_HOST` environment variables, loaded
//! through an optional `.env` file the way the original uses
//! `python-dotenv`.

use std::env;
use std::net::IpAddr;

const ENV_PREFIX: &str = "UNIVERSAL_MIGRATION_SERVICE";
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 5011;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    pub log_filter: String,
}

impl ServiceConfig {
    /// Loads `.env` (if present) then reads env vars, falling back to the
    /// hard defaults the original service used.
    pub fn from_env() -> Self {
        if let Err(err) = dotenvy::dotenv() {
            if !matches!(err, dotenvy::Error::Io(ref io) if io.kind() == std::io::ErrorKind::NotFound)
            {
                tracing::warn!(error = %err, "failed to load .env file");
            }
        }

        let host = env::var(format!("{ENV_PREFIX}_HOST")).unwrap_or_else(|_| DEFAULT_HOST.into());
        if host.parse::<IpAddr>().is_err() && host != "0.0.0.0" && host != "localhost" {
            tracing::warn!(%host, "service host does not look like an IP address or 'localhost'");
        }

        let port = env::var(format!("{ENV_PREFIX}_PORT"))
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        let log_filter =
            env::var("RUST_LOG").unwrap_or_else(|_| "info,conduit=debug".to_string());

        Self {
            host,
            port,
            log_filter,
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            log_filter: "info".to_string(),
        }
    }
}
