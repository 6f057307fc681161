use std::process;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use conduit_api::ApiServer;
use conduit_core::{AdapterRegistry, OperationMode, PipelineEngine};
use conduit_types::config::ServiceConfig;
use tracing::error;

#[derive(Parser, Debug)]
#[command(author, version, name = "conduit", about = "Relational/SaaS-to-warehouse migration engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP control plane (spec.md §4.5).
    Serve(Serve),
    /// Run a single migration and exit.
    Migrate(Migrate),
}

#[derive(Debug, Args)]
struct Serve {
    /// Defaults to `UNIVERSAL_MIGRATION_SERVICE_HOST`/`.env`, then "0.0.0.0".
    #[arg(long)]
    host: Option<String>,
    /// Defaults to `UNIVERSAL_MIGRATION_SERVICE_PORT`/`.env`, then 5011.
    #[arg(long)]
    port: Option<u16>,
}

#[derive(Debug, Args)]
struct Migrate {
    /// Registered source adapter kind, e.g. "postgres", "crm_saas".
    #[arg(long)]
    source_type: String,
    /// Registered sink adapter kind, e.g. "olap", "mysql".
    #[arg(long)]
    dest_type: String,
    /// Path to a JSON file with the source adapter's connection config.
    #[arg(long)]
    source_config: String,
    /// Path to a JSON file with the destination adapter's connection config.
    #[arg(long)]
    dest_config: String,
    /// "full" (default) or "incremental".
    #[arg(long, default_value = "full")]
    operation_type: String,
    /// Required when --operation-type=incremental; RFC3339 timestamp.
    #[arg(long)]
    last_sync_time: Option<String>,
}

fn main() {
    let cli = Cli::parse();
    let service_config = ServiceConfig::from_env();
    conduit_types::logging::init(&service_config.log_filter);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start tokio runtime: {e}");
            process::exit(1);
        }
    };

    let exit_code = runtime.block_on(run(cli, service_config));
    process::exit(exit_code);
}

async fn run(cli: Cli, service_config: ServiceConfig) -> i32 {
    let engine = Arc::new(PipelineEngine::new(AdapterRegistry::with_defaults()));

    match cli.command {
        Command::Serve(serve) => {
            let host = serve.host.unwrap_or(service_config.host);
            let port = serve.port.unwrap_or(service_config.port);
            let server = ApiServer::new(host, port);
            if let Err(e) = server.run(engine).await {
                error!(error = %e, "API server exited with an error");
                return 1;
            }
            0
        }
        Command::Migrate(migrate) => run_migrate(engine, migrate).await,
    }
}

async fn run_migrate(engine: Arc<PipelineEngine>, migrate: Migrate) -> i32 {
    let source_cfg = match read_config(&migrate.source_config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(path = migrate.source_config.as_str(), error = %e, "failed to read source config");
            return 1;
        }
    };
    let dest_cfg = match read_config(&migrate.dest_config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(path = migrate.dest_config.as_str(), error = %e, "failed to read destination config");
            return 1;
        }
    };

    let mode = match migrate.operation_type.as_str() {
        "full" => OperationMode::Full,
        "incremental" => {
            let raw = match migrate.last_sync_time.as_deref() {
                Some(raw) => raw,
                None => {
                    error!("--last-sync-time is required for --operation-type=incremental");
                    return 1;
                }
            };
            match chrono::DateTime::parse_from_rfc3339(raw) {
                Ok(dt) => OperationMode::Incremental(dt.with_timezone(&chrono::Utc)),
                Err(e) => {
                    error!(error = %e, "invalid --last-sync-time");
                    return 1;
                }
            }
        }
        other => {
            error!("--operation-type must be 'full' or 'incremental', got '{other}'");
            return 1;
        }
    };

    let result = match engine
        .migrate(&migrate.source_type, &migrate.dest_type, &source_cfg, &dest_cfg, mode)
        .await
    {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "migration never started");
            return 1;
        }
    };

    match serde_json::to_string_pretty(&result) {
        Ok(json) => println!("{json}"),
        Err(e) => error!(error = %e, "failed to serialize migration result"),
    }

    if result.success {
        0
    } else {
        1
    }
}

fn read_config(path: &str) -> Result<serde_json::Map<String, serde_json::Value>, String> {
    let raw = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    match serde_json::from_str(&raw).map_err(|e| e.to_string())? {
        serde_json::Value::Object(map) => Ok(map),
        _ => Err("config file must contain a JSON object".to_string()),
    }
}
