//! Global `tracing` subscriber setup, standing in for `dozer-tracing`'s
//! telemetry init. The control plane is the observability channel for this
//! service (spec.md §4.4): no metrics protocol is required, so this wires
//! up a single `fmt` layer driven by an `EnvFilter`.

use tracing_subscriber::{fmt, EnvFilter};

pub fn init(filter: &str) {
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter).with_target(true).finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::debug!("global tracing subscriber already set");
    }
}

/// Best-effort resident set size in MiB, read from `/proc/self/statm` on
/// Linux. Returns `None` everywhere else rather than failing the caller —
/// this is diagnostic color attached to per-table/per-run log lines
/// (SPEC_FULL.md "Resident memory delta logging"), never load-bearing.
pub fn resident_memory_mib() -> Option<f64> {
    #[cfg(target_os = "linux")]
    {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        let page_size = 4096u64;
        Some((resident_pages * page_size) as f64 / (1024.0 * 1024.0))
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}
