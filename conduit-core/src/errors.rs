use thiserror::Error;

/// Top-level engine error taxonomy (spec.md §7). Only the failures that
/// abort a run *before* a `RunResult` can be produced reach this type —
/// once both adapters are constructed and connected, every other failure
/// (connection errors included) is folded into the `RunResult` itself
/// rather than returned as `Err` (spec.md §7: "it never returns a bare
/// error for a partial-success run").
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unknown adapter kind: '{0}'")]
    UnknownAdapter(String),
}

impl EngineError {
    /// HTTP status the control plane maps this to (spec.md §7: both
    /// variants here surface as 400, everything else is carried inside
    /// `RunResult` and surfaces as 200/500 depending on `success`).
    pub fn is_client_error(&self) -> bool {
        matches!(self, EngineError::Configuration(_) | EngineError::UnknownAdapter(_))
    }
}
