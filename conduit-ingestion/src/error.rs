use thiserror::Error;

/// Source-side error taxonomy. Maps onto the subset of spec.md §7 that a
/// source adapter can raise: `ConnectionError`, `TransientNetworkError`,
/// `PermanentSourceError`. The engine (`conduit-core`) is the layer that
/// decides retry vs. table-failure; this enum only classifies.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("failed to connect: {0}")]
    Connection(String),

    #[error("transient error reading table '{table}': {message}")]
    Transient { table: String, message: String },

    #[error("permanent error reading table '{table}': {message}")]
    Permanent { table: String, message: String },

    #[error("unable to describe schema for table '{table}': {message}")]
    Schema { table: String, message: String },

    #[error("missing required config key '{0}'")]
    MissingConfig(&'static str),

    #[error(transparent)]
    Type(#[from] conduit_types::TypeError),
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Transient { .. })
    }
}
