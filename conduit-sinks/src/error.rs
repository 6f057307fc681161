use thiserror::Error;

/// Sink-side error taxonomy. Maps onto the subset of spec.md §7 a sink
/// adapter can raise: `ConnectionError`, `TransientNetworkError`,
/// `SinkWriteError`. `SessionLock` is split out from `Transient` because
/// the failure policy for it is specific (recreate the client, then
/// retry the same operation) rather than a plain backoff-and-retry.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("failed to connect: {0}")]
    Connection(String),

    #[error("session lock on table '{table}': {message}")]
    SessionLock { table: String, message: String },

    #[error("transient error writing table '{table}': {message}")]
    Transient { table: String, message: String },

    #[error("permanent error writing table '{table}': {message}")]
    Permanent { table: String, message: String },

    #[error("unable to create or alter table '{table}': {message}")]
    Schema { table: String, message: String },

    #[error("missing required config key '{0}'")]
    MissingConfig(&'static str),

    #[error(transparent)]
    Type(#[from] conduit_types::TypeError),
}

impl SinkError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SinkError::Transient { .. } | SinkError::SessionLock { .. })
    }
}
