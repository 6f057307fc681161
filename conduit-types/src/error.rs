use thiserror::Error;

/// Errors raised while converting or validating the source-neutral type
/// model itself (schema/value coercion), as opposed to adapter I/O.
#[derive(Error, Debug)]
pub enum TypeError {
    #[error("unsupported semantic type: {0}")]
    UnsupportedType(String),
    #[error("invalid decimal precision/scale: precision={precision}, scale={scale}")]
    InvalidDecimal { precision: u32, scale: u32 },
    #[error("failed to serialize value to JSON")]
    SerializationError(#[source] serde_json::Error),
    #[error("failed to deserialize value from JSON")]
    DeserializationError(#[source] serde_json::Error),
    #[error("failed to parse temporal value: {0}")]
    InvalidTemporal(String),
    #[error("column {0} is not nullable but no value or default was supplied")]
    MissingRequiredColumn(String),
}
