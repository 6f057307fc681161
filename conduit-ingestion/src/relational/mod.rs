//! Relational database sources (spec.md §4.2 "Relational database source"):
//! Postgres-like, MySQL-like, SQL-Server-like. Each kind gets its own
//! adapter (driver APIs don't share a common trait to abstract over), but
//! they share the config-reading and incremental-column-choice helpers
//! below.

mod mssql;
mod mysql;
mod postgres;

pub use mssql::MsSqlSource;
pub use mysql::MySqlSource;
pub use postgres::PostgresSource;

use conduit_types::{Column, ColumnType};

use crate::error::SourceError;
use crate::source::SourceConfig;

pub(crate) fn require_str<'a>(
    config: &'a SourceConfig,
    key: &'static str,
) -> Result<&'a str, SourceError> {
    config
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or(SourceError::MissingConfig(key))
}

pub(crate) fn optional_str<'a>(config: &'a SourceConfig, key: &str) -> Option<&'a str> {
    config.get(key).and_then(|v| v.as_str())
}

pub(crate) fn optional_u16(config: &SourceConfig, key: &str, default: u16) -> u16 {
    config
        .get(key)
        .and_then(|v| v.as_u64())
        .map(|v| v as u16)
        .unwrap_or(default)
}

/// Chooses the incremental column in the order spec.md §4.2 specifies:
/// "the first primary-key column, the first timestamp-typed column, then
/// the first integer or UUID column". Returns `None` when no candidate
/// exists, in which case the adapter falls back to a full read.
pub(crate) fn choose_incremental_column(
    primary_key: &[String],
    columns: &[Column],
) -> Option<String> {
    if let Some(pk) = primary_key.first() {
        return Some(pk.clone());
    }
    if let Some(ts) = columns
        .iter()
        .find(|c| matches!(c.ty, ColumnType::Timestamp))
    {
        return Some(ts.name.clone());
    }
    columns
        .iter()
        .find(|c| matches!(c.ty, ColumnType::Int32 | ColumnType::Int64 | ColumnType::Uuid))
        .map(|c| c.name.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_primary_key_over_timestamp() {
        let columns = vec![
            Column::new("created_at", ColumnType::Timestamp, false),
            Column::new("id", ColumnType::Int64, false),
        ];
        let chosen = choose_incremental_column(&["id".to_string()], &columns);
        assert_eq!(chosen.as_deref(), Some("id"));
    }

    #[test]
    fn falls_back_to_timestamp_then_integer() {
        let columns = vec![
            Column::new("name", ColumnType::String, true),
            Column::new("updated_at", ColumnType::Timestamp, false),
        ];
        assert_eq!(
            choose_incremental_column(&[], &columns).as_deref(),
            Some("updated_at")
        );

        let columns = vec![
            Column::new("name", ColumnType::String, true),
            Column::new("counter", ColumnType::Int32, false),
        ];
        assert_eq!(
            choose_incremental_column(&[], &columns).as_deref(),
            Some("counter")
        );
    }

    #[test]
    fn no_candidate_returns_none() {
        let columns = vec![Column::new("name", ColumnType::String, true)];
        assert_eq!(choose_incremental_column(&[], &columns), None);
    }
}
