pub mod config;
pub mod error;
pub mod logging;
pub mod record;
pub mod schema;

pub use error::TypeError;
pub use record::{Batch, Record, Value};
pub use schema::{Column, ColumnType, ForeignKey, Index, TableSchema};
