pub mod error;
pub mod olap;
pub mod relational_oltp;
pub mod retry;
pub mod sink;

pub use error::SinkError;
pub use olap::OlapSink;
pub use relational_oltp::{Dialect, RelationalOltpSink};
pub use sink::{SinkAdapter, SinkConfig, DEFAULT_WRITE_BATCH_SIZE};
