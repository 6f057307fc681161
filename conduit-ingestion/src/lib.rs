pub mod crm_saas;
pub mod error;
pub mod relational;
pub mod retry;
pub mod source;
pub mod workitem_saas;

pub use crm_saas::CrmSaasSource;
pub use error::SourceError;
pub use relational::{MsSqlSource, MySqlSource, PostgresSource};
pub use source::{BatchStream, SourceAdapter, SourceConfig};
pub use workitem_saas::WorkItemSaasSource;
