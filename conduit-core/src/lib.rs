pub mod engine;
pub mod errors;
pub mod registry;

pub use engine::{OperationMode, PipelineEngine, RunResult, TableFailed, TableMigrated};
pub use errors::EngineError;
pub use registry::AdapterRegistry;
