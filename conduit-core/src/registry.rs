//! Process-wide adapter registry (spec.md §4.1). Registration happens
//! once, here, at construction; lookup is read-only thereafter — mirrors
//! `pipeline_engine.py`'s `source_registry`/`dest_registry` dicts, built
//! once and handed to the Flask app at startup (`app.py`).

use std::collections::HashMap;

use conduit_ingestion::{CrmSaasSource, MsSqlSource, MySqlSource, PostgresSource, SourceAdapter, WorkItemSaasSource};
use conduit_sinks::{OlapSink, RelationalOltpSink, SinkAdapter};

use crate::errors::EngineError;

type SourceCtor = fn() -> Box<dyn SourceAdapter>;
type SinkCtor = fn() -> Box<dyn SinkAdapter>;

pub struct AdapterRegistry {
    sources: HashMap<&'static str, SourceCtor>,
    sinks: HashMap<&'static str, SinkCtor>,
}

impl AdapterRegistry {
    /// Registers every adapter this repo ships with. A deployment that
    /// wants a narrower surface can build an empty registry with
    /// `AdapterRegistry::empty()` and call `register_source`/`register_sink`
    /// selectively instead.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register_source("postgres", || Box::new(PostgresSource::default()));
        registry.register_source("mysql", || Box::new(MySqlSource::default()));
        registry.register_source("mssql", || Box::new(MsSqlSource::default()));
        registry.register_source("crm_saas", || Box::new(CrmSaasSource::default()));
        registry.register_source("workitem_saas", || Box::new(WorkItemSaasSource::default()));
        registry.register_sink("olap", || Box::new(OlapSink::default()));
        registry.register_sink("postgres", || Box::new(RelationalOltpSink::postgres()));
        registry.register_sink("mysql", || Box::new(RelationalOltpSink::mysql()));
        registry
    }

    pub fn empty() -> Self {
        Self { sources: HashMap::new(), sinks: HashMap::new() }
    }

    pub fn register_source(&mut self, kind: &'static str, ctor: SourceCtor) {
        self.sources.insert(kind, ctor);
    }

    pub fn register_sink(&mut self, kind: &'static str, ctor: SinkCtor) {
        self.sinks.insert(kind, ctor);
    }

    pub fn list_sources(&self) -> Vec<&'static str> {
        self.sources.keys().copied().collect()
    }

    pub fn list_sinks(&self) -> Vec<&'static str> {
        self.sinks.keys().copied().collect()
    }

    pub fn make_source(&self, kind: &str) -> Result<Box<dyn SourceAdapter>, EngineError> {
        self.sources
            .get(kind)
            .map(|ctor| ctor())
            .ok_or_else(|| EngineError::UnknownAdapter(kind.to_string()))
    }

    pub fn make_sink(&self, kind: &str) -> Result<Box<dyn SinkAdapter>, EngineError> {
        self.sinks
            .get(kind)
            .map(|ctor| ctor())
            .ok_or_else(|| EngineError::UnknownAdapter(kind.to_string()))
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_kinds_construct() {
        let registry = AdapterRegistry::with_defaults();
        assert!(registry.make_source("postgres").is_ok());
        assert!(registry.make_sink("olap").is_ok());
        assert!(registry.list_sources().contains(&"workitem_saas"));
    }

    #[test]
    fn unknown_kind_is_an_error() {
        let registry = AdapterRegistry::with_defaults();
        assert!(matches!(registry.make_source("oracle"), Err(EngineError::UnknownAdapter(_))));
        assert!(matches!(registry.make_sink("oracle"), Err(EngineError::UnknownAdapter(_))));
    }
}
