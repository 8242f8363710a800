//! Source pool: datasource kind registry.

use super::DataSource;
use crate::error::{WriterError, WriterResult};
use std::collections::HashMap;

type SourceFactory = Box<dyn Fn() -> Box<dyn DataSource> + Send + Sync>;

/// Registry of datasource constructors keyed by the `type` tag of a
/// `<datasource>` element. The built-in kinds are registered up front;
/// integrations may add their own before the writer opens an entry.
pub struct SourcePool {
    factories: HashMap<String, SourceFactory>,
}

impl Default for SourcePool {
    fn default() -> Self {
        Self::new()
    }
}

impl SourcePool {
    /// A pool with the built-in source kinds.
    pub fn new() -> Self {
        let mut factories: HashMap<String, SourceFactory> = HashMap::new();
        factories.insert(
            "DEVICE".to_string(),
            Box::new(|| Box::<super::RemoteDeviceSource>::default() as Box<dyn DataSource>),
        );
        factories.insert(
            "DB".to_string(),
            Box::new(|| Box::<super::RelationalQuerySource>::default() as Box<dyn DataSource>),
        );
        factories.insert(
            "PUSH".to_string(),
            Box::new(|| Box::<super::PushSource>::default() as Box<dyn DataSource>),
        );
        factories.insert(
            "COMPUTED".to_string(),
            Box::new(|| Box::<super::ComputedSource>::default() as Box<dyn DataSource>),
        );
        Self { factories }
    }

    /// Register (or replace) a source kind.
    pub fn register<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn() -> Box<dyn DataSource> + Send + Sync + 'static,
    {
        if self.factories.contains_key(kind) {
            log::debug!("replacing datasource kind '{}'", kind);
        }
        self.factories.insert(kind.to_string(), Box::new(factory));
    }

    /// Construct an unconfigured source of the given kind.
    pub fn create(&self, kind: &str) -> WriterResult<Box<dyn DataSource>> {
        self.factories
            .get(kind)
            .map(|factory| factory())
            .ok_or_else(|| WriterError::Schema(format!("unknown datasource kind '{}'", kind)))
    }

    /// Registered kind tags, mainly for diagnostics.
    pub fn kinds(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_kinds_present() {
        let pool = SourcePool::new();
        for kind in ["DEVICE", "DB", "PUSH", "COMPUTED"] {
            assert!(pool.create(kind).is_ok(), "missing builtin kind {}", kind);
        }
    }

    #[test]
    fn test_unknown_kind_is_schema_error() {
        let pool = SourcePool::new();
        assert!(matches!(
            pool.create("CORBA"),
            Err(WriterError::Schema(_))
        ));
    }

    #[test]
    fn test_custom_kind_registration() {
        let mut pool = SourcePool::new();
        pool.register("MYPUSH", || {
            Box::<super::super::PushSource>::default() as Box<dyn DataSource>
        });
        assert!(pool.create("MYPUSH").is_ok());
    }
}
