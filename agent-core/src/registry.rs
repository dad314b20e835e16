//! Name -> constructor registries for sources and outputs.
//!
//! Plug-ins are resolved by name at config-load time against a fixed,
//! statically-registered table rather than discovered dynamically —
//! closed-world, compiled-in plug-ins instead of runtime loading.

use std::collections::HashMap;
use std::sync::Arc;

use crate::output::Transport;
use crate::source::{Source, SourceDescriptor, SourceFactory};

pub type OutputFactory =
    Arc<dyn Fn(&serde_json::Value) -> Result<Arc<dyn Transport>, String> + Send + Sync>;

/// Holds the compiled-in set of source and output kinds a config file's
/// `type:` fields are resolved against.
#[derive(Default, Clone)]
pub struct Registry {
    sources: HashMap<String, SourceFactory>,
    outputs: HashMap<String, OutputFactory>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_source(&mut self, kind: impl Into<String>, factory: SourceFactory) {
        self.sources.insert(kind.into(), factory);
    }

    pub fn register_output(&mut self, kind: impl Into<String>, factory: OutputFactory) {
        self.outputs.insert(kind.into(), factory);
    }

    pub fn source_kinds(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }

    pub fn output_kinds(&self) -> impl Iterator<Item = &str> {
        self.outputs.keys().map(String::as_str)
    }

    pub fn build_source(&self, descriptor: &SourceDescriptor) -> Result<Box<dyn Source>, String> {
        let factory = self
            .sources
            .get(&descriptor.kind)
            .ok_or_else(|| format!("unknown source kind {:?}", descriptor.kind))?;
        factory(descriptor)
    }

    /// A `SourceFactory` closure bound to this kind, suitable for handing
    /// to `SourceRuntime::new` without the runtime needing to know about
    /// the registry itself.
    pub fn source_factory(&self, kind: &str) -> Result<SourceFactory, String> {
        self.sources
            .get(kind)
            .cloned()
            .ok_or_else(|| format!("unknown source kind {kind:?}"))
    }

    pub fn build_output(&self, kind: &str, config: &serde_json::Value) -> Result<Arc<dyn Transport>, String> {
        let factory = self.outputs.get(kind).ok_or_else(|| format!("unknown output kind {kind:?}"))?;
        factory(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SourceError;
    use crate::event::Event;
    use async_trait::async_trait;

    struct Noop;
    #[async_trait]
    impl Source for Noop {
        async fn tick(&self) -> Result<Vec<Event>, SourceError> {
            Ok(vec![])
        }
    }

    #[test]
    fn unknown_source_kind_is_an_error() {
        let registry = Registry::new();
        let err = registry.source_factory("missing").unwrap_err();
        assert!(err.contains("missing"));
    }

    #[test]
    fn registered_source_kind_resolves() {
        let mut registry = Registry::new();
        registry.register_source("noop", Arc::new(|_d| Ok(Box::new(Noop) as Box<dyn Source>)));
        assert!(registry.source_factory("noop").is_ok());
        assert_eq!(registry.source_kinds().collect::<Vec<_>>(), vec!["noop"]);
    }
}
