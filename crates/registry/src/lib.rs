#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! Name-keyed factory tables for source, filter, and sink plugin types.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use filter::{Filter, FilterFactory};
use once_cell::sync::Lazy;
use serde_yaml::Value;
use sink::{Sink, SinkFactory};
use source::{Source, SourceFactory};

/// List of errors that can occur with the registry.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// No factory is registered for the requested plugin type.
    #[error("unknown plugin kind (kind: {kind}, table: {table})")]
    UnknownKind {
        /// The requested plugin type.
        kind: String,
        /// The table that was consulted (source, filter, or sink).
        table: &'static str,
    },

    /// A source factory failed.
    #[error(transparent)]
    Source(#[from] source::Error),

    /// A filter factory failed.
    #[error(transparent)]
    Filter(#[from] filter::Error),

    /// A sink factory failed.
    #[error(transparent)]
    Sink(#[from] sink::Error),
}

/// Three name-keyed factory tables, one per plugin kind.
///
/// Reads are concurrent; writes are expected only during process startup but
/// remain safe at any time. Registering a type that already exists replaces
/// the previous factory (last write wins).
///
/// The three tables are statically typed, so a factory can only ever return
/// the capability set its table requires; the "interface mismatch" failure
/// mode of dynamically-typed registries cannot be represented here.
#[derive(Default)]
pub struct Registry {
    sources: RwLock<HashMap<String, Arc<dyn SourceFactory>>>,
    filters: RwLock<HashMap<String, Arc<dyn FilterFactory>>>,
    sinks: RwLock<HashMap<String, Arc<dyn SinkFactory>>>,
}

impl Registry {
    /// Creates an empty registry, useful for test isolation.
    pub fn new() -> Self {
        Default::default()
    }

    /// Creates a registry pre-populated with the built-in plugin types
    /// (`keep_levels` filter, `console` sink).
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register_filter("keep_levels", Arc::new(filter::keep_levels::KeepLevelsFactory::default()));
        registry.register_sink("console", Arc::new(sink::console::ConsoleFactory::default()));
        registry
    }

    /// Registers a source factory under a type name.
    pub fn register_source(&self, kind: &str, factory: Arc<dyn SourceFactory>) {
        let previous = self
            .sources
            .write()
            .expect("source table lock poisoned")
            .insert(kind.to_string(), factory);
        if previous.is_some() {
            tracing::warn!(%kind, "source factory replaced");
        }
    }

    /// Registers a filter factory under a type name.
    pub fn register_filter(&self, kind: &str, factory: Arc<dyn FilterFactory>) {
        let previous = self
            .filters
            .write()
            .expect("filter table lock poisoned")
            .insert(kind.to_string(), factory);
        if previous.is_some() {
            tracing::warn!(%kind, "filter factory replaced");
        }
    }

    /// Registers a sink factory under a type name.
    pub fn register_sink(&self, kind: &str, factory: Arc<dyn SinkFactory>) {
        let previous = self
            .sinks
            .write()
            .expect("sink table lock poisoned")
            .insert(kind.to_string(), factory);
        if previous.is_some() {
            tracing::warn!(%kind, "sink factory replaced");
        }
    }

    /// Returns the source factory registered for the type.
    pub fn source_factory(&self, kind: &str) -> Option<Arc<dyn SourceFactory>> {
        self.sources.read().expect("source table lock poisoned").get(kind).cloned()
    }

    /// Returns the sink factory registered for the type.
    pub fn sink_factory(&self, kind: &str) -> Option<Arc<dyn SinkFactory>> {
        self.sinks.read().expect("sink table lock poisoned").get(kind).cloned()
    }

    /// Returns true when a source factory is registered for the type.
    pub fn has_source(&self, kind: &str) -> bool {
        self.sources.read().expect("source table lock poisoned").contains_key(kind)
    }

    /// Returns true when a filter factory is registered for the type.
    pub fn has_filter(&self, kind: &str) -> bool {
        self.filters.read().expect("filter table lock poisoned").contains_key(kind)
    }

    /// Returns true when a sink factory is registered for the type.
    pub fn has_sink(&self, kind: &str) -> bool {
        self.sinks.read().expect("sink table lock poisoned").contains_key(kind)
    }

    /// Creates a source of the given type, or fails with `UnknownKind`.
    pub fn create_source(&self, kind: &str, name: &str, config: Value) -> Result<Box<dyn Source>, Error> {
        let factory = self
            .sources
            .read()
            .expect("source table lock poisoned")
            .get(kind)
            .cloned()
            .ok_or_else(|| Error::UnknownKind {
                kind: kind.to_string(),
                table: "source",
            })?;
        Ok(factory.create(name, kind, config)?)
    }

    /// Creates a filter of the given type, or fails with `UnknownKind`.
    pub fn create_filter(&self, kind: &str, name: &str, config: Value) -> Result<Box<dyn Filter>, Error> {
        let factory = self
            .filters
            .read()
            .expect("filter table lock poisoned")
            .get(kind)
            .cloned()
            .ok_or_else(|| Error::UnknownKind {
                kind: kind.to_string(),
                table: "filter",
            })?;
        Ok(factory.create(name, kind, config)?)
    }

    /// Creates a sink of the given type, or fails with `UnknownKind`.
    pub fn create_sink(&self, kind: &str, name: &str, config: Value) -> Result<Box<dyn Sink>, Error> {
        let factory = self
            .sinks
            .read()
            .expect("sink table lock poisoned")
            .get(kind)
            .cloned()
            .ok_or_else(|| Error::UnknownKind {
                kind: kind.to_string(),
                table: "sink",
            })?;
        Ok(factory.create(name, kind, config)?)
    }
}

static DEFAULT: Lazy<Registry> = Lazy::new(Registry::with_builtins);

/// Returns the process-wide default registry.
///
/// Convenient for binaries; tests should prefer an injected [`Registry`].
pub fn default_registry() -> &'static Registry {
    &DEFAULT
}
