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

//! Definition of the log `Record`, the unit of flow of the pipeline.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod level;

/// One log entry flowing through the pipeline.
///
/// A record is created by a source, owned by whichever component currently
/// holds it, and discarded when every pipeline has either delivered, dead-
/// lettered, or dropped it. Filters that enrich metadata mutate their own
/// in-flight copy, never a shared one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Creation instant of the record.
    pub timestamp: DateTime<Utc>,

    /// Free-form lowercase level string. `error`, `warn`, `info` and `debug`
    /// are recognized for classification, anything else passes through.
    pub level: String,

    /// The log message (UTF-8, arbitrary length).
    pub message: String,

    /// Additional key-value context attached to the record.
    #[serde(default)]
    pub metadata: HashMap<String, String>,

    /// Name of the input instance that produced the record. Empty until
    /// assigned by the source.
    #[serde(default)]
    pub source: String,
}

impl Record {
    /// Creates a new record with the current time and empty metadata.
    pub fn new(level: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level: level.into(),
            message: message.into(),
            metadata: HashMap::new(),
            source: String::new(),
        }
    }

    /// Creates a new record with the current time and the given metadata.
    pub fn new_with_metadata(
        level: impl Into<String>,
        message: impl Into<String>,
        metadata: HashMap<String, String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            level: level.into(),
            message: message.into(),
            metadata,
            source: String::new(),
        }
    }
}
