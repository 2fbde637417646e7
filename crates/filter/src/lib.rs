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

//! Definition of the `Filter` trait, the contract of every filter plugin.

use record::Record;
use serde_yaml::Value;

pub mod keep_levels;

/// List of errors that can occur with a `Filter`.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The filter type is not known to the factory.
    #[error("unknown filter (filter: {filter}, type: {filter_type})")]
    UnknownFilter {
        /// The name of the filter.
        filter: String,
        /// The type of the filter.
        filter_type: String,
    },

    /// The filter configuration is invalid.
    #[error("invalid configuration (reason: {message}, filter: {filter})")]
    InvalidConfig {
        /// The name of the filter.
        filter: String,
        /// The error message.
        message: String,
    },
}

/// The contract of a filter plugin.
///
/// A filter decides whether a record continues down its pipeline and may
/// enrich `record.metadata` in place. One filter instance can be evaluated
/// concurrently by pipelines running in parallel, so implementations must
/// be safe to call from multiple tasks.
pub trait Filter: Send + Sync {
    /// Returns true to keep the record, false to drop it for this pipeline.
    fn process(&self, record: &mut Record) -> bool;
}

/// A factory able to build a filter from a dynamic configuration value.
pub trait FilterFactory: Send + Sync {
    /// Creates a new filter from a name, a type, and a configuration.
    fn create(
        &self,
        filter_name: &str,
        filter_type: &str,
        config: Value,
    ) -> Result<Box<dyn Filter>, Error>;
}
