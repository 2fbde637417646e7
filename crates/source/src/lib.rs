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

//! Definition of the `Source` trait, the contract of every input plugin.

use async_trait::async_trait;
use record::Record;
use serde_yaml::Value;

/// List of errors that can occur with a `Source`.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The source type is not known to the factory.
    #[error("unknown source (source: {source_name}, type: {source_type})")]
    UnknownSource {
        /// The name of the source.
        source_name: String,
        /// The type of the source.
        source_type: String,
    },

    /// The source configuration is invalid.
    #[error("invalid configuration (reason: {message}, source: {source_name})")]
    InvalidConfig {
        /// The name of the source.
        source_name: String,
        /// The error message.
        message: String,
    },

    /// The source failed for some reason.
    #[error("source error (source: {source_name}, reason: {error})")]
    Source {
        /// The name of the source.
        source_name: String,
        /// The error message.
        error: String,
    },
}

/// The contract of an input plugin.
///
/// A source produces records and sends them to the engine through the log
/// channel installed with [`Source::set_log_channel`]. Within one source,
/// records must be sent in the order they were produced; the engine gives no
/// ordering guarantee across sources.
#[async_trait]
pub trait Source: Send + Sync {
    /// Installs the name the engine assigned to this source instance.
    ///
    /// Sources should tag every record they produce with this name. The
    /// default implementation ignores the name.
    fn set_name(&mut self, _name: &str) {}

    /// Installs the outbound channel records must be sent to.
    ///
    /// Called by the engine before [`Source::start`]. A send on a full
    /// channel blocks until the routing task drains a record, which is the
    /// backpressure contract of the pipeline.
    fn set_log_channel(&mut self, channel: flume::Sender<Record>);

    /// Starts producing records.
    async fn start(&mut self) -> Result<(), Error>;

    /// Stops the source. Must be idempotent.
    async fn stop(&mut self) -> Result<(), Error>;

    /// Returns true when the source opts into periodic health checks.
    fn supports_health_check(&self) -> bool {
        false
    }

    /// Checks the health of the source's external dependency.
    ///
    /// Only invoked when [`Source::supports_health_check`] returns true.
    async fn check_health(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// A factory able to build a source from a dynamic configuration value.
pub trait SourceFactory: Send + Sync {
    /// Creates a new source from a name, a type, and a configuration.
    fn create(
        &self,
        source_name: &str,
        source_type: &str,
        config: Value,
    ) -> Result<Box<dyn Source>, Error>;
}
