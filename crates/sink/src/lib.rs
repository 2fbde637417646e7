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

//! Definition of the `Sink` trait, the contract of every output plugin.

use async_trait::async_trait;
use record::Record;
use serde_yaml::Value;

pub mod console;

/// List of errors that can occur with a `Sink`.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The sink type is not known to the factory.
    #[error("unknown sink (sink: {sink}, type: {sink_type})")]
    UnknownSink {
        /// The name of the sink.
        sink: String,
        /// The type of the sink.
        sink_type: String,
    },

    /// The sink configuration is invalid.
    #[error("invalid configuration (reason: {message}, sink: {sink})")]
    InvalidConfig {
        /// The name of the sink.
        sink: String,
        /// The error message.
        message: String,
    },

    /// A delivery attempt failed.
    #[error("sink write error (sink: {sink}, reason: {error})")]
    Write {
        /// The name of the sink.
        sink: String,
        /// The error message.
        error: String,
    },

    /// The sink has no usable instance at the moment, typically because a
    /// supervisor is still (re)constructing it. Transient: callers such as
    /// the output buffer should retry.
    #[error("sink not available (sink: {sink}, cause: {cause})")]
    NotAvailable {
        /// The name of the sink.
        sink: String,
        /// The last known cause.
        cause: String,
    },
}

/// The contract of an output plugin.
///
/// `write` is invoked from the buffer's delivery and retry tasks, possibly
/// concurrently, so implementations take `&self` and manage their own
/// interior state.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Delivers one record.
    async fn write(&self, record: &Record) -> Result<(), Error>;

    /// Closes the sink, releasing any underlying resource. Must be
    /// idempotent.
    async fn close(&self) -> Result<(), Error>;

    /// Returns true when the sink opts into periodic health checks.
    fn supports_health_check(&self) -> bool {
        false
    }

    /// Checks the health of the sink's external dependency.
    ///
    /// Only invoked when [`Sink::supports_health_check`] returns true.
    async fn check_health(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// A factory able to build a sink from a dynamic configuration value.
pub trait SinkFactory: Send + Sync {
    /// Creates a new sink from a name, a type, and a configuration.
    fn create(&self, sink_name: &str, sink_type: &str, config: Value) -> Result<Box<dyn Sink>, Error>;
}
