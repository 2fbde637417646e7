#![doc = include_str!("../README.md")]
#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results,
    variant_size_differences
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! Logroute is a pipeline combining three types of plugins: **sources**
//! producing log records, **filters** deciding per destination which
//! records continue, and **sinks** delivering them. The **engine** owns
//! the bounded ingress channel between the sources and the single routing
//! task, persists every record to the **WAL** before routing, and hands
//! surviving records to per-sink **output buffers** that absorb sink
//! failures. Plugins whose external dependency may be unreachable can be
//! wrapped by the resilient **supervisor**.
//!
//! A YAML configuration file defines the inputs, the outputs with their
//! filter chains and source allow-lists, the persistence and buffering
//! sections, and the optional status surface. A more programmatic way is
//! possible through the `engine` crate directly.

pub use api;
pub use buffer;
pub use config;
pub use engine;
pub use filter;
pub use record;
pub use registry;
pub use sink;
pub use source;
pub use supervisor;
pub use wal;
