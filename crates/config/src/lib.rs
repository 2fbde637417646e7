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

//! Configuration objects for the log pipeline.
//!
//! One YAML document describes the whole topology: the `inputs` list, the
//! `outputs` list (each with an optional source allow-list and a nested
//! filter chain), the `persistence` (WAL) section, the shared
//! `output_buffer` section, and the optional `api` status surface.

use std::{collections::HashSet, path::Path};

use api::ApiConfig;
use buffer::BufferConfig;
use registry::Registry;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use supervisor::SupervisorConfig;
use thiserror::Error as ThisError;
use tracing::debug;
use validator::Validate;
use wal::WalConfig;

pub mod watch;

pub use watch::ConfigWatcher;

/// Errors for the config module.
#[derive(ThisError, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The config file could not be read.
    #[error("config file not readable (file: {file}, reason: {message})")]
    FileNotReadable {
        /// The path to the config file.
        file: String,
        /// The error message.
        message: String,
    },

    /// The config document could not be parsed or failed validation.
    #[error("invalid configuration (reason: {message})")]
    InvalidConfig {
        /// The error message.
        message: String,
    },

    /// At least two inputs carry the same explicit name.
    #[error("duplicate input name '{name}'")]
    DuplicateInput {
        /// The duplicated name.
        name: String,
    },

    /// At least two outputs resolve to the same name.
    #[error("duplicate output name '{name}'")]
    DuplicateOutput {
        /// The duplicated name.
        name: String,
    },

    /// A plugin definition references a type no factory is registered for.
    #[error("unknown plugin type '{kind}' (table: {table})")]
    UnknownPluginType {
        /// The unresolved type.
        kind: String,
        /// The registry table that was consulted.
        table: &'static str,
    },

    /// The file watcher could not be installed.
    #[error("config watcher error (reason: {message})")]
    Watcher {
        /// The error message.
        message: String,
    },
}

/// Definition of one input plugin instance.
#[derive(Serialize, Deserialize, Debug, Clone, Validate)]
pub struct InputDef {
    /// The plugin type, e.g. `file`, `http`, `docker`, `kafka`.
    #[serde(rename = "type")]
    #[validate(length(min = 1, message = "input type must not be empty"))]
    pub plugin_type: String,

    /// Instance name; generated by the engine when absent.
    #[serde(default)]
    pub name: Option<String>,

    /// Dynamic plugin configuration, re-parsed by the factory.
    #[serde(default)]
    pub config: Value,

    /// When present, the input is wrapped by a resilient supervisor.
    #[serde(default)]
    pub supervisor: Option<SupervisorConfig>,
}

/// Definition of one filter inside an output's chain.
#[derive(Serialize, Deserialize, Debug, Clone, Validate)]
pub struct FilterDef {
    /// The plugin type, e.g. `keep_levels`.
    #[serde(rename = "type")]
    #[validate(length(min = 1, message = "filter type must not be empty"))]
    pub plugin_type: String,

    /// Instance name; defaults to the type.
    #[serde(default)]
    pub name: Option<String>,

    /// Dynamic plugin configuration, re-parsed by the factory.
    #[serde(default)]
    pub config: Value,
}

impl FilterDef {
    /// The name this filter resolves to.
    pub fn effective_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.plugin_type)
    }
}

/// Definition of one output pipeline: a sink, its filter chain, and its
/// source allow-list.
#[derive(Serialize, Deserialize, Debug, Clone, Validate)]
pub struct OutputDef {
    /// The plugin type, e.g. `console`, `slack`, `elasticsearch`.
    #[serde(rename = "type")]
    #[validate(length(min = 1, message = "output type must not be empty"))]
    pub plugin_type: String,

    /// Pipeline name, unique per engine; defaults to the type.
    #[serde(default)]
    pub name: Option<String>,

    /// Dynamic plugin configuration, re-parsed by the factory.
    #[serde(default)]
    pub config: Value,

    /// Source allow-list; an empty list accepts every source.
    #[serde(default)]
    pub sources: Vec<String>,

    /// Ordered filter chain; the first filter that drops a record stops the
    /// evaluation for this pipeline.
    #[serde(default)]
    pub filters: Vec<FilterDef>,

    /// When present, the sink is wrapped by a resilient supervisor.
    #[serde(default)]
    pub supervisor: Option<SupervisorConfig>,
}

impl OutputDef {
    /// The name this output resolves to.
    pub fn effective_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.plugin_type)
    }
}

/// The whole pipeline configuration document.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// Input plugin definitions.
    #[serde(default)]
    pub inputs: Vec<InputDef>,

    /// Output pipeline definitions.
    #[serde(default)]
    pub outputs: Vec<OutputDef>,

    /// Write-ahead log section.
    #[serde(default)]
    pub persistence: Option<WalConfig>,

    /// Shared output-buffer section, applied to every pipeline.
    #[serde(default)]
    pub output_buffer: Option<BufferConfig>,

    /// Status surface section.
    #[serde(default)]
    pub api: Option<ApiConfig>,
}

impl Default for Config {
    /// The built-in default topology: no inputs, one unbuffered console
    /// output, no WAL, no status surface.
    fn default() -> Self {
        Self {
            inputs: Vec::new(),
            outputs: vec![OutputDef {
                plugin_type: "console".to_string(),
                name: None,
                config: Value::Null,
                sources: Vec::new(),
                filters: Vec::new(),
                supervisor: None,
            }],
            persistence: None,
            output_buffer: None,
            api: None,
        }
    }
}

impl Config {
    /// Loads and validates a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let file = path.as_ref().display().to_string();
        debug!(%file, "loading configuration");

        let content = std::fs::read_to_string(&path).map_err(|e| Error::FileNotReadable {
            file: file.clone(),
            message: e.to_string(),
        })?;
        let config = Self::parse(&content)?;

        debug!(%file, "configuration loaded");
        Ok(config)
    }

    /// Parses and validates a configuration document.
    pub fn parse(content: &str) -> Result<Self, Error> {
        let config: Config = serde_yaml::from_str(content).map_err(|e| Error::InvalidConfig {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Structural validation: non-empty types, unique names.
    pub fn validate(&self) -> Result<(), Error> {
        for input in &self.inputs {
            Validate::validate(input).map_err(invalid)?;
        }
        for output in &self.outputs {
            Validate::validate(output).map_err(invalid)?;
            for filter in &output.filters {
                Validate::validate(filter).map_err(invalid)?;
            }
        }

        let mut input_names = HashSet::new();
        for input in &self.inputs {
            if let Some(name) = &input.name {
                if !input_names.insert(name.clone()) {
                    return Err(Error::DuplicateInput { name: name.clone() });
                }
            }
        }

        let mut output_names = HashSet::new();
        for output in &self.outputs {
            let name = output.effective_name().to_string();
            if !output_names.insert(name.clone()) {
                return Err(Error::DuplicateOutput { name });
            }
        }

        Ok(())
    }

    /// Rejects plugin definitions whose type has no registered factory.
    pub fn validate_kinds(&self, registry: &Registry) -> Result<(), Error> {
        for input in &self.inputs {
            if !registry.has_source(&input.plugin_type) {
                return Err(Error::UnknownPluginType {
                    kind: input.plugin_type.clone(),
                    table: "source",
                });
            }
        }
        for output in &self.outputs {
            if !registry.has_sink(&output.plugin_type) {
                return Err(Error::UnknownPluginType {
                    kind: output.plugin_type.clone(),
                    table: "sink",
                });
            }
            for filter in &output.filters {
                if !registry.has_filter(&filter.plugin_type) {
                    return Err(Error::UnknownPluginType {
                        kind: filter.plugin_type.clone(),
                        table: "filter",
                    });
                }
            }
        }
        Ok(())
    }
}

fn invalid(errors: validator::ValidationErrors) -> Error {
    Error::InvalidConfig {
        message: errors.to_string(),
    }
}
