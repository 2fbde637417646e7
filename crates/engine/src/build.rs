//! Assembling an engine topology from a configuration document.

use config::Config;
use registry::Registry;
use std::sync::Arc;
use supervisor::{SupervisedSink, SupervisedSource};
use tracing::info;

use crate::{Engine, Error, NamedFilter, PipelineSpec};

impl Engine {
    /// Builds a fully configured engine from a validated configuration and
    /// a plugin registry. Nothing runs until `start`.
    pub fn from_config(config: &Config, registry: &Registry) -> Result<Self, Error> {
        config.validate()?;
        config.validate_kinds(registry)?;

        let mut engine = Engine::new();
        engine.apply_config(config, registry)?;
        Ok(engine)
    }

    /// Replaces the whole topology: performs a stop-equivalent, replays the
    /// configuration through the registry factories, and starts again.
    ///
    /// The caller is expected to hold the engine exclusively (e.g. behind a
    /// mutex) for the entire swap.
    pub async fn reload(&mut self, config: &Config, registry: &Registry) -> Result<(), Error> {
        config.validate()?;
        config.validate_kinds(registry)?;
        info!("engine reload started");

        self.stop().await?;
        *self = Engine::new();
        self.apply_config(config, registry)?;
        self.start().await?;

        info!("engine reload finished");
        Ok(())
    }

    fn apply_config(&mut self, config: &Config, registry: &Registry) -> Result<(), Error> {
        if let Some(persistence) = &config.persistence {
            self.set_persistence(persistence.clone())?;
        }
        if let Some(output_buffer) = &config.output_buffer {
            self.set_output_buffer_config(output_buffer.clone());
        }
        if let Some(api) = &config.api {
            self.set_api_config(api.clone());
        }

        for input in &config.inputs {
            let name = input.name.clone().unwrap_or_default();
            match &input.supervisor {
                Some(supervisor_config) => {
                    let factory = registry.source_factory(&input.plugin_type).ok_or_else(|| {
                        Error::Registry(registry::Error::UnknownKind {
                            kind: input.plugin_type.clone(),
                            table: "source",
                        })
                    })?;
                    let kind = input.plugin_type.clone();
                    let factory_name = if name.is_empty() { kind.clone() } else { name.clone() };
                    let plugin_config = input.config.clone();
                    let facade = SupervisedSource::new(kind.clone(), supervisor_config.clone(), move || {
                        factory.create(&factory_name, &kind, plugin_config.clone())
                    });
                    let probe = facade.probe();
                    self.add_source_with_probe(&name, Box::new(facade), Some(probe))?;
                }
                None => {
                    let plugin = registry.create_source(&input.plugin_type, &name, input.config.clone())?;
                    self.add_source(&name, plugin)?;
                }
            }
        }

        for output in &config.outputs {
            let name = output.effective_name().to_string();
            let sink: Arc<dyn sink::Sink> = match &output.supervisor {
                Some(supervisor_config) => {
                    let factory = registry.sink_factory(&output.plugin_type).ok_or_else(|| {
                        Error::Registry(registry::Error::UnknownKind {
                            kind: output.plugin_type.clone(),
                            table: "sink",
                        })
                    })?;
                    let kind = output.plugin_type.clone();
                    let factory_name = name.clone();
                    let plugin_config = output.config.clone();
                    Arc::new(SupervisedSink::new(
                        name.clone(),
                        kind.clone(),
                        supervisor_config.clone(),
                        move || factory.create(&factory_name, &kind, plugin_config.clone()),
                    ))
                }
                None => Arc::from(registry.create_sink(&output.plugin_type, &name, output.config.clone())?),
            };

            let mut filters = Vec::new();
            for filter_def in &output.filters {
                let filter = registry.create_filter(
                    &filter_def.plugin_type,
                    filter_def.effective_name(),
                    filter_def.config.clone(),
                )?;
                filters.push(NamedFilter {
                    name: filter_def.effective_name().to_string(),
                    filter,
                });
            }

            self.add_output_pipeline(PipelineSpec {
                name,
                sink,
                filters,
                sources: output.sources.clone(),
            })?;
        }

        Ok(())
    }
}
