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

//! The processing engine: the single orchestrator binding sources, the WAL,
//! filter chains, and output buffers together.
//!
//! Sources enqueue records onto one bounded ingress channel. A single
//! routing task drains it serially and, for each record, persists it to the
//! WAL, evaluates every pipeline's source allow-list and filter chain, and
//! hands surviving records to the pipeline's buffer. The routing task is
//! the only component that sees every record, which fixes the order of
//! decisions: persist, then route, then enqueue.

use std::{sync::Arc, time::Duration};

use api::{ApiConfig, StatusServer};
use buffer::BufferConfig;
use record::Record;
use source::Source;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use wal::{Wal, WalConfig};

mod build;
mod pipeline;
mod state;

pub use pipeline::{NamedFilter, OutputPipeline, PipelineSpec};
pub use state::EngineState;

/// Capacity of the ingress channel between the sources and the routing
/// task. A source sending to a full channel blocks, which is the natural
/// backpressure of the pipeline.
const INGRESS_CAPACITY: usize = 100;

/// Budget for the status server to finish during shutdown.
const STATUS_SHUTDOWN_BUDGET: Duration = Duration::from_secs(5);

/// All the errors that can occur when using the engine.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A source with the same name is already registered.
    #[error("duplicate source '{name}'")]
    DuplicateSource {
        /// The duplicated name.
        name: String,
    },

    /// A pipeline with the same name is already registered.
    #[error("duplicate pipeline '{name}'")]
    DuplicatePipeline {
        /// The duplicated name.
        name: String,
    },

    /// A record could not be handed to a pipeline.
    #[error("delivery error (pipeline: {pipeline}, reason: {error})")]
    Delivery {
        /// The pipeline name.
        pipeline: String,
        /// The error message.
        error: String,
    },

    /// A write-ahead log error occurred.
    #[error(transparent)]
    Wal(#[from] wal::Error),

    /// An output buffer error occurred.
    #[error(transparent)]
    Buffer(#[from] buffer::Error),

    /// A configuration error occurred.
    #[error(transparent)]
    Config(#[from] config::Error),

    /// A plugin could not be created.
    #[error(transparent)]
    Registry(#[from] registry::Error),

    /// The status surface failed to start.
    #[error(transparent)]
    Api(#[from] api::Error),
}

struct NamedSource {
    name: String,
    plugin: Box<dyn Source>,
}

/// The record-flow engine.
pub struct Engine {
    cancel: CancellationToken,
    ingress_tx: flume::Sender<Record>,
    ingress_rx: flume::Receiver<Record>,
    sources: Vec<NamedSource>,
    source_seq: u64,
    pipelines: Vec<Arc<OutputPipeline>>,
    wal: Option<Arc<Wal>>,
    buffer_config: Option<BufferConfig>,
    api_config: Option<ApiConfig>,
    state: Arc<EngineState>,
    routing: Option<tokio::task::JoinHandle<()>>,
    status: Option<StatusServer>,
    status_cancel: Option<CancellationToken>,
    started: bool,
    stopped: bool,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// Creates an engine with an empty topology.
    pub fn new() -> Self {
        let (ingress_tx, ingress_rx) = flume::bounded(INGRESS_CAPACITY);
        Self {
            cancel: CancellationToken::new(),
            ingress_tx,
            ingress_rx,
            sources: Vec::new(),
            source_seq: 0,
            pipelines: Vec::new(),
            wal: None,
            buffer_config: None,
            api_config: None,
            state: Arc::new(EngineState::default()),
            routing: None,
            status: None,
            status_cancel: None,
            started: false,
            stopped: false,
        }
    }

    /// The shared read models served by the status surface.
    pub fn state(&self) -> Arc<EngineState> {
        self.state.clone()
    }

    /// A sender onto the ingress channel, as handed to every source.
    pub fn ingress(&self) -> flume::Sender<Record> {
        self.ingress_tx.clone()
    }

    /// The address the status server bound to, once started.
    pub fn status_addr(&self) -> Option<std::net::SocketAddr> {
        self.status.as_ref().map(|s| s.addr())
    }

    /// Builds the write-ahead log every routed record will traverse.
    /// Must be called before `start`.
    pub fn set_persistence(&mut self, config: WalConfig) -> Result<(), Error> {
        if !config.enabled {
            self.wal = None;
            self.state.set_wal_enabled(false);
            return Ok(());
        }
        self.wal = Some(Wal::open(config)?);
        self.state.set_wal_enabled(true);
        Ok(())
    }

    /// Installs the buffer configuration applied to every pipeline added
    /// afterward.
    pub fn set_output_buffer_config(&mut self, config: BufferConfig) {
        self.buffer_config = Some(config);
    }

    /// Installs the status surface configuration.
    pub fn set_api_config(&mut self, config: ApiConfig) {
        self.state.set_api(config.clone());
        self.api_config = Some(config);
    }

    /// Registers a source and hands it the ingress channel. An empty name
    /// is replaced by a generated `source-<N>` name.
    pub fn add_source(&mut self, name: &str, plugin: Box<dyn Source>) -> Result<(), Error> {
        self.add_source_with_probe(name, plugin, None)
    }

    /// Like [`Engine::add_source`], also attaching a supervisor probe for
    /// the status surface.
    pub fn add_source_with_probe(
        &mut self,
        name: &str,
        mut plugin: Box<dyn Source>,
        probe: Option<supervisor::SupervisorProbe>,
    ) -> Result<(), Error> {
        let name = if name.is_empty() {
            self.source_seq += 1;
            format!("source-{}", self.source_seq)
        } else {
            name.to_string()
        };
        if self.sources.iter().any(|s| s.name == name) {
            return Err(Error::DuplicateSource { name });
        }

        plugin.set_name(&name);
        plugin.set_log_channel(self.ingress_tx.clone());
        self.state.add_input(state::InputInfo {
            name: name.clone(),
            probe,
        });
        debug!(source = %name, "source registered");
        self.sources.push(NamedSource { name, plugin });
        Ok(())
    }

    /// Registers an output pipeline. When buffering is enabled the sink is
    /// wrapped in an output buffer. Pipelines are ordered; records are
    /// submitted to them in registration order.
    pub fn add_output_pipeline(&mut self, spec: PipelineSpec) -> Result<(), Error> {
        if self.pipelines.iter().any(|p| p.name() == spec.name) {
            return Err(Error::DuplicatePipeline { name: spec.name });
        }

        let pipeline = Arc::new(OutputPipeline::from_spec(spec, self.buffer_config.as_ref())?);
        self.state.add_pipeline(state::PipelineInfo {
            name: pipeline.name().to_string(),
            buffered: pipeline.buffered(),
            filters: pipeline.filter_count(),
            sources: pipeline.sources().to_vec(),
            stats: pipeline.buffer_stats(),
        });
        debug!(pipeline = %pipeline.name(), buffered = pipeline.buffered(), "pipeline registered");
        self.pipelines.push(pipeline);
        Ok(())
    }

    /// Starts the engine: drains the WAL recovery stream ahead of live
    /// traffic, starts every source, spawns the routing task, and starts
    /// the status surface when configured.
    pub async fn start(&mut self) -> Result<(), Error> {
        if self.started {
            return Ok(());
        }
        self.started = true;
        self.state.set_running(true);

        let recovery = self.wal.as_ref().map(|wal| wal.recover());

        for named in &mut self.sources {
            if let Err(error) = named.plugin.start().await {
                // A source that cannot start is not fatal; it may be
                // supervised or come back after a reload.
                error!(source = %named.name, %error, "source start failed");
            } else {
                info!(source = %named.name, "source started");
            }
        }

        self.routing = Some(tokio::task::spawn(route_loop(
            recovery,
            self.ingress_rx.clone(),
            self.pipelines.clone(),
            self.wal.clone(),
            self.state.clone(),
            self.cancel.clone(),
        )));

        if let Some(api_config) = self.api_config.clone().filter(|c| c.enabled) {
            let status_cancel = self.cancel.child_token();
            let server = StatusServer::start(&api_config, self.state.clone(), status_cancel.clone()).await?;
            self.status = Some(server);
            self.status_cancel = Some(status_cancel);
        }

        info!(
            sources = self.sources.len(),
            pipelines = self.pipelines.len(),
            wal = self.wal.is_some(),
            "engine started"
        );
        Ok(())
    }

    /// Stops the engine: stops the sources, waits for the routing task to
    /// drain, closes the WAL, shuts the status surface down within its
    /// budget, and closes every pipeline. Idempotent.
    pub async fn stop(&mut self) -> Result<(), Error> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        self.state.set_running(false);
        info!("engine stopping");

        for named in &mut self.sources {
            if let Err(error) = named.plugin.stop().await {
                error!(source = %named.name, %error, "source stop failed");
            }
        }

        self.cancel.cancel();
        if let Some(routing) = self.routing.take() {
            if let Err(error) = routing.await {
                error!(%error, "routing task join failed");
            }
        }

        if let Some(wal) = self.wal.take() {
            if let Err(error) = wal.close().await {
                error!(%error, "wal close failed");
            }
        }

        if let Some(server) = self.status.take() {
            if let Some(cancel) = self.status_cancel.take() {
                cancel.cancel();
            }
            if tokio::time::timeout(STATUS_SHUTDOWN_BUDGET, server.join()).await.is_err() {
                warn!("status server did not stop within its budget");
            }
        }

        for pipeline in &self.pipelines {
            pipeline.shutdown().await;
        }

        info!("engine stopped");
        Ok(())
    }
}

/// The single routing task.
///
/// Recovery records are drained before live traffic and are not persisted
/// again (their segments are consumed by the recovery scan); everything
/// drained from the ingress channel afterwards is persisted first, then
/// routed.
async fn route_loop(
    recovery: Option<flume::Receiver<Record>>,
    ingress: flume::Receiver<Record>,
    pipelines: Vec<Arc<OutputPipeline>>,
    wal: Option<Arc<Wal>>,
    state: Arc<EngineState>,
    cancel: CancellationToken,
) {
    if let Some(recovery) = recovery {
        let mut recovered = 0usize;
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = recovery.recv_async() => received,
            };
            match received {
                Ok(record) => {
                    recovered += 1;
                    route_record(record, &pipelines, None, &state).await;
                }
                Err(_) => break,
            }
        }
        if recovered > 0 {
            info!(recovered, "recovered records re-injected ahead of live traffic");
        }
    }

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => {
                // Drain what the sources managed to enqueue before the
                // cancellation, then leave.
                while let Ok(record) = ingress.try_recv() {
                    route_record(record, &pipelines, wal.as_ref(), &state).await;
                }
                break;
            }
            received = ingress.recv_async() => received,
        };
        match received {
            Ok(record) => route_record(record, &pipelines, wal.as_ref(), &state).await,
            Err(_) => break,
        }
    }
    debug!("routing task finished");
}

async fn route_record(
    record: Record,
    pipelines: &[Arc<OutputPipeline>],
    wal: Option<&Arc<Wal>>,
    state: &Arc<EngineState>,
) {
    state.record_routed();

    if let Some(wal) = wal {
        // Durability is best-effort under I/O failure: a persist error is
        // logged and routing continues.
        if let Err(error) = wal.persist(&record) {
            error!(%error, "wal persist failed");
        }
    }

    for pipeline in pipelines {
        if !pipeline.accepts_source(&record.source) {
            continue;
        }
        // Each pipeline filters and enriches its own copy.
        let mut owned = record.clone();
        if !pipeline.apply_filters(&mut owned) {
            continue;
        }
        if let Err(error) = pipeline.dispatch(owned).await {
            error!(pipeline = %pipeline.name(), %error, "dispatch failed");
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;

    struct IdleSource {}

    #[async_trait]
    impl Source for IdleSource {
        fn set_log_channel(&mut self, _channel: flume::Sender<Record>) {}

        async fn start(&mut self) -> Result<(), source::Error> {
            Ok(())
        }

        async fn stop(&mut self) -> Result<(), source::Error> {
            Ok(())
        }
    }

    struct CollectingSink {
        records: Arc<Mutex<Vec<Record>>>,
    }

    #[async_trait]
    impl sink::Sink for CollectingSink {
        async fn write(&self, record: &Record) -> Result<(), sink::Error> {
            self.records.lock().unwrap().push(record.clone());
            Ok(())
        }

        async fn close(&self) -> Result<(), sink::Error> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn source_names_are_generated_and_unique() {
        let mut engine = Engine::new();
        engine.add_source("", Box::new(IdleSource {})).unwrap();
        engine.add_source("", Box::new(IdleSource {})).unwrap();
        engine.add_source("files", Box::new(IdleSource {})).unwrap();

        assert_eq!(engine.sources[0].name, "source-1");
        assert_eq!(engine.sources[1].name, "source-2");

        let duplicate = engine.add_source("files", Box::new(IdleSource {}));
        assert!(matches!(duplicate, Err(Error::DuplicateSource { .. })));
    }

    #[tokio::test]
    async fn duplicate_pipelines_are_rejected() {
        let records = Arc::new(Mutex::new(Vec::new()));
        let mut engine = Engine::new();
        engine
            .add_output_pipeline(PipelineSpec {
                name: "console".to_string(),
                sink: Arc::new(CollectingSink { records: records.clone() }),
                filters: vec![],
                sources: vec![],
            })
            .unwrap();
        let duplicate = engine.add_output_pipeline(PipelineSpec {
            name: "console".to_string(),
            sink: Arc::new(CollectingSink { records }),
            filters: vec![],
            sources: vec![],
        });
        assert!(matches!(duplicate, Err(Error::DuplicatePipeline { .. })));
    }

    #[tokio::test]
    async fn routes_ingress_to_pipeline_in_order() {
        let records = Arc::new(Mutex::new(Vec::new()));
        let mut engine = Engine::new();
        engine
            .add_output_pipeline(PipelineSpec {
                name: "console".to_string(),
                sink: Arc::new(CollectingSink { records: records.clone() }),
                filters: vec![],
                sources: vec![],
            })
            .unwrap();

        let ingress = engine.ingress();
        engine.start().await.unwrap();

        for message in ["a", "b", "c"] {
            ingress.send_async(Record::new("info", message)).await.unwrap();
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while records.lock().unwrap().len() < 3 && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let seen: Vec<String> = records.lock().unwrap().iter().map(|r| r.message.clone()).collect();
        assert_eq!(seen, vec!["a", "b", "c"]);
        assert_eq!(engine.state().total_records(), 3);

        engine.stop().await.unwrap();
        engine.stop().await.unwrap();
    }
}
