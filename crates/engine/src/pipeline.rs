//! Output pipelines: one sink, its filter chain, and its source allow-list.

use std::sync::Arc;

use buffer::{BufferConfig, BufferStats, OutputBuffer};
use filter::Filter;
use record::Record;
use sink::Sink;
use tracing::debug;

use crate::Error;

/// A filter instance together with its configured name.
pub struct NamedFilter {
    /// The configured filter name.
    pub name: String,
    /// The filter instance.
    pub filter: Box<dyn Filter>,
}

/// What the engine needs to assemble one output pipeline.
pub struct PipelineSpec {
    /// Pipeline name, unique per engine.
    pub name: String,
    /// The sink records are delivered to.
    pub sink: Arc<dyn Sink>,
    /// Ordered filter chain.
    pub filters: Vec<NamedFilter>,
    /// Source allow-list; empty accepts every source.
    pub sources: Vec<String>,
}

/// One configured output pipeline.
///
/// When buffering is enabled the sink is fronted by an [`OutputBuffer`];
/// sink errors are then absorbed behind `enqueue` and the engine never
/// observes them.
pub struct OutputPipeline {
    name: String,
    sink: Arc<dyn Sink>,
    buffer: Option<Arc<OutputBuffer>>,
    filters: Vec<NamedFilter>,
    sources: Vec<String>,
}

impl OutputPipeline {
    pub(crate) fn from_spec(spec: PipelineSpec, buffer_config: Option<&BufferConfig>) -> Result<Self, Error> {
        let buffer = match buffer_config {
            Some(config) if config.enabled => {
                Some(OutputBuffer::new(spec.name.clone(), spec.sink.clone(), config.clone())?)
            }
            _ => None,
        };
        Ok(Self {
            name: spec.name,
            sink: spec.sink,
            buffer,
            filters: spec.filters,
            sources: spec.sources,
        })
    }

    /// The pipeline name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the sink is fronted by an output buffer.
    pub fn buffered(&self) -> bool {
        self.buffer.is_some()
    }

    /// The live statistics of the buffer, when buffering is enabled.
    pub fn buffer_stats(&self) -> Option<Arc<BufferStats>> {
        self.buffer.as_ref().map(|b| b.stats())
    }

    /// The source allow-list.
    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    /// Number of filters in the chain.
    pub fn filter_count(&self) -> usize {
        self.filters.len()
    }

    /// Returns true when the record's source passes the allow-list.
    pub(crate) fn accepts_source(&self, source: &str) -> bool {
        self.sources.is_empty() || self.sources.iter().any(|s| s == source)
    }

    /// Runs the filter chain in declaration order; the first filter that
    /// drops the record stops the evaluation.
    pub(crate) fn apply_filters(&self, record: &mut Record) -> bool {
        for named in &self.filters {
            if !named.filter.process(record) {
                debug!(pipeline = %self.name, filter = %named.name, "record dropped by filter");
                return false;
            }
        }
        true
    }

    /// Hands one record to the buffer, or to the sink directly when
    /// buffering is disabled.
    pub(crate) async fn dispatch(&self, record: Record) -> Result<(), Error> {
        match &self.buffer {
            Some(buffer) => buffer.enqueue(record).await.map_err(|e| Error::Delivery {
                pipeline: self.name.clone(),
                error: e.to_string(),
            }),
            None => self.sink.write(&record).await.map_err(|e| Error::Delivery {
                pipeline: self.name.clone(),
                error: e.to_string(),
            }),
        }
    }

    /// Closes the buffer (which closes the sink), or the bare sink.
    pub(crate) async fn shutdown(&self) {
        match &self.buffer {
            Some(buffer) => {
                if let Err(error) = buffer.shutdown().await {
                    tracing::error!(pipeline = %self.name, %error, "buffer shutdown failed");
                }
            }
            None => {
                if let Err(error) = self.sink.close().await {
                    tracing::error!(pipeline = %self.name, %error, "sink close failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;

    struct NullSink {}

    #[async_trait]
    impl Sink for NullSink {
        async fn write(&self, _record: &Record) -> Result<(), sink::Error> {
            Ok(())
        }

        async fn close(&self) -> Result<(), sink::Error> {
            Ok(())
        }
    }

    struct RecordingFilter {
        name: &'static str,
        keep: bool,
        seen: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Filter for RecordingFilter {
        fn process(&self, _record: &mut Record) -> bool {
            self.seen.lock().unwrap().push(self.name);
            self.keep
        }
    }

    fn pipeline(sources: Vec<String>, filters: Vec<NamedFilter>) -> OutputPipeline {
        OutputPipeline::from_spec(
            PipelineSpec {
                name: "test".to_string(),
                sink: Arc::new(NullSink {}),
                filters,
                sources,
            },
            None,
        )
        .expect("pipeline must build")
    }

    #[tokio::test]
    async fn empty_allow_list_accepts_everything() {
        let pipeline = pipeline(vec![], vec![]);
        assert!(pipeline.accepts_source("s1"));
        assert!(pipeline.accepts_source(""));
    }

    #[tokio::test]
    async fn allow_list_is_enforced() {
        let pipeline = pipeline(vec!["s1".to_string()], vec![]);
        assert!(pipeline.accepts_source("s1"));
        assert!(!pipeline.accepts_source("s2"));
    }

    #[tokio::test]
    async fn first_dropping_filter_short_circuits() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let filters = vec![
            NamedFilter {
                name: "a".to_string(),
                filter: Box::new(RecordingFilter {
                    name: "a",
                    keep: false,
                    seen: seen.clone(),
                }),
            },
            NamedFilter {
                name: "b".to_string(),
                filter: Box::new(RecordingFilter {
                    name: "b",
                    keep: true,
                    seen: seen.clone(),
                }),
            },
        ];
        let pipeline = pipeline(vec![], filters);

        let mut record = Record::new("info", "x");
        assert!(!pipeline.apply_filters(&mut record));
        assert_eq!(*seen.lock().unwrap(), vec!["a"]);
    }
}
