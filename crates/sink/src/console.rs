//! Definition of the Console sink.

use std::io::Write;

use async_trait::async_trait;
use record::Record;
use serde_yaml::Value;

use crate::{Error, Sink, SinkFactory};

/// A sink that writes one formatted line per record to stdout.
pub struct Console {
    name: String,
}

impl Console {
    /// Creates a new Console sink.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    fn format(record: &Record) -> String {
        let mut line = format!(
            "{} [{}] {}: {}",
            record.timestamp.to_rfc3339(),
            record.level,
            record.source,
            record.message
        );
        for (key, value) in &record.metadata {
            line.push_str(&format!(" {key}={value}"));
        }
        line
    }
}

#[async_trait]
impl Sink for Console {
    async fn write(&self, record: &Record) -> Result<(), Error> {
        let line = Self::format(record);
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{line}").map_err(|e| Error::Write {
            sink: self.name.clone(),
            error: e.to_string(),
        })
    }

    async fn close(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// The factory of the Console sink, registered under the type `console`.
#[derive(Default)]
pub struct ConsoleFactory {}

impl SinkFactory for ConsoleFactory {
    fn create(&self, sink_name: &str, sink_type: &str, _config: Value) -> Result<Box<dyn Sink>, Error> {
        match sink_type {
            "console" => Ok(Box::new(Console::new(sink_name))),
            _ => Err(Error::UnknownSink {
                sink: sink_name.to_string(),
                sink_type: sink_type.to_string(),
            }),
        }
    }
}
