// Not every integration-test binary exercises every helper.
#![allow(dead_code)]

use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use record::Record;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Initializes logs for the integration tests. Safe to call repeatedly.
pub fn init() {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::ERROR).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Polls a predicate until it holds or the deadline passes.
pub async fn wait_until(deadline: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    predicate()
}

/// A handle for pushing records through a [`PushSource`] from the test
/// body, tagged with the name the engine assigned to the source.
#[derive(Clone)]
pub struct PushHandle {
    name: Arc<Mutex<String>>,
    channel: Arc<Mutex<Option<flume::Sender<Record>>>>,
}

impl PushHandle {
    pub async fn push(&self, level: &str, message: &str) {
        let mut record = Record::new(level, message);
        record.source = self.name.lock().unwrap().clone();
        let sender = self
            .channel
            .lock()
            .unwrap()
            .clone()
            .expect("source must be registered before pushing");
        sender.send_async(record).await.expect("ingress channel must accept");
    }
}

/// A source whose records are injected by the test body.
pub struct PushSource {
    name: Arc<Mutex<String>>,
    channel: Arc<Mutex<Option<flume::Sender<Record>>>>,
}

impl PushSource {
    pub fn new() -> (Self, PushHandle) {
        let name = Arc::new(Mutex::new(String::new()));
        let channel = Arc::new(Mutex::new(None));
        let handle = PushHandle {
            name: name.clone(),
            channel: channel.clone(),
        };
        (Self { name, channel }, handle)
    }
}

#[async_trait]
impl source::Source for PushSource {
    fn set_name(&mut self, name: &str) {
        *self.name.lock().unwrap() = name.to_string();
    }

    fn set_log_channel(&mut self, channel: flume::Sender<Record>) {
        *self.channel.lock().unwrap() = Some(channel);
    }

    async fn start(&mut self) -> Result<(), source::Error> {
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), source::Error> {
        Ok(())
    }
}

/// A sink collecting every delivered record.
pub struct CollectingSink {
    records: Arc<Mutex<Vec<Record>>>,
}

impl CollectingSink {
    pub fn new() -> (Arc<Self>, Arc<Mutex<Vec<Record>>>) {
        let records = Arc::new(Mutex::new(Vec::new()));
        (
            Arc::new(Self {
                records: records.clone(),
            }),
            records,
        )
    }
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

/// A sink that fails its first `failures` writes, then collects.
pub struct FlakySink {
    failures: u32,
    calls: AtomicU32,
    records: Arc<Mutex<Vec<Record>>>,
}

impl FlakySink {
    pub fn new(failures: u32) -> (Arc<Self>, Arc<Mutex<Vec<Record>>>) {
        let records = Arc::new(Mutex::new(Vec::new()));
        (
            Arc::new(Self {
                failures,
                calls: AtomicU32::new(0),
                records: records.clone(),
            }),
            records,
        )
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl sink::Sink for FlakySink {
    async fn write(&self, record: &Record) -> Result<(), sink::Error> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(sink::Error::Write {
                sink: "flaky".to_string(),
                error: "induced failure".to_string(),
            });
        }
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), sink::Error> {
        Ok(())
    }
}
