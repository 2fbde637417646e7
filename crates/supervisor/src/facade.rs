//! Supervisor facades implementing the plugin contracts.
//!
//! The engine talks to a facade exactly as it would to the real plugin; the
//! wrapped instance lives behind the supervisor and may be constructed (or
//! reconstructed) long after the engine started. The facade forwards the
//! assigned name and the ingress channel so a late-created source is wired
//! correctly.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use record::Record;
use sink::Sink;
use source::Source;
use tracing::warn;

use crate::{Supervisor, SupervisorConfig, SupervisorStats, SupervisedPlugin};

/// Adapter binding a boxed source to the supervisor lifecycle.
pub struct SourceHandle {
    inner: Box<dyn Source>,
}

#[async_trait]
impl SupervisedPlugin for SourceHandle {
    async fn activate(&mut self) -> Result<(), String> {
        self.inner.start().await.map_err(|e| e.to_string())
    }

    fn supports_health_check(&self) -> bool {
        self.inner.supports_health_check()
    }

    async fn check_health(&self) -> Result<(), String> {
        self.inner.check_health().await.map_err(|e| e.to_string())
    }

    async fn shutdown(&mut self) -> Result<(), String> {
        self.inner.stop().await.map_err(|e| e.to_string())
    }
}

/// A shareable read handle onto a source supervisor, usable after the
/// facade itself has been boxed away into the engine.
#[derive(Clone)]
pub struct SupervisorProbe {
    supervisor: Arc<Mutex<Option<Supervisor<SourceHandle>>>>,
}

impl SupervisorProbe {
    /// Returns the supervisor view, `None` until the facade was started.
    pub fn stats(&self) -> Option<SupervisorStats> {
        self.supervisor
            .lock()
            .expect("supervisor lock poisoned")
            .as_ref()
            .map(|s| s.stats())
    }
}

/// A stable source facade whose real instance is owned by a supervisor.
///
/// The engine assigns the name and the log channel before `start`; both are
/// kept here and applied to every (re)constructed instance.
pub struct SupervisedSource {
    name: Arc<Mutex<String>>,
    plugin_type: String,
    config: SupervisorConfig,
    channel: Arc<Mutex<Option<flume::Sender<Record>>>>,
    factory: Arc<dyn Fn() -> Result<Box<dyn Source>, source::Error> + Send + Sync>,
    supervisor: Arc<Mutex<Option<Supervisor<SourceHandle>>>>,
}

impl SupervisedSource {
    /// Wraps a source factory. Construction is deferred to `start`.
    pub fn new(
        plugin_type: impl Into<String>,
        config: SupervisorConfig,
        factory: impl Fn() -> Result<Box<dyn Source>, source::Error> + Send + Sync + 'static,
    ) -> Self {
        let plugin_type = plugin_type.into();
        Self {
            name: Arc::new(Mutex::new(plugin_type.clone())),
            plugin_type,
            config,
            channel: Arc::new(Mutex::new(None)),
            factory: Arc::new(factory),
            supervisor: Arc::new(Mutex::new(None)),
        }
    }

    /// Returns a read handle that stays valid after the facade is boxed.
    pub fn probe(&self) -> SupervisorProbe {
        SupervisorProbe {
            supervisor: self.supervisor.clone(),
        }
    }

    /// Returns the supervisor view once `start` has been called.
    pub fn stats(&self) -> Option<SupervisorStats> {
        self.probe().stats()
    }

    /// Returns true once the wrapped source is constructed and running.
    pub fn is_healthy(&self) -> bool {
        self.supervisor
            .lock()
            .expect("supervisor lock poisoned")
            .as_ref()
            .map(|s| s.is_healthy())
            .unwrap_or(false)
    }
}

#[async_trait]
impl Source for SupervisedSource {
    fn set_name(&mut self, name: &str) {
        *self.name.lock().expect("name lock poisoned") = name.to_string();
    }

    fn set_log_channel(&mut self, channel: flume::Sender<Record>) {
        *self.channel.lock().expect("channel lock poisoned") = Some(channel);
    }

    async fn start(&mut self) -> Result<(), source::Error> {
        let mut slot = self.supervisor.lock().expect("supervisor lock poisoned");
        if slot.is_some() {
            return Ok(());
        }

        let name = self.name.lock().expect("name lock poisoned").clone();
        let factory = self.factory.clone();
        let assigned_name = self.name.clone();
        let channel = self.channel.clone();

        let supervisor = Supervisor::spawn(
            name,
            self.plugin_type.clone(),
            self.config.clone(),
            move || {
                let factory = factory.clone();
                let assigned_name = assigned_name.clone();
                let channel = channel.clone();
                async move {
                    let mut inner = factory().map_err(|e| e.to_string())?;
                    inner.set_name(&assigned_name.lock().expect("name lock poisoned").clone());
                    match channel.lock().expect("channel lock poisoned").clone() {
                        Some(channel) => inner.set_log_channel(channel),
                        None => return Err("log channel not installed yet".to_string()),
                    }
                    Ok(SourceHandle { inner })
                }
            },
        );
        *slot = Some(supervisor);
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), source::Error> {
        let supervisor = self.supervisor.lock().expect("supervisor lock poisoned").take();
        if let Some(supervisor) = supervisor {
            supervisor.shutdown().await;
        }
        Ok(())
    }

    fn supports_health_check(&self) -> bool {
        true
    }

    async fn check_health(&self) -> Result<(), source::Error> {
        if self.is_healthy() {
            Ok(())
        } else {
            let cause = self
                .stats()
                .and_then(|s| s.last_error)
                .unwrap_or_else(|| "not initialized yet".to_string());
            Err(source::Error::Source {
                source_name: self.name.lock().expect("name lock poisoned").clone(),
                error: cause,
            })
        }
    }
}

/// Adapter binding a boxed sink to the supervisor lifecycle.
pub struct SinkHandle {
    inner: Box<dyn Sink>,
}

#[async_trait]
impl SupervisedPlugin for SinkHandle {
    fn supports_health_check(&self) -> bool {
        self.inner.supports_health_check()
    }

    async fn check_health(&self) -> Result<(), String> {
        self.inner.check_health().await.map_err(|e| e.to_string())
    }

    async fn shutdown(&mut self) -> Result<(), String> {
        self.inner.close().await.map_err(|e| e.to_string())
    }
}

/// A stable sink facade whose real instance is owned by a supervisor.
///
/// While the instance is missing or unhealthy, `write` fails with the
/// transient `NotAvailable` error, which an output buffer keeps retrying.
pub struct SupervisedSink {
    name: String,
    supervisor: Supervisor<SinkHandle>,
}

impl SupervisedSink {
    /// Wraps a sink factory; construction starts immediately in the
    /// background. Must be called within a tokio runtime.
    pub fn new(
        name: impl Into<String>,
        plugin_type: impl Into<String>,
        config: SupervisorConfig,
        factory: impl Fn() -> Result<Box<dyn Sink>, sink::Error> + Send + Sync + 'static,
    ) -> Self {
        let name = name.into();
        let factory = Arc::new(factory);
        let supervisor = Supervisor::spawn(name.clone(), plugin_type, config, move || {
            let factory = factory.clone();
            async move {
                let inner = factory().map_err(|e| e.to_string())?;
                Ok(SinkHandle { inner })
            }
        });
        Self { name, supervisor }
    }

    /// Returns the supervisor view of the wrapped sink.
    pub fn stats(&self) -> SupervisorStats {
        self.supervisor.stats()
    }

    /// Returns true when the wrapped sink is usable.
    pub fn is_healthy(&self) -> bool {
        self.supervisor.is_healthy()
    }

    /// Polls until the wrapped sink is usable.
    pub async fn wait_for_healthy(&self) -> Result<(), crate::Error> {
        self.supervisor.wait_for_healthy().await
    }
}

#[async_trait]
impl Sink for SupervisedSink {
    async fn write(&self, record: &Record) -> Result<(), sink::Error> {
        match self.supervisor.get_plugin().await {
            Ok(handle) => handle.inner.write(record).await,
            Err(error) => {
                warn!(sink = %self.name, %error, "write refused, sink not available");
                Err(sink::Error::NotAvailable {
                    sink: self.name.clone(),
                    cause: error.to_string(),
                })
            }
        }
    }

    async fn close(&self) -> Result<(), sink::Error> {
        self.supervisor.shutdown().await;
        Ok(())
    }

    fn supports_health_check(&self) -> bool {
        true
    }

    async fn check_health(&self) -> Result<(), sink::Error> {
        if self.is_healthy() {
            Ok(())
        } else {
            Err(sink::Error::NotAvailable {
                sink: self.name.clone(),
                cause: self.supervisor.stats().last_error.unwrap_or_else(|| "not initialized yet".to_string()),
            })
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    struct ChannelSource {
        name: String,
        channel: Option<flume::Sender<Record>>,
    }

    #[async_trait]
    impl Source for ChannelSource {
        fn set_name(&mut self, name: &str) {
            self.name = name.to_string();
        }

        fn set_log_channel(&mut self, channel: flume::Sender<Record>) {
            self.channel = Some(channel);
        }

        async fn start(&mut self) -> Result<(), source::Error> {
            let channel = self.channel.clone().ok_or_else(|| source::Error::Source {
                source_name: self.name.clone(),
                error: "no channel".to_string(),
            })?;
            let mut record = Record::new("info", "started");
            record.source = self.name.clone();
            channel.send_async(record).await.map_err(|e| source::Error::Source {
                source_name: self.name.clone(),
                error: e.to_string(),
            })
        }

        async fn stop(&mut self) -> Result<(), source::Error> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn late_created_source_gets_name_and_channel() {
        let failures = Arc::new(AtomicU32::new(0));
        let failures_clone = failures.clone();

        let mut facade = SupervisedSource::new(
            "docker",
            SupervisorConfig {
                retry_interval_seconds: 1,
                max_retries: 0,
                health_check_interval_seconds: 0,
            },
            move || {
                if failures_clone.fetch_add(1, Ordering::SeqCst) < 1 {
                    Err(source::Error::Source {
                        source_name: "docker".to_string(),
                        error: "daemon unreachable".to_string(),
                    })
                } else {
                    Ok(Box::new(ChannelSource {
                        name: String::new(),
                        channel: None,
                    }) as Box<dyn Source>)
                }
            },
        );

        let (tx, rx) = flume::bounded(4);
        facade.set_name("containers");
        facade.set_log_channel(tx);
        facade.start().await.unwrap();

        let record = rx.recv_async().await.unwrap();
        assert_eq!(record.source, "containers");
        assert_eq!(record.message, "started");
        assert!(failures.load(Ordering::SeqCst) >= 2);

        facade.stop().await.unwrap();
    }

    #[tokio::test]
    async fn unavailable_sink_write_is_transient() {
        let supervised = SupervisedSink::new(
            "es",
            "elasticsearch",
            SupervisorConfig {
                retry_interval_seconds: 60,
                max_retries: 0,
                health_check_interval_seconds: 0,
            },
            || {
                Err(sink::Error::NotAvailable {
                    sink: "es".to_string(),
                    cause: "cluster down".to_string(),
                })
            },
        );

        let record = Record::new("info", "x");
        let result = supervised.write(&record).await;
        assert!(matches!(result, Err(sink::Error::NotAvailable { .. })));
        supervised.close().await.unwrap();
    }
}
