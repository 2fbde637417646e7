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

//! Resilient plugin supervisor.
//!
//! A supervisor lets the engine start even when a plugin's external
//! dependency (broker, daemon, cluster) is unreachable: construction runs
//! in a background task that retries with exponential backoff, and an
//! optional ticker monitors the health of the constructed instance.
//! "Not yet connected" is a normal state, not an error.

use std::{
    fmt::{Display, Formatter},
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex, RwLock,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub mod facade;

pub use facade::{SupervisedSink, SupervisedSource, SupervisorProbe};

/// Upper bound of the construction-retry backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(120);

/// Per-call timeout of a plugin health check.
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll period of [`Supervisor::wait_for_healthy`].
const WAIT_POLL: Duration = Duration::from_millis(100);

/// List of errors that can occur with a supervisor.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The supervisor has no healthy instance at the moment.
    #[error("plugin not available (plugin: {plugin}, cause: {cause})")]
    NotAvailable {
        /// The name of the supervised plugin.
        plugin: String,
        /// The last known cause.
        cause: String,
    },

    /// The supervisor exhausted its construction retries.
    #[error("plugin construction abandoned (plugin: {plugin}, retries: {retries})")]
    GaveUp {
        /// The name of the supervised plugin.
        plugin: String,
        /// Number of attempts made.
        retries: u32,
    },

    /// The supervisor was shut down.
    #[error("supervisor cancelled (plugin: {plugin})")]
    Cancelled {
        /// The name of the supervised plugin.
        plugin: String,
    },
}

/// The supervisor's view of a wrapped plugin.
///
/// Transitions are driven only by the supervisor; external callers read but
/// never write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    /// Never initialized.
    Unknown,
    /// Last check passed or construction succeeded.
    Healthy,
    /// Last check failed or construction is still failing.
    Unhealthy,
    /// Once unhealthy, a new construction attempt is in flight.
    Recovering,
}

impl Display for Health {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Health::Unknown => "unknown",
            Health::Healthy => "healthy",
            Health::Unhealthy => "unhealthy",
            Health::Recovering => "recovering",
        };
        f.write_str(name)
    }
}

/// Configuration of a supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Base delay between construction attempts; doubled per failure and
    /// capped at two minutes.
    #[serde(default = "default_retry_interval_seconds")]
    pub retry_interval_seconds: u64,

    /// Construction attempts before giving up. Zero means retry forever.
    #[serde(default)]
    pub max_retries: u32,

    /// Period of the health-check ticker. Zero disables health checks.
    #[serde(default)]
    pub health_check_interval_seconds: u64,
}

fn default_retry_interval_seconds() -> u64 {
    5
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            retry_interval_seconds: default_retry_interval_seconds(),
            max_retries: 0,
            health_check_interval_seconds: 0,
        }
    }
}

impl SupervisorConfig {
    /// Base retry interval as a duration.
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_seconds.max(1))
    }

    /// Health-check period as a duration, `None` when disabled.
    pub fn health_check_interval(&self) -> Option<Duration> {
        (self.health_check_interval_seconds > 0)
            .then(|| Duration::from_secs(self.health_check_interval_seconds))
    }
}

/// A point-in-time view of a supervisor, as served by the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStats {
    /// The name of the supervised plugin.
    pub name: String,
    /// The type of the supervised plugin.
    pub plugin_type: String,
    /// Current health.
    pub health: Health,
    /// Construction attempts made so far.
    pub retries: u32,
    /// Instant of the last successful construction or health check.
    pub last_healthy: Option<DateTime<Utc>>,
    /// The last recorded error.
    pub last_error: Option<String>,
}

/// The lifecycle hooks a plugin exposes to its supervisor.
///
/// Facades adapt the concrete plugin contracts (source, sink) to this
/// trait; errors are carried as strings because the supervisor only records
/// and reports them.
#[async_trait]
pub trait SupervisedPlugin: Send + Sync + 'static {
    /// Invoked right after construction, before the instance is published
    /// as healthy. For a source this is where `start` happens; a failure
    /// here counts as a construction failure.
    async fn activate(&mut self) -> Result<(), String> {
        Ok(())
    }

    /// Whether the plugin opts into periodic health checks.
    fn supports_health_check(&self) -> bool {
        false
    }

    /// Checks the plugin's external dependency.
    async fn check_health(&self) -> Result<(), String> {
        Ok(())
    }

    /// Releases the plugin (stop/close).
    async fn shutdown(&mut self) -> Result<(), String> {
        Ok(())
    }
}

struct Shared<P> {
    name: String,
    plugin_type: String,
    plugin: tokio::sync::Mutex<Option<P>>,
    health: RwLock<Health>,
    retries: AtomicU32,
    gave_up: AtomicBool,
    last_error: Mutex<Option<String>>,
    last_healthy: Mutex<Option<DateTime<Utc>>>,
    cancel: CancellationToken,
}

impl<P> Shared<P> {
    fn set_health(&self, health: Health) {
        *self.health.write().expect("health lock poisoned") = health;
    }

    fn health(&self) -> Health {
        *self.health.read().expect("health lock poisoned")
    }

    fn record_error(&self, error: String) {
        *self.last_error.lock().expect("last error lock poisoned") = Some(error);
    }

    fn record_healthy(&self) {
        *self.last_healthy.lock().expect("last healthy lock poisoned") = Some(Utc::now());
    }

    fn last_error(&self) -> String {
        self.last_error
            .lock()
            .expect("last error lock poisoned")
            .clone()
            .unwrap_or_else(|| "not initialized yet".to_string())
    }
}

/// The wrapper that owns a plugin's lifecycle under failure.
pub struct Supervisor<P: SupervisedPlugin> {
    shared: Arc<Shared<P>>,
    config: SupervisorConfig,
    tasks: tokio::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl<P: SupervisedPlugin> Supervisor<P> {
    /// Creates the supervisor and immediately spawns the background
    /// initialization task (and the health-check task when enabled).
    /// Must be called within a tokio runtime.
    pub fn spawn<F, Fut>(
        name: impl Into<String>,
        plugin_type: impl Into<String>,
        config: SupervisorConfig,
        factory: F,
    ) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<P, String>> + Send + 'static,
    {
        let shared = Arc::new(Shared {
            name: name.into(),
            plugin_type: plugin_type.into(),
            plugin: tokio::sync::Mutex::new(None),
            health: RwLock::new(Health::Unknown),
            retries: AtomicU32::new(0),
            gave_up: AtomicBool::new(false),
            last_error: Mutex::new(None),
            last_healthy: Mutex::new(None),
            cancel: CancellationToken::new(),
        });

        let mut tasks = Vec::new();
        tasks.push(tokio::task::spawn(init_loop(shared.clone(), config.clone(), factory)));
        if let Some(interval) = config.health_check_interval() {
            tasks.push(tokio::task::spawn(health_loop(shared.clone(), interval)));
        }

        Self {
            shared,
            config,
            tasks: tokio::sync::Mutex::new(tasks),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Current health of the wrapped plugin.
    pub fn health(&self) -> Health {
        self.shared.health()
    }

    /// Returns true when the wrapped plugin is usable.
    pub fn is_healthy(&self) -> bool {
        self.shared.health() == Health::Healthy
    }

    /// Returns the wrapped instance, guarded, only while it is healthy.
    pub async fn get_plugin(&self) -> Result<tokio::sync::MappedMutexGuard<'_, P>, Error> {
        if !self.is_healthy() {
            return Err(Error::NotAvailable {
                plugin: self.shared.name.clone(),
                cause: self.shared.last_error(),
            });
        }
        let guard = self.shared.plugin.lock().await;
        tokio::sync::MutexGuard::try_map(guard, |p| p.as_mut()).map_err(|_| Error::NotAvailable {
            plugin: self.shared.name.clone(),
            cause: self.shared.last_error(),
        })
    }

    /// Polls until the plugin becomes healthy, the supervisor gives up, or
    /// it is shut down.
    pub async fn wait_for_healthy(&self) -> Result<(), Error> {
        loop {
            if self.is_healthy() {
                return Ok(());
            }
            if self.shared.gave_up.load(Ordering::Acquire) {
                return Err(Error::GaveUp {
                    plugin: self.shared.name.clone(),
                    retries: self.shared.retries.load(Ordering::Acquire),
                });
            }
            if self.shared.cancel.is_cancelled() {
                return Err(Error::Cancelled {
                    plugin: self.shared.name.clone(),
                });
            }
            tokio::time::sleep(WAIT_POLL).await;
        }
    }

    /// Returns a point-in-time view of the supervisor.
    pub fn stats(&self) -> SupervisorStats {
        SupervisorStats {
            name: self.shared.name.clone(),
            plugin_type: self.shared.plugin_type.clone(),
            health: self.shared.health(),
            retries: self.shared.retries.load(Ordering::Acquire),
            last_healthy: *self
                .shared
                .last_healthy
                .lock()
                .expect("last healthy lock poisoned"),
            last_error: self
                .shared
                .last_error
                .lock()
                .expect("last error lock poisoned")
                .clone(),
        }
    }

    /// The configuration this supervisor runs with.
    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Cancels the background tasks and releases the wrapped plugin.
    /// Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.cancel.cancel();
        for task in self.tasks.lock().await.drain(..) {
            if let Err(error) = task.await {
                error!(plugin = %self.shared.name, %error, "supervisor task join failed");
            }
        }
        if let Some(mut plugin) = self.shared.plugin.lock().await.take() {
            if let Err(error) = plugin.shutdown().await {
                error!(plugin = %self.shared.name, %error, "supervised plugin shutdown failed");
            }
        }
        self.shared.set_health(Health::Unknown);
    }
}

async fn init_loop<P, F, Fut>(shared: Arc<Shared<P>>, config: SupervisorConfig, factory: F)
where
    P: SupervisedPlugin,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<P, String>> + Send,
{
    let mut delay = config.retry_interval();
    loop {
        if shared.cancel.is_cancelled() {
            return;
        }

        let created = tokio::select! {
            _ = shared.cancel.cancelled() => return,
            created = factory() => created,
        };
        let failure = match created {
            Ok(mut plugin) => {
                let activated = tokio::select! {
                    _ = shared.cancel.cancelled() => return,
                    activated = plugin.activate() => activated,
                };
                match activated {
                    Ok(()) => {
                        *shared.plugin.lock().await = Some(plugin);
                        shared.set_health(Health::Healthy);
                        shared.record_healthy();
                        shared.retries.store(0, Ordering::Release);
                        info!(plugin = %shared.name, plugin_type = %shared.plugin_type, "supervised plugin ready");
                        return;
                    }
                    // A failing activation counts as a construction failure.
                    Err(error) => error,
                }
            }
            Err(error) => error,
        };

        let attempt = shared.retries.fetch_add(1, Ordering::AcqRel) + 1;
        shared.record_error(failure.clone());
        shared.set_health(Health::Unhealthy);
        warn!(
            plugin = %shared.name,
            plugin_type = %shared.plugin_type,
            attempt,
            error = %failure,
            "supervised plugin construction failed"
        );

        if config.max_retries > 0 && attempt >= config.max_retries {
            shared.gave_up.store(true, Ordering::Release);
            error!(
                plugin = %shared.name,
                plugin_type = %shared.plugin_type,
                retries = attempt,
                "supervised plugin construction abandoned"
            );
            return;
        }

        tokio::select! {
            _ = shared.cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(MAX_BACKOFF);
        shared.set_health(Health::Recovering);
    }
}

async fn health_loop<P: SupervisedPlugin>(shared: Arc<Shared<P>>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let guard = shared.plugin.lock().await;
        let Some(plugin) = guard.as_ref() else {
            continue;
        };
        if !plugin.supports_health_check() {
            continue;
        }

        match tokio::time::timeout(HEALTH_CHECK_TIMEOUT, plugin.check_health()).await {
            Ok(Ok(())) => {
                if shared.health() != Health::Healthy {
                    info!(plugin = %shared.name, "supervised plugin recovered");
                }
                shared.set_health(Health::Healthy);
                shared.record_healthy();
            }
            Ok(Err(error)) => {
                shared.record_error(error.clone());
                shared.set_health(Health::Unhealthy);
                warn!(plugin = %shared.name, %error, "health check failed");
            }
            Err(_elapsed) => {
                shared.record_error("health check timed out".to_string());
                shared.set_health(Health::Unhealthy);
                warn!(plugin = %shared.name, "health check timed out");
            }
        }
    }
}
