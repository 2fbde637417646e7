//! Thin CLI wrapper around the engine: loads the configuration, builds the
//! topology from the default plugin registry, runs until SIGINT/SIGTERM,
//! and optionally hot-reloads the configuration file.

use std::{path::PathBuf, process::ExitCode, sync::Arc};

use clap::Parser;
use config::{Config, ConfigWatcher};
use engine::Engine;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "logroute", version, about = "Pluggable log-ingestion and routing pipeline")]
struct Args {
    /// Path to the YAML configuration file; built-in defaults when absent.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Watch the configuration file and swap the topology on every valid
    /// change.
    #[arg(long)]
    hot_reload: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            error!(%error, "tokio runtime construction failed");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(args)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(%error, "fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => {
            info!("no configuration file given, using the built-in defaults");
            Config::default()
        }
    };

    let registry = registry::default_registry();
    let mut engine = Engine::from_config(&config, registry)?;
    engine.start().await?;
    let engine = Arc::new(tokio::sync::Mutex::new(engine));

    let mut watcher = match (&args.config, args.hot_reload) {
        (Some(path), true) => Some(spawn_reloader(path.clone(), engine.clone())?),
        (None, true) => {
            warn!("--hot-reload has no effect without --config");
            None
        }
        _ => None,
    };

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");

    if let Some(watcher) = watcher.as_mut() {
        watcher.stop().await;
    }
    engine.lock().await.stop().await?;
    Ok(())
}

/// Installs the configuration watcher and the task applying accepted
/// changes to the engine.
fn spawn_reloader(
    path: PathBuf,
    engine: Arc<tokio::sync::Mutex<Engine>>,
) -> Result<ConfigWatcher, config::Error> {
    let (tx, rx) = flume::unbounded::<Config>();
    let watcher = ConfigWatcher::start(&path, move |new_config| {
        let _ = tx.send(new_config);
    })?;

    drop(tokio::task::spawn(async move {
        while let Ok(new_config) = rx.recv_async().await {
            // The engine mutex is held for the entire swap.
            let mut engine = engine.lock().await;
            match engine.reload(&new_config, registry::default_registry()).await {
                Ok(()) => info!("configuration reloaded"),
                Err(error) => error!(%error, "configuration reload failed"),
            }
        }
    }));

    info!(path = %path.display(), "hot reload enabled");
    Ok(watcher)
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(error) => {
                warn!(%error, "SIGTERM handler not installed, falling back to ctrl-c only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
