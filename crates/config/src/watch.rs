//! Hot-reload watcher for the configuration file.
//!
//! Watches the directory containing the target file, reacts to write events
//! on that file only, de-duplicates bursts by mtime equality, lets partial
//! writes settle for 100 ms, then re-reads, re-validates, and hands the new
//! configuration to the registered callback.

use std::{
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use notify::{Event, EventKind, RecursiveMode, Watcher};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{Config, Error};

/// Window left for a writer to finish before the file is re-read.
const SETTLE_DELAY: Duration = Duration::from_millis(100);

/// A running configuration watcher. Stop is idempotent.
pub struct ConfigWatcher {
    cancel: CancellationToken,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl ConfigWatcher {
    /// Installs a watcher on the configuration file and invokes `on_reload`
    /// with every successfully re-validated new version.
    /// Must be called within a tokio runtime.
    pub fn start<F>(path: impl Into<PathBuf>, on_reload: F) -> Result<Self, Error>
    where
        F: Fn(Config) + Send + Sync + 'static,
    {
        let path: PathBuf = path.into();
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let file_name = path
            .file_name()
            .ok_or_else(|| Error::Watcher {
                message: format!("path has no file name: {}", path.display()),
            })?
            .to_os_string();

        let (tx, rx) = flume::unbounded::<notify::Result<Event>>();
        let mut watcher = notify::recommended_watcher(move |event: notify::Result<Event>| {
            let _ = tx.send(event);
        })
        .map_err(|e| Error::Watcher { message: e.to_string() })?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| Error::Watcher { message: e.to_string() })?;

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let handle = tokio::task::spawn(async move {
            // The watcher must live as long as the task.
            let _watcher = watcher;
            let mut last_mtime: Option<SystemTime> = None;

            loop {
                let event = tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    event = rx.recv_async() => match event {
                        Ok(event) => event,
                        Err(_) => break,
                    }
                };

                let event = match event {
                    Ok(event) => event,
                    Err(error) => {
                        error!(%error, "config watcher backend error");
                        continue;
                    }
                };

                // Write events only; creations and removals are ignored.
                if !matches!(event.kind, EventKind::Modify(_)) {
                    continue;
                }
                if !event
                    .paths
                    .iter()
                    .any(|p| p.file_name().map(|n| n == file_name.as_os_str()).unwrap_or(false))
                {
                    continue;
                }

                let mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
                if mtime.is_some() && mtime == last_mtime {
                    debug!(path = %path.display(), "config event with unchanged mtime ignored");
                    continue;
                }
                last_mtime = mtime;

                tokio::time::sleep(SETTLE_DELAY).await;

                match Config::load(&path) {
                    Ok(config) => {
                        info!(path = %path.display(), "configuration change detected");
                        on_reload(config);
                    }
                    Err(error) => {
                        error!(path = %path.display(), %error, "changed configuration rejected");
                    }
                }
            }
            debug!("config watcher stopped");
        });

        Ok(Self {
            cancel,
            handle: Some(handle),
        })
    }

    /// Stops the watcher. Idempotent.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(error) = handle.await {
                error!(%error, "config watcher join failed");
            }
        }
    }
}
