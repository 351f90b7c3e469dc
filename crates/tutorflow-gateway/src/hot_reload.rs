//! Responder directory hot-reload via filesystem watcher.
//!
//! Any change to a responder YAML file invalidates the catalog, so every
//! cache on the same invalidation bus reloads the directory on next read.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{EventKind, RecursiveMode, Watcher};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use tutorflow_core::registry::ResponderCatalog;

/// A responder directory change.
#[derive(Debug, Clone)]
pub struct ResponderChange {
    pub paths: Vec<PathBuf>,
}

/// Watches the responder directory and invalidates the catalog on change.
pub struct ResponderWatcher {
    change_tx: broadcast::Sender<ResponderChange>,
    _watcher: notify::RecommendedWatcher,
}

fn is_responder_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml" | "yml")
    )
}

impl ResponderWatcher {
    /// Start watching the catalog's directory.
    /// Returns the watcher and a receiver for change events.
    pub fn start(
        catalog: Arc<ResponderCatalog>,
    ) -> anyhow::Result<(Self, broadcast::Receiver<ResponderChange>)> {
        let Some(dir) = catalog.dir().map(Path::to_path_buf) else {
            anyhow::bail!("Responder catalog is not backed by a directory");
        };
        let (change_tx, change_rx) = broadcast::channel(16);

        let tx = change_tx.clone();
        let mut watcher =
            notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                match res {
                    Ok(event) => {
                        if !matches!(
                            event.kind,
                            EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
                        ) {
                            return;
                        }
                        let paths: Vec<PathBuf> = event
                            .paths
                            .into_iter()
                            .filter(|p| is_responder_file(p))
                            .collect();
                        if paths.is_empty() {
                            return;
                        }
                        debug!(?paths, "Responder files changed, invalidating catalog");
                        catalog.invalidate();
                        let _ = tx.send(ResponderChange { paths });
                    }
                    Err(e) => {
                        error!(%e, "Responder directory watch error");
                    }
                }
            })?;

        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        info!(dir = %dir.display(), "Responder directory watcher started");

        Ok((
            Self {
                change_tx,
                _watcher: watcher,
            },
            change_rx,
        ))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResponderChange> {
        self.change_tx.subscribe()
    }
}
