//! Responder registry: YAML responder definitions loaded from a directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cache::{InvalidationBus, TtlCache};
use crate::error::{Result, TutorError};
use crate::types::Responder;

impl Responder {
    /// Load a responder definition from a YAML file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut responder: Responder = serde_yaml::from_str(&content)?;
        if responder.id.trim().is_empty() {
            return Err(TutorError::Registry(format!(
                "{}: responder id is empty",
                path.display()
            )));
        }
        if responder.capability.trim().is_empty() {
            return Err(TutorError::Registry(format!(
                "{}: responder '{}' has no capability",
                path.display(),
                responder.id
            )));
        }
        responder.file_path = path.to_path_buf();
        Ok(responder)
    }
}

/// Immutable catalog of responders, shared across sessions.
#[derive(Debug, Default)]
pub struct ResponderRegistry {
    responders: BTreeMap<String, Arc<Responder>>,
}

impl ResponderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_responders(responders: impl IntoIterator<Item = Responder>) -> Self {
        let mut registry = Self::new();
        for r in responders {
            registry.insert(r);
        }
        registry
    }

    fn insert(&mut self, responder: Responder) {
        if let Some(previous) = self.responders.get(&responder.id) {
            warn!(
                id = %responder.id,
                previous = %previous.file_path.display(),
                replacement = %responder.file_path.display(),
                "Duplicate responder id, last definition wins"
            );
        }
        self.responders
            .insert(responder.id.clone(), Arc::new(responder));
    }

    /// Load all `.yaml`/`.yml` responders from a directory.
    ///
    /// Invalid files are skipped with a warning; a missing directory yields an
    /// empty registry.
    pub fn load_from_dir(dir: &Path) -> Self {
        let mut registry = Self::new();
        if !dir.exists() {
            debug!(dir = %dir.display(), "Responder directory not found, skipping");
            return registry;
        }

        let entries = match std::fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) => {
                warn!(%e, dir = %dir.display(), "Failed to read responder directory");
                return registry;
            }
        };

        let mut paths: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
        // Deterministic "last wins" order for duplicates.
        paths.sort();

        for path in paths {
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            if ext != "yaml" && ext != "yml" {
                continue;
            }
            match Responder::load_from_file(&path) {
                Ok(responder) => {
                    debug!(id = %responder.id, tier = %responder.tier, "Loaded responder");
                    registry.insert(responder);
                }
                Err(e) => {
                    warn!(%e, path = %path.display(), "Failed to load responder");
                }
            }
        }

        info!(count = registry.responders.len(), "Responders loaded");
        registry
    }

    pub fn get(&self, id: &str) -> Option<Arc<Responder>> {
        self.responders.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.responders.contains_key(id)
    }

    /// All responder ids, sorted.
    pub fn list(&self) -> Vec<&str> {
        self.responders.keys().map(|s| s.as_str()).collect()
    }

    pub fn all(&self) -> Vec<Arc<Responder>> {
        self.responders.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.responders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.responders.is_empty()
    }
}

const CATALOG_CACHE: &str = "responders";
const CATALOG_KEY: &str = "catalog";

/// Serves the registry through a [`TtlCache`], reloading from disk on miss.
pub struct ResponderCatalog {
    source: CatalogSource,
    cache: TtlCache<Arc<ResponderRegistry>>,
}

enum CatalogSource {
    Dir(PathBuf),
    Fixed(Arc<ResponderRegistry>),
}

impl ResponderCatalog {
    pub fn from_dir(dir: PathBuf, ttl: Duration, bus: &InvalidationBus) -> Self {
        Self {
            source: CatalogSource::Dir(dir),
            cache: TtlCache::new(CATALOG_CACHE, ttl, bus),
        }
    }

    /// A catalog that never touches the filesystem.
    pub fn fixed(registry: ResponderRegistry) -> Self {
        Self {
            source: CatalogSource::Fixed(Arc::new(registry)),
            cache: TtlCache::new(CATALOG_CACHE, Duration::MAX, &InvalidationBus::new()),
        }
    }

    /// The current registry snapshot.
    pub fn current(&self) -> Arc<ResponderRegistry> {
        if let Some(registry) = self.cache.get(CATALOG_KEY) {
            return registry;
        }
        let registry = match &self.source {
            CatalogSource::Dir(dir) => Arc::new(ResponderRegistry::load_from_dir(dir)),
            CatalogSource::Fixed(registry) => registry.clone(),
        };
        self.cache.insert(CATALOG_KEY, registry.clone());
        registry
    }

    /// Force every catalog sharing the bus to reload on next read.
    pub fn invalidate(&self) {
        self.cache.invalidate_all();
    }

    pub fn dir(&self) -> Option<&Path> {
        match &self.source {
            CatalogSource::Dir(dir) => Some(dir),
            CatalogSource::Fixed(_) => None,
        }
    }
}
