//! TTL cache service with publish-style invalidation.
//!
//! Every [`TtlCache`] attached to the same [`InvalidationBus`] drops entries
//! invalidated by any other holder of the bus before serving a read.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

/// Capacity of the invalidation channel; lagging receivers clear everything.
const BUS_CAPACITY: usize = 256;

/// One invalidation message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invalidation {
    pub cache: String,
    /// `None` invalidates every entry of the named cache.
    pub key: Option<String>,
}

/// Shared publish channel for cache invalidations.
#[derive(Debug, Clone)]
pub struct InvalidationBus {
    tx: broadcast::Sender<Invalidation>,
}

impl Default for InvalidationBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InvalidationBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publish an invalidation. Returns how many caches received it.
    pub fn publish(&self, invalidation: Invalidation) -> usize {
        self.tx.send(invalidation).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Invalidation> {
        self.tx.subscribe()
    }
}

struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

/// A keyed cache with a declared TTL and explicit invalidation.
pub struct TtlCache<V> {
    name: String,
    ttl: Duration,
    entries: Mutex<HashMap<String, Entry<V>>>,
    bus: InvalidationBus,
    rx: Mutex<broadcast::Receiver<Invalidation>>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(name: impl Into<String>, ttl: Duration, bus: &InvalidationBus) -> Self {
        Self {
            name: name.into(),
            ttl,
            entries: Mutex::new(HashMap::new()),
            bus: bus.clone(),
            rx: Mutex::new(bus.subscribe()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry<V>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply invalidations published since the last read.
    fn drain_invalidations(&self) {
        let mut rx = self.rx.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            match rx.try_recv() {
                Ok(inv) if inv.cache == self.name => match inv.key {
                    Some(key) => {
                        self.entries().remove(&key);
                    }
                    None => self.entries().clear(),
                },
                Ok(_) => {}
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    debug!(cache = %self.name, missed, "Invalidation bus lagged, clearing cache");
                    self.entries().clear();
                }
                Err(_) => break,
            }
        }
    }

    /// Fresh value for `key`, if present and not expired.
    pub fn get(&self, key: &str) -> Option<V> {
        self.drain_invalidations();
        let mut entries = self.entries();
        match entries.get(key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: impl Into<String>, value: V) {
        self.entries().insert(
            key.into(),
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Return the cached value or load, insert and return a fresh one.
    pub async fn get_or_try_load<E, F, Fut>(&self, key: &str, load: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }
        let value = load().await?;
        self.insert(key, value.clone());
        Ok(value)
    }

    /// Drop `key` here and in every cache sharing the bus.
    pub fn invalidate(&self, key: &str) {
        self.entries().remove(key);
        self.bus.publish(Invalidation {
            cache: self.name.clone(),
            key: Some(key.to_string()),
        });
    }

    /// Drop everything here and in every cache sharing the bus.
    pub fn invalidate_all(&self) {
        self.entries().clear();
        self.bus.publish(Invalidation {
            cache: self.name.clone(),
            key: None,
        });
    }

    pub fn len(&self) -> usize {
        self.drain_invalidations();
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
