//! Subscription registry: the only place mutable cache state lives.
//!
//! Create one registry at startup ([`Registry::shared`]) and hand the same
//! handle to the [`TemplateCache`](crate::TemplateCache) and the
//! [`Dispatcher`](crate::Dispatcher). Critical sections are short and never
//! span an await or a consumer callback.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use templink_core::{CacheKey, CorrelationId};

use crate::entry::CacheEntry;

/// Registry handle shared by the facade and the dispatcher.
pub type SharedRegistry = Arc<Mutex<Registry>>;

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of entries currently in the registry.
    pub entries: usize,
    /// Number of registered callbacks across all entries.
    pub subscribers: usize,
    /// Subscribes that joined an existing entry.
    pub hits: u64,
    /// Subscribes that created an entry.
    pub misses: u64,
    /// Backend subscribe calls issued, reconnects included.
    pub backend_subscribes: u64,
    /// Backend unsubscribe calls issued.
    pub backend_unsubscribes: u64,
    /// Pushes applied to an entry.
    pub pushes_delivered: u64,
    /// Pushes dropped because no entry owned them.
    pub orphaned_pushes: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Map from key to entry, plus the correlation routing table used by the
/// dispatcher.
#[derive(Debug, Default)]
pub struct Registry {
    entries: HashMap<CacheKey, CacheEntry>,
    routes: HashMap<CorrelationId, CacheKey>,
    next_correlation: u64,
    counters: CacheStats,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh registry behind the shared handle.
    pub fn shared() -> SharedRegistry {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn get(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    pub(crate) fn get_mut(&mut self, key: &CacheKey) -> Option<&mut CacheEntry> {
        self.entries.get_mut(key)
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Resolve a push's correlation id to the key of its entry.
    pub fn resolve(&self, correlation: CorrelationId) -> Option<&CacheKey> {
        self.routes.get(&correlation)
    }

    pub(crate) fn allocate_correlation(&mut self) -> CorrelationId {
        self.next_correlation += 1;
        CorrelationId::new(self.next_correlation)
    }

    pub(crate) fn insert(&mut self, entry: CacheEntry) {
        self.routes.insert(entry.id(), entry.key().clone());
        self.entries.insert(entry.key().clone(), entry);
    }

    pub(crate) fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.routes.remove(&entry.id());
        Some(entry)
    }

    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values()
    }

    pub(crate) fn entries_mut(&mut self) -> impl Iterator<Item = &mut CacheEntry> {
        self.entries.values_mut()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn counters_mut(&mut self) -> &mut CacheStats {
        &mut self.counters
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            subscribers: self.entries.values().map(CacheEntry::subscriber_count).sum(),
            ..self.counters.clone()
        }
    }
}

/// Lock the registry. A panic inside a critical section cannot leave an
/// entry half-updated (no callbacks run under the lock), so poisoning is
/// ignored.
pub(crate) fn lock(registry: &SharedRegistry) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}
