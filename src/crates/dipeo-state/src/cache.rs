//! TTL hot cache for active executions.
//!
//! Avoids a database round trip for every observer write while an execution
//! is running. Entries expire after the TTL or when the execution turns
//! inactive.

use crate::models::ExecutionState;
use dipeo_core::ids::ExecutionId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct CacheEntry {
    state: ExecutionState,
    inserted_at: Instant,
}

pub struct ExecutionCache {
    ttl: Duration,
    entries: RwLock<HashMap<ExecutionId, CacheEntry>>,
}

impl ExecutionCache {
    /// Default TTL of one hour, matching the execution-level timeout.
    pub fn new() -> Self {
        Self::with_ttl(Duration::from_secs(60 * 60))
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, id: &ExecutionId) -> Option<ExecutionState> {
        let entries = self.entries.read();
        let entry = entries.get(id)?;
        if entry.inserted_at.elapsed() > self.ttl {
            drop(entries);
            self.entries.write().remove(id);
            return None;
        }
        Some(entry.state.clone())
    }

    pub fn set(&self, state: ExecutionState) {
        self.entries.write().insert(
            state.id.clone(),
            CacheEntry {
                state,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn remove(&self, id: &ExecutionId) {
        self.entries.write().remove(id);
    }

    pub fn contains(&self, id: &ExecutionId) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drop all expired entries. Called opportunistically by the stores.
    pub fn prune_expired(&self) {
        self.entries
            .write()
            .retain(|_, entry| entry.inserted_at.elapsed() <= self.ttl);
    }
}

impl Default for ExecutionCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdMap;

    fn state(id: &str) -> ExecutionState {
        ExecutionState::new(ExecutionId::new(id), None, StdMap::new())
    }

    #[test]
    fn test_set_get_remove() {
        let cache = ExecutionCache::new();
        cache.set(state("e1"));
        assert!(cache.contains(&ExecutionId::new("e1")));
        cache.remove(&ExecutionId::new("e1"));
        assert!(!cache.contains(&ExecutionId::new("e1")));
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = ExecutionCache::with_ttl(Duration::from_millis(0));
        cache.set(state("e1"));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get(&ExecutionId::new("e1")).is_none());
    }

    #[test]
    fn test_prune_expired() {
        let cache = ExecutionCache::with_ttl(Duration::from_millis(0));
        cache.set(state("e1"));
        cache.set(state("e2"));
        std::thread::sleep(Duration::from_millis(5));
        cache.prune_expired();
        assert!(cache.is_empty());
    }
}
