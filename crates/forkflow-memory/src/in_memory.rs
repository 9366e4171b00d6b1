//! In-process implementation of [`DistributedStore`]
//!
//! Used for development, single-node deployments and tests. Maps are
//! concurrent maps, locks are owner-tagged entries with a notification
//! that wakes waiters whenever any lock is released.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use forkflow_core::ClusterConfig;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::store::DistributedStore;
use crate::MemoryError;

/// In-process cluster
pub struct InMemoryCluster {
    config: ClusterConfig,
    maps: DashMap<String, DashMap<String, Vec<u8>>>,
    locks: DashMap<String, String>,
    released: Notify,
}

impl InMemoryCluster {
    /// Create a cluster with default settings
    pub fn new() -> Self {
        Self::with_config(ClusterConfig::default())
    }

    /// Create a cluster with the given settings
    pub fn with_config(config: ClusterConfig) -> Self {
        info!(cluster = %config.cluster_name, "Creating in-memory cluster");
        Self {
            config,
            maps: DashMap::new(),
            locks: DashMap::new(),
            released: Notify::new(),
        }
    }

    /// Current holder of a lock
    pub fn lock_owner(&self, name: &str) -> Option<String> {
        self.locks.get(name).map(|owner| owner.value().clone())
    }

    /// Number of locks currently held cluster-wide
    pub fn held_lock_count(&self) -> usize {
        self.locks.len()
    }

    fn try_acquire_now(&self, name: &str, owner: &str) -> bool {
        match self.locks.entry(name.to_string()) {
            Entry::Vacant(vacant) => {
                vacant.insert(owner.to_string());
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    async fn acquire(&self, name: &str, owner: &str, deadline: Option<Instant>) -> bool {
        loop {
            // Register interest before checking so a release in between is not missed
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.try_acquire_now(name, owner) {
                trace!(lock = name, owner, "Lock acquired");
                return true;
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return false;
                    }
                }
                None => notified.await,
            }
        }
    }
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DistributedStore for InMemoryCluster {
    fn cluster_name(&self) -> &str {
        &self.config.cluster_name
    }

    async fn map_get(&self, map: &str, key: &str) -> Result<Option<Vec<u8>>, MemoryError> {
        Ok(self
            .maps
            .get(map)
            .and_then(|entries| entries.get(key).map(|v| v.value().clone())))
    }

    async fn map_put(&self, map: &str, key: &str, value: Vec<u8>) -> Result<Option<Vec<u8>>, MemoryError> {
        let entries = self.maps.entry(map.to_string()).or_default();
        Ok(entries.insert(key.to_string(), value))
    }

    async fn map_put_if_absent(
        &self,
        map: &str,
        key: &str,
        value: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, MemoryError> {
        let entries = self.maps.entry(map.to_string()).or_default();
        let existing = match entries.entry(key.to_string()) {
            Entry::Occupied(occupied) => Some(occupied.get().clone()),
            Entry::Vacant(vacant) => {
                vacant.insert(value);
                None
            }
        };
        Ok(existing)
    }

    async fn map_replace(
        &self,
        map: &str,
        key: &str,
        expected: &[u8],
        value: Vec<u8>,
    ) -> Result<bool, MemoryError> {
        let Some(entries) = self.maps.get(map) else {
            return Ok(false);
        };
        let mut replaced = false;
        if let Some(mut current) = entries.get_mut(key) {
            if current.as_slice() == expected {
                *current = value;
                replaced = true;
            }
        }
        Ok(replaced)
    }

    async fn map_remove(&self, map: &str, key: &str) -> Result<Option<Vec<u8>>, MemoryError> {
        Ok(self
            .maps
            .get(map)
            .and_then(|entries| entries.remove(key).map(|(_, v)| v)))
    }

    async fn map_contains(&self, map: &str, key: &str) -> Result<bool, MemoryError> {
        Ok(self
            .maps
            .get(map)
            .map(|entries| entries.contains_key(key))
            .unwrap_or(false))
    }

    async fn map_keys(&self, map: &str) -> Result<Vec<String>, MemoryError> {
        Ok(self
            .maps
            .get(map)
            .map(|entries| entries.iter().map(|e| e.key().clone()).collect())
            .unwrap_or_default())
    }

    async fn map_destroy(&self, map: &str) -> Result<(), MemoryError> {
        if self.maps.remove(map).is_some() {
            debug!(map, "Destroyed map");
        }
        Ok(())
    }

    async fn lock(&self, name: &str, owner: &str) -> Result<(), MemoryError> {
        self.acquire(name, owner, None).await;
        Ok(())
    }

    async fn try_lock(&self, name: &str, owner: &str, timeout: Duration) -> Result<bool, MemoryError> {
        let deadline = Instant::now() + timeout;
        Ok(self.acquire(name, owner, Some(deadline)).await)
    }

    async fn unlock(&self, name: &str, owner: &str) -> Result<(), MemoryError> {
        match self.locks.entry(name.to_string()) {
            Entry::Occupied(occupied) if occupied.get() == owner => {
                occupied.remove();
            }
            Entry::Occupied(occupied) => {
                return Err(MemoryError::LockNotHeld(format!(
                    "{} is held by {}, not {}",
                    name,
                    occupied.get(),
                    owner
                )));
            }
            Entry::Vacant(_) => {
                return Err(MemoryError::LockNotHeld(name.to_string()));
            }
        }

        trace!(lock = name, owner, "Lock released");
        self.released.notify_waiters();
        Ok(())
    }

    async fn is_locked(&self, name: &str) -> Result<bool, MemoryError> {
        Ok(self.locks.contains_key(name))
    }
}
