//! Lifecycle of named distributed caches.
//!
//! Cache metadata (settings and access times) is kept in a registry map of
//! the store; each cache's entries live in their own data map. Caches that
//! stay idle longer than their `max_idle` are destroyed by
//! [`CacheLifecycleManager::reclaim_idle_caches`], either on demand or from
//! the background reclaimer.

use chrono::{DateTime, Utc};
use forkflow_core::{CacheDefaults, EvictionPolicy};
use forkflow_monitoring::{LogExt, MemoryMetrics};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::store::{get_json, update_json, DistributedStore};
use crate::MemoryError;

const CACHE_REGISTRY_MAP: &str = "forkflow.caches";
const CACHE_DATA_PREFIX: &str = "forkflow.cache.";

/// Settings of one cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Entry time to live in milliseconds, 0 for none
    pub ttl_ms: u64,
    /// Idle time after which the cache is reclaimed, in milliseconds
    pub max_idle_ms: u64,
    /// Eviction policy applied by the backing store
    pub eviction_policy: EvictionPolicy,
    /// Maximum entries, 0 for unbounded
    pub max_entries: usize,
}

impl From<&CacheDefaults> for CacheSettings {
    fn from(defaults: &CacheDefaults) -> Self {
        Self {
            ttl_ms: defaults.ttl_ms,
            max_idle_ms: defaults.max_idle_ms,
            eviction_policy: defaults.eviction_policy,
            max_entries: defaults.max_entries,
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self::from(&CacheDefaults::default())
    }
}

/// Registry entry of a cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheInfo {
    /// Cache name
    pub name: String,
    /// Settings
    pub settings: CacheSettings,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last read or write through the cache
    pub last_accessed_at: DateTime<Utc>,
}

impl CacheInfo {
    /// Store map holding the cache entries
    pub fn data_map(&self) -> String {
        data_map_name(&self.name)
    }

    /// Whether the cache has been idle longer than its limit at `now`
    pub fn is_idle(&self, now: DateTime<Utc>) -> bool {
        let idle_ms = (now - self.last_accessed_at).num_milliseconds();
        idle_ms >= 0 && idle_ms as u64 >= self.settings.max_idle_ms
    }
}

pub(crate) fn data_map_name(name: &str) -> String {
    format!("{}{}", CACHE_DATA_PREFIX, name)
}

/// Creates, looks up, touches and destroys named caches
#[derive(Clone)]
pub struct CacheLifecycleManager {
    store: Arc<dyn DistributedStore>,
    defaults: CacheDefaults,
    key_indexes: Vec<String>,
}

impl CacheLifecycleManager {
    /// Create a manager
    pub fn new(store: Arc<dyn DistributedStore>, defaults: CacheDefaults) -> Self {
        Self {
            store,
            defaults,
            key_indexes: Vec::new(),
        }
    }

    /// Keep a map keyed by cache entry keys in step with the caches.
    ///
    /// Destroying or reclaiming a cache also removes its entry keys from
    /// every index map.
    pub fn with_key_index(mut self, map: impl Into<String>) -> Self {
        let map = map.into();
        if !self.key_indexes.contains(&map) {
            self.key_indexes.push(map);
        }
        self
    }

    /// Settings applied by [`CacheLifecycleManager::get_or_create_cache`]
    pub fn default_settings(&self) -> CacheSettings {
        CacheSettings::from(&self.defaults)
    }

    /// Create a cache; fails if the name is taken
    pub async fn create_cache(&self, name: &str, settings: CacheSettings) -> Result<CacheInfo, MemoryError> {
        if name.is_empty() {
            return Err(MemoryError::InvalidArgument("Cache name must not be empty".to_string()));
        }

        let now = Utc::now();
        let info = CacheInfo {
            name: name.to_string(),
            settings,
            created_at: now,
            last_accessed_at: now,
        };

        let bytes = serde_json::to_vec(&info)?;
        if self
            .store
            .map_put_if_absent(CACHE_REGISTRY_MAP, name, bytes)
            .await?
            .is_some()
        {
            return Err(MemoryError::CacheExists(name.to_string()));
        }

        debug!(cache = name, "Created cache");
        Ok(info)
    }

    /// Look up a cache
    pub async fn get_cache(&self, name: &str) -> Result<Option<CacheInfo>, MemoryError> {
        get_json(self.store.as_ref(), CACHE_REGISTRY_MAP, name).await
    }

    /// Look up a cache, creating it with the default settings when missing
    pub async fn get_or_create_cache(&self, name: &str) -> Result<CacheInfo, MemoryError> {
        if let Some(info) = self.get_cache(name).await? {
            return Ok(info);
        }

        match self.create_cache(name, self.default_settings()).await {
            Ok(info) => Ok(info),
            // Lost a creation race, the winner's entry is as good as ours
            Err(MemoryError::CacheExists(_)) => self
                .get_cache(name)
                .await?
                .ok_or_else(|| MemoryError::CacheNotFound(name.to_string())),
            Err(e) => Err(e),
        }
    }

    /// Refresh the last-access time of a cache
    pub async fn touch(&self, name: &str) -> Result<(), MemoryError> {
        let now = Utc::now();
        let touched = update_json(self.store.as_ref(), CACHE_REGISTRY_MAP, name, |info: &mut CacheInfo| {
            info.last_accessed_at = now;
        })
        .await?;

        // A concurrent touch winning the race is as good as ours
        if touched || self.store.map_contains(CACHE_REGISTRY_MAP, name).await? {
            Ok(())
        } else {
            Err(MemoryError::CacheNotFound(name.to_string()))
        }
    }

    /// Destroy a cache and its entries
    pub async fn destroy_cache(&self, name: &str) -> Result<(), MemoryError> {
        if self.store.map_remove(CACHE_REGISTRY_MAP, name).await?.is_none() {
            return Err(MemoryError::CacheNotFound(name.to_string()));
        }

        let data_map = data_map_name(name);
        if !self.key_indexes.is_empty() {
            for key in self.store.map_keys(&data_map).await? {
                for index in &self.key_indexes {
                    self.store.map_remove(index, &key).await?;
                }
            }
        }
        self.store.map_destroy(&data_map).await?;

        debug!(cache = name, "Destroyed cache");
        Ok(())
    }

    /// All registered caches
    pub async fn list_caches(&self) -> Result<Vec<CacheInfo>, MemoryError> {
        let mut caches = Vec::new();
        for name in self.store.map_keys(CACHE_REGISTRY_MAP).await? {
            if let Some(info) = self.get_cache(&name).await? {
                caches.push(info);
            }
        }
        caches.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(caches)
    }

    /// Destroy every cache idle at the current time
    pub async fn reclaim_idle_caches(&self) -> Result<Vec<String>, MemoryError> {
        self.reclaim_idle_caches_at(Utc::now()).await
    }

    /// Destroy every cache idle at `now`, returning the reclaimed names
    pub async fn reclaim_idle_caches_at(&self, now: DateTime<Utc>) -> Result<Vec<String>, MemoryError> {
        let mut reclaimed = Vec::new();
        for info in self.list_caches().await? {
            if !info.is_idle(now) {
                continue;
            }
            match self.destroy_cache(&info.name).await {
                Ok(()) => reclaimed.push(info.name),
                // Destroyed concurrently
                Err(MemoryError::CacheNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        if !reclaimed.is_empty() {
            MemoryMetrics::record_caches_reclaimed(reclaimed.len());
            info!(count = reclaimed.len(), "Reclaimed idle caches");
        }
        Ok(reclaimed)
    }

    /// Run [`CacheLifecycleManager::reclaim_idle_caches`] every `interval`
    /// until the token is cancelled
    pub fn start_reclaimer(&self, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Cache reclaimer stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let _ = manager
                            .reclaim_idle_caches()
                            .await
                            .log_warn("Idle cache reclamation failed");
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory::InMemoryCluster;
    use crate::store::put_json;
    use chrono::Duration as ChronoDuration;

    fn manager() -> (Arc<InMemoryCluster>, CacheLifecycleManager) {
        let cluster = Arc::new(InMemoryCluster::new());
        let defaults = CacheDefaults {
            max_idle_ms: 1_000,
            ..Default::default()
        };
        (cluster.clone(), CacheLifecycleManager::new(cluster, defaults))
    }

    #[tokio::test]
    async fn test_create_get_destroy() {
        let (cluster, manager) = manager();

        let info = manager.create_cache("orders", CacheSettings::default()).await.unwrap();
        assert_eq!(info.data_map(), "forkflow.cache.orders");
        assert!(manager.get_cache("orders").await.unwrap().is_some());

        assert!(matches!(
            manager.create_cache("orders", CacheSettings::default()).await,
            Err(MemoryError::CacheExists(_))
        ));

        cluster.map_put(&info.data_map(), "k", vec![1]).await.unwrap();
        manager.destroy_cache("orders").await.unwrap();

        assert!(manager.get_cache("orders").await.unwrap().is_none());
        assert!(cluster.map_keys(&info.data_map()).await.unwrap().is_empty());
        assert!(matches!(
            manager.destroy_cache("orders").await,
            Err(MemoryError::CacheNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_get_or_create_uses_defaults() {
        let (_, manager) = manager();

        let created = manager.get_or_create_cache("scratch").await.unwrap();
        assert_eq!(created.settings.max_idle_ms, 1_000);

        let again = manager.get_or_create_cache("scratch").await.unwrap();
        assert_eq!(again.created_at, created.created_at);
    }

    #[tokio::test]
    async fn test_reclaim_only_idle_caches() {
        let (_, manager) = manager();
        let idle = manager.get_or_create_cache("idle").await.unwrap();
        manager.get_or_create_cache("busy").await.unwrap();

        let later = idle.last_accessed_at + ChronoDuration::milliseconds(1_500);

        // busy was touched at the reclaim instant
        let mut busy = manager.get_cache("busy").await.unwrap().unwrap();
        busy.last_accessed_at = later;
        put_json(manager.store.as_ref(), CACHE_REGISTRY_MAP, "busy", &busy)
            .await
            .unwrap();

        let reclaimed = manager.reclaim_idle_caches_at(later).await.unwrap();
        assert_eq!(reclaimed, vec!["idle".to_string()]);
        assert!(manager.get_cache("busy").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_destroy_clears_key_indexes() {
        let (cluster, manager) = manager();
        let manager = manager.with_key_index("orders.index");
        let info = manager.create_cache("orders", CacheSettings::default()).await.unwrap();

        cluster.map_put(&info.data_map(), "o-1", vec![1]).await.unwrap();
        cluster.map_put("orders.index", "o-1", vec![1]).await.unwrap();
        cluster.map_put("orders.index", "o-2", vec![2]).await.unwrap();

        let later = info.last_accessed_at + ChronoDuration::milliseconds(1_000);
        assert_eq!(manager.reclaim_idle_caches_at(later).await.unwrap(), vec!["orders".to_string()]);

        // Only keys of the reclaimed cache are dropped
        assert_eq!(cluster.map_keys("orders.index").await.unwrap(), vec!["o-2".to_string()]);
    }

    #[tokio::test]
    async fn test_touch_missing_cache() {
        let (_, manager) = manager();
        assert!(matches!(
            manager.touch("missing").await,
            Err(MemoryError::CacheNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reclaimer_stops_on_cancel() {
        let (_, manager) = manager();
        let token = CancellationToken::new();

        let handle = manager.start_reclaimer(Duration::from_secs(60), token.clone());
        tokio::time::advance(Duration::from_secs(120)).await;

        token.cancel();
        handle.await.unwrap();
    }
}
