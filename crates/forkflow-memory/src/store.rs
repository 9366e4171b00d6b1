//! Capability interface of the distributed key-value store.
//!
//! The store offers named maps with per-key atomic operations and named
//! cluster-wide locks. Locks are owner-tagged and not reentrant: an owner
//! that already holds a lock blocks like anyone else when locking it again.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

use crate::MemoryError;

/// Distributed store with named maps and named locks
#[async_trait]
pub trait DistributedStore: Send + Sync {
    /// Name of the cluster this store is connected to
    fn cluster_name(&self) -> &str;

    /// Get a value
    async fn map_get(&self, map: &str, key: &str) -> Result<Option<Vec<u8>>, MemoryError>;

    /// Put a value, returning the previous one
    async fn map_put(&self, map: &str, key: &str, value: Vec<u8>) -> Result<Option<Vec<u8>>, MemoryError>;

    /// Put a value only if the key is absent, returning the existing value otherwise
    async fn map_put_if_absent(
        &self,
        map: &str,
        key: &str,
        value: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, MemoryError>;

    /// Replace a value only if it still equals `expected`, returning whether it was replaced
    async fn map_replace(
        &self,
        map: &str,
        key: &str,
        expected: &[u8],
        value: Vec<u8>,
    ) -> Result<bool, MemoryError>;

    /// Remove a value, returning it
    async fn map_remove(&self, map: &str, key: &str) -> Result<Option<Vec<u8>>, MemoryError>;

    /// Whether a key is present
    async fn map_contains(&self, map: &str, key: &str) -> Result<bool, MemoryError>;

    /// All keys of a map
    async fn map_keys(&self, map: &str) -> Result<Vec<String>, MemoryError>;

    /// Remove a map and all its entries
    async fn map_destroy(&self, map: &str) -> Result<(), MemoryError>;

    /// Block until the lock is held by `owner`
    async fn lock(&self, name: &str, owner: &str) -> Result<(), MemoryError>;

    /// Try to take the lock within `timeout`, returning whether it is held
    async fn try_lock(&self, name: &str, owner: &str, timeout: Duration) -> Result<bool, MemoryError>;

    /// Release a lock held by `owner`
    async fn unlock(&self, name: &str, owner: &str) -> Result<(), MemoryError>;

    /// Whether anyone holds the lock
    async fn is_locked(&self, name: &str) -> Result<bool, MemoryError>;
}

/// Read and deserialize a JSON value
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn DistributedStore,
    map: &str,
    key: &str,
) -> Result<Option<T>, MemoryError> {
    match store.map_get(map, key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Serialize and write a JSON value
pub async fn put_json<T: Serialize + Sync>(
    store: &dyn DistributedStore,
    map: &str,
    key: &str,
    value: &T,
) -> Result<(), MemoryError> {
    let bytes = serde_json::to_vec(value)?;
    store.map_put(map, key, bytes).await?;
    Ok(())
}

/// Update a JSON value in place without recreating it.
///
/// Returns `Ok(false)` when the key is absent or was changed concurrently.
pub async fn update_json<T, F>(
    store: &dyn DistributedStore,
    map: &str,
    key: &str,
    update: F,
) -> Result<bool, MemoryError>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce(&mut T) + Send,
{
    let current = match store.map_get(map, key).await? {
        Some(bytes) => bytes,
        None => return Ok(false),
    };
    let updated = {
        let mut value: T = serde_json::from_slice(&current)?;
        update(&mut value);
        serde_json::to_vec(&value)?
    };
    store.map_replace(map, key, &current, updated).await
}
