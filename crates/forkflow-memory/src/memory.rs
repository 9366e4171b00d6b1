//! Distributed memory addressing.
//!
//! A memory address names a fixed-size block of bytes owned by a flow or a
//! flow+branch pair. The address registry maps each address to its owner,
//! size and cache; the bytes live in a per-owner cache. This manager does no
//! locking: concurrent writers must hold an exclusive lock obtained through
//! [`crate::isolation::BranchIsolationProvider`].

use chrono::{DateTime, Utc};
use forkflow_core::MemoryAddress;
use forkflow_monitoring::{LogExt, MemoryMetrics};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::cache::{data_map_name, CacheLifecycleManager};
use crate::ownership::MemoryOwner;
use crate::store::{get_json, put_json, update_json, DistributedStore};
use crate::MemoryError;

const ADDRESS_REGISTRY_MAP: &str = "forkflow.memory.registry";
const OWNER_CACHE_PREFIX: &str = "memory.";

/// Registry entry of an allocated block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryBlock {
    /// Address of the block
    pub address: MemoryAddress,
    /// Owner of the block
    pub owner: MemoryOwner,
    /// Allocated size in bytes
    pub size: usize,
    /// Cache holding the bytes
    pub cache_name: String,
    /// Allocation time
    pub created_at: DateTime<Utc>,
    /// Last read or write
    pub last_accessed_at: DateTime<Utc>,
}

/// Allocates, reads, writes and frees addressed blocks
#[derive(Clone)]
pub struct DistributedMemoryManager {
    store: Arc<dyn DistributedStore>,
    caches: CacheLifecycleManager,
}

impl DistributedMemoryManager {
    /// Create a manager.
    ///
    /// Reclaiming or destroying an owner cache through `caches` also drops
    /// the registry entries of its blocks.
    pub fn new(store: Arc<dyn DistributedStore>, caches: CacheLifecycleManager) -> Self {
        Self {
            store,
            caches: caches.with_key_index(ADDRESS_REGISTRY_MAP),
        }
    }

    /// Cache manager of the owner caches; run idle reclamation through it
    pub fn caches(&self) -> &CacheLifecycleManager {
        &self.caches
    }

    fn cache_name(owner: &MemoryOwner) -> String {
        format!("{}{}", OWNER_CACHE_PREFIX, owner)
    }

    async fn block(&self, address: &MemoryAddress) -> Result<MemoryBlock, MemoryError> {
        get_json(self.store.as_ref(), ADDRESS_REGISTRY_MAP, &address.0)
            .await?
            .ok_or_else(|| MemoryError::AddressNotFound(address.to_string()))
    }

    fn check_bounds(block: &MemoryBlock, offset: usize, length: usize) -> Result<(), MemoryError> {
        let in_bounds = offset
            .checked_add(length)
            .map(|end| end <= block.size)
            .unwrap_or(false);
        if in_bounds {
            Ok(())
        } else {
            Err(MemoryError::OutOfBounds {
                address: block.address.to_string(),
                offset,
                length,
                size: block.size,
            })
        }
    }

    async fn record_access(&self, block: MemoryBlock) -> Result<(), MemoryError> {
        let now = Utc::now();
        // Never resurrect a block freed in the meantime
        update_json(self.store.as_ref(), ADDRESS_REGISTRY_MAP, &block.address.0, |entry: &mut MemoryBlock| {
            entry.last_accessed_at = now;
        })
        .await?;
        let _ = self
            .caches
            .touch(&block.cache_name)
            .await
            .log_warn("Failed to refresh cache access time");
        Ok(())
    }

    async fn load_bytes(&self, block: &MemoryBlock) -> Result<Vec<u8>, MemoryError> {
        let data_map = data_map_name(&block.cache_name);
        let mut bytes = self
            .store
            .map_get(&data_map, &block.address.0)
            .await?
            .ok_or_else(|| MemoryError::AddressNotFound(block.address.to_string()))?;
        // Blocks are stored at full size; guard against truncated entries
        bytes.resize(block.size, 0);
        Ok(bytes)
    }

    /// Allocate a zero-filled block for an owner
    pub async fn allocate(&self, owner: &MemoryOwner, size: usize) -> Result<MemoryAddress, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidArgument(
                "Allocation size must be positive".to_string(),
            ));
        }

        let cache = self.caches.get_or_create_cache(&Self::cache_name(owner)).await?;
        let address = MemoryAddress::generate();
        let now = Utc::now();
        let block = MemoryBlock {
            address: address.clone(),
            owner: owner.clone(),
            size,
            cache_name: cache.name.clone(),
            created_at: now,
            last_accessed_at: now,
        };

        self.store
            .map_put(&cache.data_map(), &address.0, vec![0; size])
            .await?;
        put_json(self.store.as_ref(), ADDRESS_REGISTRY_MAP, &address.0, &block).await?;

        MemoryMetrics::record_allocation();
        debug!(address = %address, owner = %owner, size, "Allocated memory block");
        Ok(address)
    }

    /// Write bytes at an offset
    pub async fn write(&self, address: &MemoryAddress, offset: usize, data: &[u8]) -> Result<(), MemoryError> {
        let block = self.block(address).await?;
        Self::check_bounds(&block, offset, data.len())?;

        let mut bytes = self.load_bytes(&block).await?;
        bytes[offset..offset + data.len()].copy_from_slice(data);
        let data_map = data_map_name(&block.cache_name);
        self.store.map_put(&data_map, &address.0, bytes).await?;

        self.record_access(block).await
    }

    /// Read `length` bytes at an offset
    pub async fn read(&self, address: &MemoryAddress, offset: usize, length: usize) -> Result<Vec<u8>, MemoryError> {
        let block = self.block(address).await?;
        Self::check_bounds(&block, offset, length)?;

        let bytes = self.load_bytes(&block).await?;
        let slice = bytes[offset..offset + length].to_vec();

        self.record_access(block).await?;
        Ok(slice)
    }

    /// Read a whole block
    pub async fn read_all(&self, address: &MemoryAddress) -> Result<Vec<u8>, MemoryError> {
        let size = self.block(address).await?.size;
        self.read(address, 0, size).await
    }

    /// Allocate a block sized to `data` and fill it
    pub async fn allocate_with(&self, owner: &MemoryOwner, data: &[u8]) -> Result<MemoryAddress, MemoryError> {
        let address = self.allocate(owner, data.len()).await?;
        self.write(&address, 0, data).await?;
        Ok(address)
    }

    /// Registry entry of an address
    pub async fn describe(&self, address: &MemoryAddress) -> Result<MemoryBlock, MemoryError> {
        self.block(address).await
    }

    /// Owner of an address
    pub async fn owner_of(&self, address: &MemoryAddress) -> Result<MemoryOwner, MemoryError> {
        Ok(self.block(address).await?.owner)
    }

    /// Addresses allocated for an owner, sorted
    pub async fn addresses_of(&self, owner: &MemoryOwner) -> Result<Vec<MemoryAddress>, MemoryError> {
        let cache_name = Self::cache_name(owner);
        let data_map = data_map_name(&cache_name);
        let mut addresses: Vec<MemoryAddress> = self
            .store
            .map_keys(&data_map)
            .await?
            .into_iter()
            .map(MemoryAddress)
            .collect();
        addresses.sort();
        Ok(addresses)
    }

    /// Free a block
    pub async fn free(&self, address: &MemoryAddress) -> Result<(), MemoryError> {
        let block = self.block(address).await?;
        let data_map = data_map_name(&block.cache_name);

        self.store.map_remove(&data_map, &address.0).await?;
        self.store.map_remove(ADDRESS_REGISTRY_MAP, &address.0).await?;

        MemoryMetrics::record_free(1);
        debug!(address = %address, "Freed memory block");
        Ok(())
    }

    /// Free every block of an owner and drop its cache
    pub async fn free_all_for_owner(&self, owner: &MemoryOwner) -> Result<usize, MemoryError> {
        let addresses = self.addresses_of(owner).await?;
        for address in &addresses {
            self.store.map_remove(ADDRESS_REGISTRY_MAP, &address.0).await?;
        }

        match self.caches.destroy_cache(&Self::cache_name(owner)).await {
            Ok(()) | Err(MemoryError::CacheNotFound(_)) => {}
            Err(e) => return Err(e),
        }

        if !addresses.is_empty() {
            MemoryMetrics::record_free(addresses.len());
            debug!(owner = %owner, count = addresses.len(), "Freed all blocks of owner");
        }
        Ok(addresses.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory::InMemoryCluster;
    use forkflow_core::{BranchPath, CacheDefaults, FlowId};

    fn manager() -> DistributedMemoryManager {
        let cluster: Arc<dyn DistributedStore> = Arc::new(InMemoryCluster::new());
        let caches = CacheLifecycleManager::new(cluster.clone(), CacheDefaults::default());
        DistributedMemoryManager::new(cluster, caches)
    }

    fn branch_owner() -> MemoryOwner {
        MemoryOwner::branch(&FlowId::from("flow-1"), &BranchPath::main())
    }

    #[tokio::test]
    async fn test_allocate_write_read() {
        let memory = manager();
        let address = memory.allocate(&branch_owner(), 8).await.unwrap();

        assert_eq!(memory.read_all(&address).await.unwrap(), vec![0; 8]);

        memory.write(&address, 2, b"abc").await.unwrap();
        assert_eq!(memory.read(&address, 2, 3).await.unwrap(), b"abc".to_vec());
        assert_eq!(memory.read(&address, 0, 8).await.unwrap()[..5], [0, 0, b'a', b'b', b'c']);
        assert_eq!(memory.owner_of(&address).await.unwrap(), branch_owner());
    }

    #[tokio::test]
    async fn test_bounds_are_checked_before_touching_the_store() {
        let memory = manager();
        let address = memory.allocate(&branch_owner(), 4).await.unwrap();

        match memory.write(&address, 2, b"abc").await {
            Err(MemoryError::OutOfBounds { offset, length, size, .. }) => {
                assert_eq!((offset, length, size), (2, 3, 4));
            }
            other => panic!("Expected OutOfBounds, got {:?}", other),
        }
        assert!(matches!(
            memory.read(&address, usize::MAX, 2).await,
            Err(MemoryError::OutOfBounds { .. })
        ));

        // Exactly at the end is fine
        memory.write(&address, 1, b"xyz").await.unwrap();
        assert_eq!(memory.read_all(&address).await.unwrap(), b"\0xyz".to_vec());
    }

    #[tokio::test]
    async fn test_unknown_address() {
        let memory = manager();
        let missing = MemoryAddress::from("mem-missing");

        assert!(matches!(memory.read(&missing, 0, 1).await, Err(MemoryError::AddressNotFound(_))));
        assert!(matches!(memory.write(&missing, 0, b"x").await, Err(MemoryError::AddressNotFound(_))));
        assert!(matches!(memory.free(&missing).await, Err(MemoryError::AddressNotFound(_))));
    }

    #[tokio::test]
    async fn test_zero_sized_allocation_rejected() {
        let memory = manager();
        assert!(matches!(
            memory.allocate(&branch_owner(), 0).await,
            Err(MemoryError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_access_refreshes_timestamp() {
        let memory = manager();
        let address = memory.allocate(&branch_owner(), 4).await.unwrap();
        let before = memory.describe(&address).await.unwrap().last_accessed_at;

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        memory.read(&address, 0, 1).await.unwrap();

        let after = memory.describe(&address).await.unwrap().last_accessed_at;
        assert!(after > before);
    }

    #[tokio::test]
    async fn test_free_all_for_owner() {
        let memory = manager();
        let owner = branch_owner();
        let other = MemoryOwner::flow(&FlowId::from("flow-1"));

        let a = memory.allocate_with(&owner, b"one").await.unwrap();
        let b = memory.allocate_with(&owner, b"two").await.unwrap();
        let kept = memory.allocate_with(&other, b"three").await.unwrap();

        let mut expected = vec![a.clone(), b.clone()];
        expected.sort();
        assert_eq!(memory.addresses_of(&owner).await.unwrap(), expected);

        assert_eq!(memory.free_all_for_owner(&owner).await.unwrap(), 2);
        assert!(memory.addresses_of(&owner).await.unwrap().is_empty());
        assert!(matches!(memory.read_all(&a).await, Err(MemoryError::AddressNotFound(_))));
        assert_eq!(memory.read_all(&kept).await.unwrap(), b"three".to_vec());
    }

    #[tokio::test]
    async fn test_reclaimed_owner_cache_drops_its_blocks() {
        let memory = manager();
        let owner = branch_owner();
        let address = memory.allocate_with(&owner, b"rows").await.unwrap();
        let allocated_at = memory.describe(&address).await.unwrap().created_at;

        let later = allocated_at + chrono::Duration::days(1);
        let reclaimed = memory.caches().reclaim_idle_caches_at(later).await.unwrap();
        assert_eq!(reclaimed, vec![format!("memory.{}", owner)]);

        assert!(matches!(memory.describe(&address).await, Err(MemoryError::AddressNotFound(_))));
        assert!(matches!(memory.owner_of(&address).await, Err(MemoryError::AddressNotFound(_))));
        assert!(memory.addresses_of(&owner).await.unwrap().is_empty());
        assert!(memory.store.map_keys(ADDRESS_REGISTRY_MAP).await.unwrap().is_empty());
    }
}
