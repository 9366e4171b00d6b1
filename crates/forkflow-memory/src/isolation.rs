//! Branch isolation contexts and address locks.
//!
//! Isolation records live in one distributed map keyed by the branch owner
//! key (`{flow}:{branch}`). The locks a branch holds are tracked in a
//! per-branch map keyed by address. The cluster lock itself is keyed by
//! address, so two branches contend for the same address no matter which
//! flow they belong to.

use chrono::{DateTime, Utc};
use forkflow_core::{BranchPath, FlowId, MemoryAddress};
use forkflow_monitoring::{LogExt, MemoryMetrics};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::ownership::MemoryOwner;
use crate::store::{get_json, put_json, update_json, DistributedStore};
use crate::MemoryError;

const ISOLATION_MAP: &str = "forkflow.isolation";
const LOCK_SET_MAP_PREFIX: &str = "forkflow.isolation.locks.";
const ADDRESS_LOCK_PREFIX: &str = "forkflow.address.";

/// Isolation level of a branch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// No isolation
    None,
    /// Reads see committed data only
    ReadCommitted,
    /// Reads are repeatable within the branch
    RepeatableRead,
    /// Full isolation
    Serializable,
}

impl Default for IsolationLevel {
    fn default() -> Self {
        Self::ReadCommitted
    }
}

/// Lock mode requested on an address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    /// Readers
    Shared,
    /// Writers
    Exclusive,
}

impl LockMode {
    fn as_label(self) -> &'static str {
        match self {
            Self::Shared => "shared",
            Self::Exclusive => "exclusive",
        }
    }
}

/// Isolation record of one branch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchIsolationInfo {
    /// Flow
    pub flow_id: FlowId,
    /// Branch
    pub branch_path: BranchPath,
    /// Isolation level
    pub isolation_level: IsolationLevel,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last time the branch took or released a lock
    pub last_accessed_at: DateTime<Utc>,
}

/// A lock held by a branch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeldLock {
    /// Locked address
    pub address: MemoryAddress,
    /// Requested mode
    pub mode: LockMode,
    /// When the lock was obtained
    pub acquired_at: DateTime<Utc>,
}

/// Creates isolation contexts and grants address locks to branches
#[derive(Clone)]
pub struct BranchIsolationProvider {
    store: Arc<dyn DistributedStore>,
}

impl BranchIsolationProvider {
    /// Create a provider on top of a distributed store
    pub fn new(store: Arc<dyn DistributedStore>) -> Self {
        Self { store }
    }

    fn owner_key(flow_id: &FlowId, branch_path: &BranchPath) -> String {
        MemoryOwner::branch(flow_id, branch_path).encode()
    }

    fn lock_set_map(owner_key: &str) -> String {
        format!("{}{}", LOCK_SET_MAP_PREFIX, owner_key)
    }

    fn lock_name(address: &MemoryAddress) -> String {
        format!("{}{}", ADDRESS_LOCK_PREFIX, address)
    }

    /// Create the isolation context of a branch; fails if one exists
    pub async fn create_isolation_context(
        &self,
        flow_id: &FlowId,
        branch_path: &BranchPath,
        isolation_level: IsolationLevel,
    ) -> Result<BranchIsolationInfo, MemoryError> {
        let key = Self::owner_key(flow_id, branch_path);
        let now = Utc::now();
        let info = BranchIsolationInfo {
            flow_id: flow_id.clone(),
            branch_path: branch_path.clone(),
            isolation_level,
            created_at: now,
            last_accessed_at: now,
        };

        let bytes = serde_json::to_vec(&info)?;
        if self
            .store
            .map_put_if_absent(ISOLATION_MAP, &key, bytes)
            .await?
            .is_some()
        {
            return Err(MemoryError::IsolationContextExists(key));
        }

        info!(owner = %key, level = ?isolation_level, "Created isolation context");
        Ok(info)
    }

    /// Isolation record of a branch
    pub async fn get_isolation_context(
        &self,
        flow_id: &FlowId,
        branch_path: &BranchPath,
    ) -> Result<Option<BranchIsolationInfo>, MemoryError> {
        let key = Self::owner_key(flow_id, branch_path);
        get_json(self.store.as_ref(), ISOLATION_MAP, &key).await
    }

    async fn require_context(&self, key: &str) -> Result<BranchIsolationInfo, MemoryError> {
        get_json(self.store.as_ref(), ISOLATION_MAP, key)
            .await?
            .ok_or_else(|| MemoryError::IsolationContextNotFound(key.to_string()))
    }

    /// Refresh the access time; a record destroyed meanwhile stays destroyed
    async fn touch(&self, key: &str) {
        let now = Utc::now();
        let updated = update_json(self.store.as_ref(), ISOLATION_MAP, key, |info: &mut BranchIsolationInfo| {
            info.last_accessed_at = now;
        })
        .await;
        if let Ok(false) = updated.log_warn("Failed to update isolation access time") {
            debug!(owner = %key, "Isolation record gone or changed, access time not updated");
        }
    }

    /// Release every lock of the branch, then remove its isolation record.
    ///
    /// The record stays in place if any lock could not be released.
    pub async fn destroy_isolation_context(
        &self,
        flow_id: &FlowId,
        branch_path: &BranchPath,
    ) -> Result<(), MemoryError> {
        let key = Self::owner_key(flow_id, branch_path);
        self.require_context(&key).await?;

        self.release_all_locks(flow_id, branch_path).await?;

        self.store.map_destroy(&Self::lock_set_map(&key)).await?;
        self.store.map_remove(ISOLATION_MAP, &key).await?;

        info!(owner = %key, "Destroyed isolation context");
        Ok(())
    }

    /// Take the cluster lock of an address for a branch.
    ///
    /// The address is recorded in the branch's lock set only once the
    /// cluster lock is held; if recording fails the cluster lock is released
    /// again.
    pub async fn acquire_lock(
        &self,
        flow_id: &FlowId,
        branch_path: &BranchPath,
        address: &MemoryAddress,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<(), MemoryError> {
        let key = Self::owner_key(flow_id, branch_path);
        self.require_context(&key).await?;

        let lock_set = Self::lock_set_map(&key);
        if self.store.map_contains(&lock_set, &address.0).await? {
            return Err(MemoryError::LockAlreadyHeld(address.to_string()));
        }

        let lock_name = Self::lock_name(address);
        let acquired = self.store.try_lock(&lock_name, &key, timeout).await?;
        if !acquired {
            MemoryMetrics::record_lock_timeout();
            warn!(owner = %key, address = %address, ?timeout, "Lock acquisition timed out");
            return Err(MemoryError::LockTimeout {
                address: address.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            });
        }

        let held = HeldLock {
            address: address.clone(),
            mode,
            acquired_at: Utc::now(),
        };
        if let Err(e) = put_json(self.store.as_ref(), &lock_set, &address.0, &held).await {
            // Never leave a cluster lock without a record of who holds it
            let _ = self
                .store
                .unlock(&lock_name, &key)
                .await
                .log_err("Failed to release lock after bookkeeping failure");
            return Err(e);
        }

        MemoryMetrics::record_lock_acquired(mode.as_label());
        debug!(owner = %key, address = %address, ?mode, "Lock acquired");
        self.touch(&key).await;
        Ok(())
    }

    /// Lock several addresses in ascending address order.
    ///
    /// Either every address is locked or, on the first failure, the locks
    /// taken by this call are released and the error is returned.
    pub async fn acquire_locks(
        &self,
        flow_id: &FlowId,
        branch_path: &BranchPath,
        addresses: &[MemoryAddress],
        mode: LockMode,
        timeout: Duration,
    ) -> Result<Vec<MemoryAddress>, MemoryError> {
        let mut ordered: Vec<MemoryAddress> = addresses.to_vec();
        ordered.sort();
        ordered.dedup();

        let mut acquired = Vec::with_capacity(ordered.len());
        for address in ordered {
            match self
                .acquire_lock(flow_id, branch_path, &address, mode, timeout)
                .await
            {
                Ok(()) => acquired.push(address),
                Err(e) => {
                    for taken in acquired.iter().rev() {
                        let _ = self
                            .release_lock(flow_id, branch_path, taken)
                            .await
                            .log_err("Failed to roll back partially acquired lock");
                    }
                    return Err(e);
                }
            }
        }

        Ok(acquired)
    }

    /// Release one lock held by the branch
    pub async fn release_lock(
        &self,
        flow_id: &FlowId,
        branch_path: &BranchPath,
        address: &MemoryAddress,
    ) -> Result<(), MemoryError> {
        let key = Self::owner_key(flow_id, branch_path);
        let lock_set = Self::lock_set_map(&key);

        if !self.store.map_contains(&lock_set, &address.0).await? {
            return Err(MemoryError::LockNotHeld(address.to_string()));
        }

        self.store.unlock(&Self::lock_name(address), &key).await?;
        self.store.map_remove(&lock_set, &address.0).await?;

        MemoryMetrics::record_lock_released(1);
        debug!(owner = %key, address = %address, "Lock released");
        self.touch(&key).await;
        Ok(())
    }

    /// Release every lock held by the branch, returning how many were released.
    ///
    /// Keeps going after a failure and reports the first error at the end.
    pub async fn release_all_locks(
        &self,
        flow_id: &FlowId,
        branch_path: &BranchPath,
    ) -> Result<usize, MemoryError> {
        let key = Self::owner_key(flow_id, branch_path);
        let lock_set = Self::lock_set_map(&key);

        let mut released = 0;
        let mut first_error = None;
        for address in self.store.map_keys(&lock_set).await? {
            let lock_name = format!("{}{}", ADDRESS_LOCK_PREFIX, address);
            let result = async {
                self.store.unlock(&lock_name, &key).await?;
                self.store.map_remove(&lock_set, &address).await?;
                Ok::<_, MemoryError>(())
            }
            .await;

            match result {
                Ok(()) => released += 1,
                Err(e) => {
                    warn!(owner = %key, address = %address, error = %e, "Failed to release lock");
                    first_error.get_or_insert(e);
                }
            }
        }

        if released > 0 {
            MemoryMetrics::record_lock_released(released);
            debug!(owner = %key, released, "Released all branch locks");
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(released),
        }
    }

    /// Addresses currently locked by the branch, sorted
    pub async fn get_locked_addresses(
        &self,
        flow_id: &FlowId,
        branch_path: &BranchPath,
    ) -> Result<Vec<MemoryAddress>, MemoryError> {
        let key = Self::owner_key(flow_id, branch_path);
        let mut addresses: Vec<MemoryAddress> = self
            .store
            .map_keys(&Self::lock_set_map(&key))
            .await?
            .into_iter()
            .map(MemoryAddress)
            .collect();
        addresses.sort();
        Ok(addresses)
    }

    /// Whether the address is locked by anyone in the cluster
    pub async fn is_address_locked(&self, address: &MemoryAddress) -> Result<bool, MemoryError> {
        self.store.is_locked(&Self::lock_name(address)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory::InMemoryCluster;

    fn provider() -> (Arc<InMemoryCluster>, BranchIsolationProvider) {
        let cluster = Arc::new(InMemoryCluster::new());
        let provider = BranchIsolationProvider::new(cluster.clone());
        (cluster, provider)
    }

    fn ids() -> (FlowId, BranchPath) {
        (FlowId::from("flow-1"), BranchPath::main())
    }

    #[tokio::test]
    async fn test_create_twice_fails() {
        let (_, provider) = provider();
        let (flow, branch) = ids();

        let info = provider
            .create_isolation_context(&flow, &branch, IsolationLevel::Serializable)
            .await
            .unwrap();
        assert_eq!(info.isolation_level, IsolationLevel::Serializable);

        match provider
            .create_isolation_context(&flow, &branch, IsolationLevel::None)
            .await
        {
            Err(MemoryError::IsolationContextExists(key)) => assert_eq!(key, "flow-1:main"),
            other => panic!("Expected IsolationContextExists, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_lock_requires_isolation_context() {
        let (_, provider) = provider();
        let (flow, branch) = ids();

        let result = provider
            .acquire_lock(
                &flow,
                &branch,
                &MemoryAddress::from("mem-1"),
                LockMode::Exclusive,
                Duration::from_millis(10),
            )
            .await;
        assert!(matches!(result, Err(MemoryError::IsolationContextNotFound(_))));
    }

    #[tokio::test]
    async fn test_acquire_and_release_round_trip() {
        let (cluster, provider) = provider();
        let (flow, branch) = ids();
        let address = MemoryAddress::from("mem-1");
        provider
            .create_isolation_context(&flow, &branch, IsolationLevel::ReadCommitted)
            .await
            .unwrap();

        provider
            .acquire_lock(&flow, &branch, &address, LockMode::Exclusive, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(
            provider.get_locked_addresses(&flow, &branch).await.unwrap(),
            vec![address.clone()]
        );
        assert!(provider.is_address_locked(&address).await.unwrap());

        provider.release_lock(&flow, &branch, &address).await.unwrap();
        assert!(!provider
            .get_locked_addresses(&flow, &branch)
            .await
            .unwrap()
            .contains(&address));
        assert_eq!(cluster.held_lock_count(), 0);

        // Releasing again is an error
        assert!(matches!(
            provider.release_lock(&flow, &branch, &address).await,
            Err(MemoryError::LockNotHeld(_))
        ));
    }

    #[tokio::test]
    async fn test_locks_are_not_reentrant() {
        let (_, provider) = provider();
        let (flow, branch) = ids();
        let address = MemoryAddress::from("mem-1");
        provider
            .create_isolation_context(&flow, &branch, IsolationLevel::ReadCommitted)
            .await
            .unwrap();

        provider
            .acquire_lock(&flow, &branch, &address, LockMode::Shared, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(matches!(
            provider
                .acquire_lock(&flow, &branch, &address, LockMode::Shared, Duration::from_millis(10))
                .await,
            Err(MemoryError::LockAlreadyHeld(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_contended_address_times_out() {
        let (_, provider) = provider();
        let flow = FlowId::from("flow-1");
        let main = BranchPath::main();
        let other = BranchPath::from("branchA");
        let address = MemoryAddress::from("mem-shared");

        for branch in [&main, &other] {
            provider
                .create_isolation_context(&flow, branch, IsolationLevel::ReadCommitted)
                .await
                .unwrap();
        }

        provider
            .acquire_lock(&flow, &main, &address, LockMode::Exclusive, Duration::from_millis(10))
            .await
            .unwrap();

        match provider
            .acquire_lock(&flow, &other, &address, LockMode::Exclusive, Duration::from_millis(50))
            .await
        {
            Err(MemoryError::LockTimeout { timeout_ms, .. }) => assert_eq!(timeout_ms, 50),
            other => panic!("Expected LockTimeout, got {:?}", other),
        }
        assert!(provider.get_locked_addresses(&flow, &other).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_locks_rolls_back_on_failure() {
        let (cluster, provider) = provider();
        let flow = FlowId::from("flow-1");
        let main = BranchPath::main();
        let other = BranchPath::from("branchA");

        for branch in [&main, &other] {
            provider
                .create_isolation_context(&flow, branch, IsolationLevel::ReadCommitted)
                .await
                .unwrap();
        }

        // branchA holds mem-b
        provider
            .acquire_lock(&flow, &other, &MemoryAddress::from("mem-b"), LockMode::Exclusive, Duration::from_millis(10))
            .await
            .unwrap();

        let requested = vec![
            MemoryAddress::from("mem-c"),
            MemoryAddress::from("mem-a"),
            MemoryAddress::from("mem-b"),
        ];
        let result = provider
            .acquire_locks(&flow, &main, &requested, LockMode::Exclusive, Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(MemoryError::LockTimeout { .. })));

        // mem-a was taken first and then rolled back, mem-c was never reached
        assert!(provider.get_locked_addresses(&flow, &main).await.unwrap().is_empty());
        assert_eq!(cluster.held_lock_count(), 1);

        provider.release_all_locks(&flow, &other).await.unwrap();
        let locked = provider
            .acquire_locks(&flow, &main, &requested, LockMode::Exclusive, Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(
            locked,
            vec![
                MemoryAddress::from("mem-a"),
                MemoryAddress::from("mem-b"),
                MemoryAddress::from("mem-c"),
            ]
        );
    }

    #[tokio::test]
    async fn test_destroy_releases_every_lock() {
        let (cluster, provider) = provider();
        let (flow, branch) = ids();
        provider
            .create_isolation_context(&flow, &branch, IsolationLevel::ReadCommitted)
            .await
            .unwrap();

        let addresses: Vec<MemoryAddress> = (0..4).map(|i| MemoryAddress(format!("mem-{}", i))).collect();
        for address in &addresses {
            provider
                .acquire_lock(&flow, &branch, address, LockMode::Exclusive, Duration::from_millis(10))
                .await
                .unwrap();
        }
        assert_eq!(cluster.held_lock_count(), 4);

        provider.destroy_isolation_context(&flow, &branch).await.unwrap();

        for address in &addresses {
            assert!(!provider.is_address_locked(address).await.unwrap());
        }
        assert!(provider.get_isolation_context(&flow, &branch).await.unwrap().is_none());

        // Context can be created again afterwards
        provider
            .create_isolation_context(&flow, &branch, IsolationLevel::ReadCommitted)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_touch_does_not_recreate_destroyed_context() {
        let (_, provider) = provider();
        let (flow, branch) = ids();
        let created = provider
            .create_isolation_context(&flow, &branch, IsolationLevel::ReadCommitted)
            .await
            .unwrap();
        let key = BranchIsolationProvider::owner_key(&flow, &branch);

        // Step 1: a live record gets a fresh access time
        provider.touch(&key).await;
        let touched = provider.get_isolation_context(&flow, &branch).await.unwrap().unwrap();
        assert!(touched.last_accessed_at >= created.last_accessed_at);

        // Step 2: a destroyed record stays destroyed
        provider.destroy_isolation_context(&flow, &branch).await.unwrap();
        provider.touch(&key).await;
        assert!(provider.get_isolation_context(&flow, &branch).await.unwrap().is_none());
    }
}
