//! Repository traits for published flows
//!
//! Execution only reads flows. Publishing tooling stores them through a
//! [`FlowRepository`]; external crates can implement the trait to provide
//! other persistence mechanisms.

use async_trait::async_trait;

use super::flow::Flow;
use super::versioned::Versioned;
use crate::types::FlowId;
use crate::CoreError;

/// Repository for published flows
#[async_trait]
pub trait FlowRepository: Send + Sync {
    /// Find the latest published version of a flow
    async fn find_by_id(&self, id: &FlowId) -> Result<Option<Versioned<Flow>>, CoreError>;

    /// Validate and publish a flow, replacing any earlier version
    async fn publish(&self, flow: Flow) -> Result<u32, CoreError>;

    /// Delete a flow
    async fn delete(&self, id: &FlowId) -> Result<(), CoreError>;

    /// List all flow ids
    async fn list_flows(&self) -> Result<Vec<FlowId>, CoreError>;
}

/// Memory implementations for testing
#[cfg(feature = "testing")]
pub mod memory {
    use super::*;
    use dashmap::DashMap;
    use std::sync::Arc;
    use tracing::debug;

    /// In-memory flow repository on a concurrent map
    #[derive(Clone, Default)]
    pub struct MemoryFlowRepository {
        flows: Arc<DashMap<FlowId, Versioned<Flow>>>,
    }

    impl MemoryFlowRepository {
        /// Create a new memory flow repository
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl FlowRepository for MemoryFlowRepository {
        async fn find_by_id(&self, id: &FlowId) -> Result<Option<Versioned<Flow>>, CoreError> {
            Ok(self.flows.get(id).map(|entry| entry.value().clone()))
        }

        async fn publish(&self, flow: Flow) -> Result<u32, CoreError> {
            flow.validate_for_publish()?;

            let id = flow.id.clone();
            let version = match self.flows.get_mut(&id) {
                Some(mut existing) => {
                    existing.modify(|current| *current = flow);
                    existing.clear_modified();
                    existing.version()
                }
                None => {
                    let versioned = Versioned::new(flow);
                    let version = versioned.version();
                    self.flows.insert(id.clone(), versioned);
                    version
                }
            };

            debug!(flow_id = %id, version, "Published flow");
            Ok(version)
        }

        async fn delete(&self, id: &FlowId) -> Result<(), CoreError> {
            self.flows
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| CoreError::FlowNotFound(id.to_string()))
        }

        async fn list_flows(&self) -> Result<Vec<FlowId>, CoreError> {
            let mut ids: Vec<FlowId> = self.flows.iter().map(|e| e.key().clone()).collect();
            ids.sort();
            Ok(ids)
        }
    }

}
