//! Cluster environment effects
//!
//! Process bring-up is outside the recovery core. The coordinator asks a
//! [`ClusterEnvironment`] for each node's replica log and sealer and treats a
//! failed spawn as a node that could not be started.
//!
//! # Effect Classification
//!
//! - **Category**: Infrastructure Effect
//! - **Implementation**: [`InProcessEnvironment`] (memory replicas, one shared platform sealer)
//! - **Usage**: `Cluster::start_fresh`, `RecoveryCoordinator::begin_recovery`

use async_trait::async_trait;
use std::sync::Arc;
use tessera_consensus::{MemoryReplica, ReplicaLog};
use tessera_core::{NodeId, TesseraResult};
use tessera_ledger::{PlatformSealer, SealingEffects};

/// Per-node resources handed out by the environment.
#[derive(Clone)]
pub struct NodeResources {
    /// The node's committed log
    pub replica: Arc<dyn ReplicaLog>,
    /// The node's trust boundary
    pub sealer: Arc<dyn SealingEffects>,
}

impl std::fmt::Debug for NodeResources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeResources")
            .field("node", &self.replica.node_id())
            .field("boundary", &self.sealer.boundary_id())
            .finish()
    }
}

/// Starts node processes for a cluster.
#[async_trait]
pub trait ClusterEnvironment: Send + Sync {
    /// Start a node with an empty replica log.
    async fn spawn_node(&self, node: NodeId) -> TesseraResult<NodeResources>;

    /// Sealer the service uses to export its ledger secrets.
    fn service_sealer(&self) -> Arc<dyn SealingEffects>;
}

/// Every node runs in this process and shares one platform secret.
#[derive(Debug, Clone)]
pub struct InProcessEnvironment {
    sealer: Arc<PlatformSealer>,
}

impl InProcessEnvironment {
    /// Environment whose trust boundary is derived from `platform_secret`.
    pub fn new(platform_secret: &[u8]) -> Self {
        Self {
            sealer: Arc::new(PlatformSealer::new(platform_secret)),
        }
    }
}

#[async_trait]
impl ClusterEnvironment for InProcessEnvironment {
    async fn spawn_node(&self, node: NodeId) -> TesseraResult<NodeResources> {
        tracing::debug!(node = %node, "spawning in-process node");
        Ok(NodeResources {
            replica: Arc::new(MemoryReplica::new(node)),
            sealer: self.sealer.clone(),
        })
    }

    fn service_sealer(&self) -> Arc<dyn SealingEffects> {
        self.sealer.clone()
    }
}
