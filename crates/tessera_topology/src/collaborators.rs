//! External collaborator interfaces.
//!
//! The topology core drives side effects only through these traits; tests
//! substitute stubs, production wires the real gossip/streaming/compaction
//! subsystems.

use std::collections::BTreeSet;
use std::net::IpAddr;

use async_trait::async_trait;

use tessera_log::NodeId;

use crate::model::{NodeState, RingSlice, SessionId, Topology};

/// Liveness/application-state gossip.
#[async_trait]
pub trait Gossip: Send + Sync + 'static {
    async fn set_application_state(&self, key: &str, value: &str) -> anyhow::Result<()>;

    async fn address_of(&self, id: NodeId) -> Option<IpAddr>;
}

/// Node-id to address resolution used by `wait_for_ip`.
#[async_trait]
pub trait AddressMap: Send + Sync + 'static {
    async fn contains(&self, id: NodeId) -> bool;
}

/// What a node is asked to stream and why. The receiving node derives the
/// concrete range movements from its local topology snapshot.
#[derive(Clone, Debug)]
pub struct StreamPlan {
    /// The node whose ownership is changing.
    pub subject: NodeId,
    /// The subject's operation state (bootstrapping, removing, ...), which
    /// determines streaming direction and sources.
    pub state: NodeState,
    /// Rebuild only: restrict sources to this datacenter.
    pub source_dc: Option<String>,
    /// Nodes that must not participate (dead/ignored).
    pub exclude: BTreeSet<NodeId>,
    /// Session under which stream guards are minted.
    pub session: SessionId,
}

/// Data movement engine.
#[async_trait]
pub trait Streaming: Send + Sync + 'static {
    async fn stream(&self, plan: StreamPlan) -> anyhow::Result<()>;
}

/// Supplies the ring slice a joining node will own. Token selection policy
/// lives outside the topology core; the core only commits the result.
#[async_trait]
pub trait TokenAllocator: Send + Sync + 'static {
    async fn allocate(
        &self,
        node: NodeId,
        num_tokens: u32,
        topo: &Topology,
    ) -> anyhow::Result<RingSlice>;
}

/// Local compaction hook behind the cluster-wide cleanup request.
#[async_trait]
pub trait CompactionDriver: Send + Sync + 'static {
    async fn cleanup(&self, session: SessionId) -> anyhow::Result<()>;
}

/// View of the tablet load balancer consumed during `TabletMigration`.
#[async_trait]
pub trait TabletOps: Send + Sync + 'static {
    async fn pending_migrations(&self) -> usize;
}
