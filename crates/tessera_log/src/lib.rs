//! Replicated command-log interface consumed by tessera control-plane state
//! machines.
//!
//! The log itself (election, replication, snapshots) lives outside this
//! workspace; state machines only need the narrow contract below: commands
//! are opaque bytes, committed entries are delivered in order through a
//! [`LogApplier`] callback, and leadership changes arrive on a watch channel.
//! [`local::LocalLog`] provides a single-process linearizable implementation
//! for tests and embeddings.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

pub mod local;

pub use local::LocalLog;

/// Stable server identifier assigned when a node first joins the log group.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors surfaced by [`GroupLog`] operations.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// The local node is not the leader; appends must be redirected.
    #[error("not leader: current leader is {leader:?}")]
    NotLeader {
        /// The current leader, if known.
        leader: Option<NodeId>,
    },

    /// The log rejected or lost the entry before commit.
    #[error("append failed: {0}")]
    AppendFailed(String),

    /// Snapshot installation failed.
    #[error("snapshot install failed: {0}")]
    SnapshotFailed(String),
}

/// Apply-side callback for committed entries.
///
/// Commands are opaque bytes; `index` is the commit index and is strictly
/// increasing across calls within one subscriber lifetime. Implementations
/// must be deterministic: every replica applies the same entries in the same
/// order.
pub trait LogApplier: Send + Sync + 'static {
    fn apply(&self, index: u64, command: &[u8]);
}

/// The replicated command log as seen by a state machine on one replica.
#[async_trait]
pub trait GroupLog: Send + Sync + 'static {
    /// Append a command, resolving once it is committed. Returns the commit
    /// index. Fails with [`LogError::NotLeader`] on a non-leader replica.
    async fn append(&self, command: Vec<u8>) -> Result<u64, LogError>;

    /// Register the apply callback for committed entries. Entries committed
    /// after subscription are delivered in order, exactly once.
    fn subscribe(&self, applier: Arc<dyn LogApplier>);

    /// Leadership-change events. `Some(id)` is the current leader.
    fn leadership(&self) -> watch::Receiver<Option<NodeId>>;

    /// Add a server to the log group. Idempotent.
    async fn add_member(&self, id: NodeId) -> anyhow::Result<()>;

    /// Remove a server from the log group. Idempotent.
    async fn remove_member(&self, id: NodeId) -> anyhow::Result<()>;

    /// Replace the local unapplied prefix with a snapshot produced by the
    /// leader. The bytes are opaque to the log.
    async fn snapshot_install(&self, snapshot: Vec<u8>) -> Result<(), LogError>;
}
