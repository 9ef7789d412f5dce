//! Wire- and log-visible error kinds.
//!
//! Internal plumbing uses `anyhow`; this enum covers only the errors that
//! cross an RPC boundary or land in the `topology_requests` table.

use serde::{Deserialize, Serialize};

use crate::fencing::FencingToken;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum TopologyError {
    /// Fencing token is older than the callee's fence version. The caller
    /// must refresh its topology view and retry.
    #[error("stale topology: token {token} < fence version {fence_version}")]
    StaleTopology { token: FencingToken, fence_version: u64 },

    /// Request submitted to a non-leader coordinator.
    #[error("not leader")]
    NotLeader,

    /// Topology is busy with an incompatible operation; retry later.
    #[error("topology busy")]
    Busy,

    /// Malformed request parameters.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Streaming failed; transient, retried by the coordinator.
    #[error("stream failed: {0}")]
    StreamFailed(String),

    /// Barrier did not complete; transient, retried by the coordinator.
    #[error("barrier failed: {0}")]
    BarrierFailed(String),

    /// The operation was aborted and the node returned to its prior state.
    #[error("rolled back: {0}")]
    RolledBack(String),

    /// Invariant violation on apply. The process must terminate.
    #[error("fatal: {0}")]
    Fatal(String),
}
