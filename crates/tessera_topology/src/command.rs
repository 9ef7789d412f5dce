//! Committed log entry kinds.
//!
//! Every topology change is one of these commands, appended by the
//! coordinator (or by request submission) and applied deterministically on
//! every replica. Commands are encoded as JSON bytes; the log treats them as
//! opaque.
//!
//! Several commands are compound: a single entry must leave the model with
//! all invariants intact, so moves that open or close a transition carry the
//! transition change in the same entry.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tessera_log::NodeId;

use crate::model::{
    CdcGenerationId, CleanupStatus, NodeProperties, NodeState, RingSlice, SessionId,
    TransitionState, Token,
};
use crate::requests::{GlobalRequest, RequestParam, TopologyRequest};

/// CDC stream assignment for one token range of a generation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CdcStreamRange {
    pub token: Token,
    pub streams: Vec<Uuid>,
}

/// Payload of a new CDC generation, persisted to the `cdc_generations`
/// table clustered by `(generation, range index)`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CdcGenerationData {
    pub ranges: Vec<CdcStreamRange>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Register a node that joined the log group; it enters `new_nodes` in
    /// state `None`.
    AddNode { id: NodeId, props: NodeProperties },

    /// Queue a per-node request with its typed parameters.
    SetRequest {
        id: NodeId,
        request: TopologyRequest,
        param: RequestParam,
        request_id: Uuid,
    },

    /// Queue a global request. `Cleanup` also marks every normal node
    /// `Needed` so progress is unambiguous across coordinator failover.
    SetGlobalRequest {
        request: GlobalRequest,
        request_id: Uuid,
    },

    /// Abort a queued request before its transition begins; clears the
    /// request and parameters and closes the tracking row with `error`. A
    /// registered node that never started joining is tombstoned.
    CancelRequest { id: NodeId, error: String },

    /// Move a node into `transition_nodes` with its operation state and open
    /// the cluster transition in the same entry. `ring` carries the tokens a
    /// joining/replacing node will own; `session` fences streaming.
    BeginNodeTransition {
        id: NodeId,
        state: NodeState,
        tstate: TransitionState,
        ring: Option<RingSlice>,
        session: SessionId,
    },

    /// Advance the cluster transition. Entering `WriteBothReadNew` also
    /// bumps `fence_version` to the new topology version; this is the only
    /// fencing boundary.
    AdvanceTransition { tstate: TransitionState },

    /// Open `CommitCdcGeneration` and persist the generation data under
    /// `data_uuid` in the same entry.
    BeginCdcCommit {
        data_uuid: Uuid,
        data: CdcGenerationData,
    },

    /// Install a committed CDC generation: set it current, queue it for
    /// publication, clear the in-flight data uuid, and move to
    /// `next_tstate`. `None` closes a standalone global request.
    CommitCdcGeneration {
        generation: CdcGenerationId,
        next_tstate: Option<TransitionState>,
    },

    /// Drop a published prefix of `unpublished_cdc_generations`.
    PublishCdcGenerations { up_to: CdcGenerationId },

    /// Promote a transition node to `normal_nodes`; clears its request,
    /// parameters and, when it was the last transition node, the transition.
    /// Closes the node's `topology_requests` row as successful.
    PromoteNode { id: NodeId },

    /// Move a node to `left_nodes`, dropping its replica record and closing
    /// its request as successful.
    RemoveNode { id: NodeId },

    /// Mark a failed leave/remove for rollback; closes the request row with
    /// `error`.
    RollbackNode { id: NodeId, error: String },

    /// Return a rolled-back node to `normal_nodes` with its prior ring.
    FinishRollback { id: NodeId },

    /// Replace the cluster-wide enabled feature set.
    SetEnabledFeatures { features: BTreeSet<String> },

    /// Rotate the streaming session.
    SetSession { session: SessionId },

    /// Record cleanup progress for one node.
    SetCleanupStatus { id: NodeId, status: CleanupStatus },

    /// Clear the pending global request and close its tracking row.
    FinishGlobalRequest { error: String },

    /// Toggle tablet load balancing.
    SetTabletBalancing { enabled: bool },
}

impl Command {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<Command> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_round_trip_through_encode() {
        let cmd = Command::BeginNodeTransition {
            id: NodeId(3),
            state: NodeState::Bootstrapping,
            tstate: TransitionState::JoinGroup0,
            ring: Some(RingSlice::new([Token(-42), Token(7)])),
            session: SessionId(Uuid::new_v4()),
        };
        let bytes = cmd.encode().unwrap();
        assert_eq!(Command::decode(&bytes).unwrap(), cmd);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(Command::decode(b"not json").is_err());
    }
}
