//! Replicated cluster topology model.
//!
//! Pure data plus read-only queries. All mutation happens in the applier
//! (`crate::applier`) as a result of committed log entries; no other
//! component writes this structure.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tessera_log::NodeId;

use crate::requests::{GlobalRequest, RequestParam, TopologyRequest};

/// Position on the 64-bit partition ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Token(pub i64);

/// The set of ring tokens a node owns.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingSlice {
    pub tokens: BTreeSet<Token>,
}

impl RingSlice {
    pub fn new(tokens: impl IntoIterator<Item = Token>) -> Self {
        Self {
            tokens: tokens.into_iter().collect(),
        }
    }
}

/// Per-node lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Joined the log group but owns no data yet.
    None,
    /// Streaming its slice of the ring in.
    Bootstrapping,
    /// Being decommissioned; streams its data to the nodes taking over.
    Decommissioning,
    /// Being removed while dead; survivors stream its data to the new owners.
    Removing,
    /// Replacing a dead node; the dead node's data is streamed to it.
    Replacing,
    /// Re-streaming its own ranges from other replicas.
    Rebuilding,
    /// Serving its slice of the ring.
    Normal,
    /// Left the cluster and the log group.
    Left,
    /// Rolling back a failed decommission/remove.
    RollbackToNormal,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::None => "none",
            NodeState::Bootstrapping => "bootstrapping",
            NodeState::Decommissioning => "decommissioning",
            NodeState::Removing => "removing",
            NodeState::Replacing => "replacing",
            NodeState::Rebuilding => "rebuilding",
            NodeState::Normal => "normal",
            NodeState::Left => "left",
            NodeState::RollbackToNormal => "rollback_to_normal",
        };
        f.write_str(name)
    }
}

/// Cluster-wide reconfiguration phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitionState {
    JoinGroup0,
    CommitCdcGeneration,
    TabletDraining,
    WriteBothReadOld,
    WriteBothReadNew,
    TabletMigration,
    LeftTokenRing,
}

impl fmt::Display for TransitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransitionState::JoinGroup0 => "join_group0",
            TransitionState::CommitCdcGeneration => "commit_cdc_generation",
            TransitionState::TabletDraining => "tablet_draining",
            TransitionState::WriteBothReadOld => "write_both_read_old",
            TransitionState::WriteBothReadNew => "write_both_read_new",
            TransitionState::TabletMigration => "tablet_migration",
            TransitionState::LeftTokenRing => "left_token_ring",
        };
        f.write_str(name)
    }
}

/// Cleanup progress for a node during a global cleanup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CleanupStatus {
    #[default]
    Clean,
    Needed,
    Running,
}

impl fmt::Display for CleanupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CleanupStatus::Clean => "clean",
            CleanupStatus::Needed => "needed",
            CleanupStatus::Running => "running",
        };
        f.write_str(name)
    }
}

/// Identifier of a committed change-data-capture generation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CdcGenerationId(pub Uuid);

impl fmt::Display for CdcGenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session under which streaming operations mint their guards.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-node replica record. Retained for every non-left node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaState {
    pub state: NodeState,
    pub datacenter: String,
    pub rack: String,
    pub release_version: String,
    /// The tokens this node owns, once assigned.
    pub ring: Option<RingSlice>,
    pub shard_count: usize,
    /// Partitioner tuning: how many most-significant token bits to ignore
    /// when mapping tokens to shards.
    pub ignore_msb: u8,
    pub supported_features: BTreeSet<String>,
    pub cleanup: CleanupStatus,
    /// The request currently driving this node, or the last one completed.
    pub request_id: Uuid,
}

/// Static node properties supplied at registration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeProperties {
    pub datacenter: String,
    pub rack: String,
    pub release_version: String,
    pub shard_count: usize,
    pub ignore_msb: u8,
    pub supported_features: BTreeSet<String>,
}

impl NodeProperties {
    pub(crate) fn into_replica(self) -> ReplicaState {
        ReplicaState {
            state: NodeState::None,
            datacenter: self.datacenter,
            rack: self.rack,
            release_version: self.release_version,
            ring: None,
            shard_count: self.shard_count,
            ignore_msb: self.ignore_msb,
            supported_features: self.supported_features,
            cleanup: CleanupStatus::Clean,
            request_id: Uuid::nil(),
        }
    }
}

/// A pending global request together with its tracking id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalRequestEntry {
    pub request: GlobalRequest,
    pub request_id: Uuid,
}

pub const INITIAL_VERSION: u64 = 1;

/// The singleton replicated topology root.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    /// The cluster-wide transition in progress, if any.
    pub tstate: Option<TransitionState>,

    /// Advanced on every committed mutating entry.
    pub version: u64,
    /// Minimum topology version a data-plane request must present.
    /// Advanced only at read-ownership handover; always <= `version`.
    pub fence_version: u64,

    /// Normal ring members.
    pub normal_nodes: BTreeMap<NodeId, ReplicaState>,
    /// Nodes waiting for the coordinator to start joining them.
    pub new_nodes: BTreeMap<NodeId, ReplicaState>,
    /// Nodes mid-operation. At most one entry under this coordinator, but
    /// the model does not assume exclusivity.
    pub transition_nodes: BTreeMap<NodeId, ReplicaState>,
    /// Tombstones for nodes that left.
    pub left_nodes: BTreeSet<NodeId>,

    /// Pending per-node requests.
    pub requests: BTreeMap<NodeId, TopologyRequest>,
    /// Parameters for each pending request; retained until the node reaches
    /// `Normal` or `Left`.
    pub req_param: BTreeMap<NodeId, RequestParam>,
    /// Pending global request, if any.
    pub global_request: Option<GlobalRequestEntry>,

    /// The last committed CDC generation.
    pub current_cdc_generation_id: Option<CdcGenerationId>,
    /// Clustering key of in-flight CDC generation data; set exactly while
    /// `tstate == CommitCdcGeneration`.
    pub new_cdc_generation_data_uuid: Option<Uuid>,
    /// Committed but not yet cluster-visible generations, in commit order.
    pub unpublished_cdc_generations: Vec<CdcGenerationId>,

    /// Feature flags enabled cluster-wide.
    pub enabled_features: BTreeSet<String>,

    /// Session used to mint streaming guards.
    pub session: SessionId,

    /// When false, the tablet load balancer must not move tablets.
    pub tablet_balancing_enabled: bool,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            tstate: None,
            version: INITIAL_VERSION,
            fence_version: INITIAL_VERSION,
            normal_nodes: BTreeMap::new(),
            new_nodes: BTreeMap::new(),
            transition_nodes: BTreeMap::new(),
            left_nodes: BTreeSet::new(),
            requests: BTreeMap::new(),
            req_param: BTreeMap::new(),
            global_request: None,
            current_cdc_generation_id: None,
            new_cdc_generation_data_uuid: None,
            unpublished_cdc_generations: Vec::new(),
            enabled_features: BTreeSet::new(),
            session: SessionId::default(),
            tablet_balancing_enabled: true,
        }
    }
}

impl Topology {
    /// Replica record for a node in any non-left collection.
    pub fn find(&self, id: NodeId) -> Option<&ReplicaState> {
        self.normal_nodes
            .get(&id)
            .or_else(|| self.transition_nodes.get(&id))
            .or_else(|| self.new_nodes.get(&id))
    }

    /// True if the node exists in any state, including `Left`.
    pub fn contains(&self, id: NodeId) -> bool {
        self.normal_nodes.contains_key(&id)
            || self.transition_nodes.contains_key(&id)
            || self.new_nodes.contains_key(&id)
            || self.left_nodes.contains(&id)
    }

    /// Number of non-left nodes.
    pub fn size(&self) -> usize {
        self.normal_nodes.len() + self.transition_nodes.len() + self.new_nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// False iff the coordinator can safely start a new operation.
    pub fn is_busy(&self) -> bool {
        self.tstate.is_some() || !self.transition_nodes.is_empty() || self.global_request.is_some()
    }

    pub fn request_param(&self, id: NodeId) -> Option<&RequestParam> {
        self.req_param.get(&id)
    }

    /// The node a `Replace` parameter names, if the parameter is a replace.
    pub fn parse_replaced_node(param: Option<&RequestParam>) -> Option<NodeId> {
        match param {
            Some(RequestParam::Replace { replaced_id, .. }) => Some(*replaced_id),
            _ => None,
        }
    }

    /// Ignored-node declarations carried by a remove/replace parameter.
    pub fn parse_ignored_nodes(param: Option<&RequestParam>) -> BTreeSet<NodeId> {
        match param {
            Some(RequestParam::Remove { ignored_ids }) => ignored_ids.clone(),
            Some(RequestParam::Replace { ignored_ids, .. }) => ignored_ids.clone(),
            _ => BTreeSet::new(),
        }
    }

    /// Nodes an ongoing barrier must not wait for: dead nodes being removed
    /// or replaced, plus any ignored nodes declared with the request that is
    /// driving a transition.
    pub fn excluded_nodes(&self) -> BTreeSet<NodeId> {
        let mut result = BTreeSet::new();
        for (id, rs) in &self.transition_nodes {
            if rs.state == NodeState::Removing {
                result.insert(*id);
            }
            let param = self.request_param(*id);
            result.extend(Self::parse_ignored_nodes(param));
            if let Some(replaced) = Self::parse_replaced_node(param) {
                result.insert(replaced);
            }
        }
        result
    }

    /// Features supported by every normal node but not yet enabled.
    pub fn not_yet_enabled_features(&self) -> BTreeSet<String> {
        let mut nodes = self.normal_nodes.values();
        let Some(first) = nodes.next() else {
            return BTreeSet::new();
        };
        let mut candidate: BTreeSet<String> = first
            .supported_features
            .difference(&self.enabled_features)
            .cloned()
            .collect();
        for rs in nodes {
            if candidate.is_empty() {
                break;
            }
            candidate.retain(|f| rs.supported_features.contains(f));
        }
        candidate
    }
}
