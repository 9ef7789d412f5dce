//! Topology request queue and prioritizer.
//!
//! Queued state lives in the replicated `Topology` (`requests`, `req_param`,
//! `global_request`), so the queue survives coordinator failover for free.
//! Submission validates against the current snapshot and goes through the
//! log; selection picks the highest-priority pending request.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tessera_log::{GroupLog, LogError, NodeId};

use crate::applier::TopologyStateMachine;
use crate::command::Command;
use crate::error::TopologyError;
use crate::model::{NodeProperties, SessionId};

/// Per-node request kinds, declared in priority order. The order minimizes
/// the amount of cleanup work later operations have to do; preserve it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TopologyRequest {
    Replace,
    Join,
    Remove,
    Leave,
    Rebuild,
}

impl fmt::Display for TopologyRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TopologyRequest::Replace => "replace",
            TopologyRequest::Join => "join",
            TopologyRequest::Remove => "remove",
            TopologyRequest::Leave => "leave",
            TopologyRequest::Rebuild => "rebuild",
        };
        f.write_str(name)
    }
}

/// Typed parameter bundle for a per-node request. Leave carries none.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestParam {
    Join { num_tokens: u32 },
    Rebuild { source_dc: String },
    Remove { ignored_ids: BTreeSet<NodeId> },
    Replace { replaced_id: NodeId, ignored_ids: BTreeSet<NodeId> },
    Leave,
}

impl RequestParam {
    /// True if this parameter variant belongs to `request`.
    pub fn matches(&self, request: TopologyRequest) -> bool {
        matches!(
            (self, request),
            (RequestParam::Join { .. }, TopologyRequest::Join)
                | (RequestParam::Rebuild { .. }, TopologyRequest::Rebuild)
                | (RequestParam::Remove { .. }, TopologyRequest::Remove)
                | (RequestParam::Replace { .. }, TopologyRequest::Replace)
                | (RequestParam::Leave, TopologyRequest::Leave)
        )
    }
}

/// Cluster-wide requests not tied to a single node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GlobalRequest {
    NewCdcGeneration,
    Cleanup,
}

impl fmt::Display for GlobalRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GlobalRequest::NewCdcGeneration => "new_cdc_generation",
            GlobalRequest::Cleanup => "cleanup",
        };
        f.write_str(name)
    }
}

/// Pick the next request to run: lowest priority value first, ties broken by
/// ascending node id.
pub fn next_request(
    requests: &std::collections::BTreeMap<NodeId, TopologyRequest>,
) -> Option<(NodeId, TopologyRequest)> {
    requests
        .iter()
        .map(|(id, req)| (*id, *req))
        .min_by_key(|(id, req)| (*req, *id))
}

/// Leader-side request submission. Validates against the latest applied
/// snapshot and appends through the log; the resulting request id keys the
/// `topology_requests` row.
pub struct RequestQueue {
    log: Arc<dyn GroupLog>,
    sm: Arc<TopologyStateMachine>,
}

impl RequestQueue {
    pub fn new(log: Arc<dyn GroupLog>, sm: Arc<TopologyStateMachine>) -> Self {
        Self { log, sm }
    }

    /// Register a fresh node and queue a `Join` for it.
    pub async fn request_join(
        &self,
        id: NodeId,
        props: NodeProperties,
        num_tokens: u32,
    ) -> Result<Uuid, TopologyError> {
        let topo = self.sm.topology();
        if topo.contains(id) {
            return Err(TopologyError::InvalidRequest(format!(
                "node {id} is already a cluster member"
            )));
        }
        if num_tokens == 0 {
            return Err(TopologyError::InvalidRequest(
                "join requires a non-zero token count".into(),
            ));
        }
        require_enabled_features(&topo, &props)?;
        self.append(Command::AddNode { id, props }).await?;
        self.set_request(id, TopologyRequest::Join, RequestParam::Join { num_tokens })
            .await
    }

    /// Register a fresh node that will take over a dead member's ring slice.
    pub async fn request_replace(
        &self,
        id: NodeId,
        props: NodeProperties,
        replaced_id: NodeId,
        ignored_ids: BTreeSet<NodeId>,
    ) -> Result<Uuid, TopologyError> {
        let topo = self.sm.topology();
        if topo.contains(id) {
            return Err(TopologyError::InvalidRequest(format!(
                "node {id} is already a cluster member"
            )));
        }
        if !topo.normal_nodes.contains_key(&replaced_id) {
            return Err(TopologyError::InvalidRequest(format!(
                "replaced node {replaced_id} is not a normal cluster member"
            )));
        }
        require_enabled_features(&topo, &props)?;
        self.append(Command::AddNode { id, props }).await?;
        self.set_request(
            id,
            TopologyRequest::Replace,
            RequestParam::Replace {
                replaced_id,
                ignored_ids,
            },
        )
        .await
    }

    /// Queue a decommission of a live normal member.
    pub async fn request_leave(&self, id: NodeId) -> Result<Uuid, TopologyError> {
        self.require_normal(id)?;
        self.set_request(id, TopologyRequest::Leave, RequestParam::Leave)
            .await
    }

    /// Queue removal of a dead normal member.
    pub async fn request_remove(
        &self,
        id: NodeId,
        ignored_ids: BTreeSet<NodeId>,
    ) -> Result<Uuid, TopologyError> {
        self.require_normal(id)?;
        self.set_request(id, TopologyRequest::Remove, RequestParam::Remove { ignored_ids })
            .await
    }

    /// Queue a rebuild of a normal member's data from `source_dc`.
    pub async fn request_rebuild(
        &self,
        id: NodeId,
        source_dc: String,
    ) -> Result<Uuid, TopologyError> {
        self.require_normal(id)?;
        self.set_request(id, TopologyRequest::Rebuild, RequestParam::Rebuild { source_dc })
            .await
    }

    /// Queue a global request. Only one may pend at a time.
    pub async fn request_global(&self, request: GlobalRequest) -> Result<Uuid, TopologyError> {
        let topo = self.sm.topology();
        if topo.global_request.is_some() {
            return Err(TopologyError::Busy);
        }
        if request == GlobalRequest::Cleanup && topo.normal_nodes.is_empty() {
            return Err(TopologyError::InvalidRequest(
                "cleanup requires at least one normal node".into(),
            ));
        }
        let request_id = Uuid::new_v4();
        self.append(Command::SetGlobalRequest {
            request,
            request_id,
        })
        .await?;
        Ok(request_id)
    }

    /// Administrative: rotate the streaming session, invalidating guards
    /// minted under the previous one.
    pub async fn rotate_session(&self) -> Result<SessionId, TopologyError> {
        let session = SessionId(Uuid::new_v4());
        self.append(Command::SetSession { session }).await?;
        Ok(session)
    }

    /// Administrative: enable or disable tablet load balancing.
    pub async fn set_tablet_balancing(&self, enabled: bool) -> Result<(), TopologyError> {
        self.append(Command::SetTabletBalancing { enabled }).await?;
        Ok(())
    }

    pub fn state_machine(&self) -> &Arc<TopologyStateMachine> {
        &self.sm
    }

    fn require_normal(&self, id: NodeId) -> Result<(), TopologyError> {
        let topo = self.sm.topology();
        if !topo.normal_nodes.contains_key(&id) {
            return Err(TopologyError::InvalidRequest(format!(
                "node {id} is not a normal cluster member"
            )));
        }
        Ok(())
    }

    async fn set_request(
        &self,
        id: NodeId,
        request: TopologyRequest,
        param: RequestParam,
    ) -> Result<Uuid, TopologyError> {
        let topo = self.sm.topology();
        if topo.requests.contains_key(&id) {
            return Err(TopologyError::Busy);
        }
        let request_id = Uuid::new_v4();
        tracing::info!(node = %id, request = %request, request_id = %request_id, "queueing topology request");
        self.append(Command::SetRequest {
            id,
            request,
            param,
            request_id,
        })
        .await?;
        Ok(request_id)
    }

    async fn append(&self, command: Command) -> Result<u64, TopologyError> {
        let bytes = command
            .encode()
            .map_err(|err| TopologyError::InvalidRequest(err.to_string()))?;
        match self.log.append(bytes).await {
            Ok(index) => Ok(index),
            Err(LogError::NotLeader { .. }) => Err(TopologyError::NotLeader),
            Err(err) => Err(TopologyError::InvalidRequest(err.to_string())),
        }
    }
}

/// A node cannot join a cluster whose enabled features it does not support.
fn require_enabled_features(
    topo: &crate::model::Topology,
    props: &NodeProperties,
) -> Result<(), TopologyError> {
    for feature in &topo.enabled_features {
        if !props.supported_features.contains(feature) {
            return Err(TopologyError::InvalidRequest(format!(
                "joining node does not support enabled feature {feature}"
            )));
        }
    }
    Ok(())
}
