//! Command log applier.
//!
//! Applies committed entries to the topology model, deterministically and
//! without I/O beyond the canonical table mutations each entry emits. Every
//! replica runs one of these; the coordinator and data-plane fencers rewake
//! off the applied-entry notification.
//!
//! An entry that would violate a model invariant is a programming bug
//! somewhere upstream; the consensus layer never delivers such entries in a
//! correct system, so the applier treats it as fatal.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{ensure, Context};
use tokio::sync::Notify;
use tokio::time::Instant;

use tessera_log::{LogApplier, NodeId};

use crate::command::Command;
use crate::error::TopologyError;
use crate::fencing::FencingRegistry;
use crate::model::{NodeState, ReplicaState, Topology, TransitionState};
use crate::requests::GlobalRequest;
use crate::tables::{
    MetaRow, Mutation, NodeCollection, NodeRow, SystemTables, TopologySnapshot,
};

/// Pure state transition: `(state, entry) -> (state', mutations)`.
///
/// Errors signal an invariant-violating entry and are fatal to the process.
pub fn apply_command(
    prev: &Topology,
    cmd: &Command,
) -> anyhow::Result<(Topology, Vec<Mutation>)> {
    let mut next = prev.clone();
    next.version = prev.version + 1;

    let mut touched: BTreeSet<NodeId> = BTreeSet::new();
    let mut extra: Vec<Mutation> = Vec::new();

    match cmd {
        Command::AddNode { id, props } => {
            ensure!(!next.contains(*id), "node {id} already registered");
            next.new_nodes.insert(*id, props.clone().into_replica());
            touched.insert(*id);
        }

        Command::SetRequest {
            id,
            request,
            param,
            request_id,
        } => {
            ensure!(
                param.matches(*request),
                "request {request} for node {id} carries a mismatched parameter"
            );
            ensure!(
                !next.requests.contains_key(id),
                "node {id} already has a pending request"
            );
            replica_mut(&mut next, *id)
                .with_context(|| format!("request {request} targets unknown node {id}"))?
                .request_id = *request_id;
            next.requests.insert(*id, *request);
            next.req_param.insert(*id, param.clone());
            touched.insert(*id);
            extra.push(Mutation::OpenRequest {
                request_id: *request_id,
                kind: request.to_string(),
            });
        }

        Command::SetGlobalRequest {
            request,
            request_id,
        } => {
            ensure!(
                next.global_request.is_none(),
                "a global request is already pending"
            );
            next.global_request = Some(crate::model::GlobalRequestEntry {
                request: *request,
                request_id: *request_id,
            });
            if *request == GlobalRequest::Cleanup {
                // Mark the whole ring in the same entry so a recovering
                // coordinator can tell "not started" from "finished".
                let ids: Vec<NodeId> = next.normal_nodes.keys().copied().collect();
                for id in ids {
                    next.normal_nodes.get_mut(&id).unwrap().cleanup =
                        crate::model::CleanupStatus::Needed;
                    touched.insert(id);
                }
            }
            extra.push(Mutation::OpenRequest {
                request_id: *request_id,
                kind: request.to_string(),
            });
        }

        Command::CancelRequest { id, error } => {
            let request = next
                .requests
                .remove(id)
                .with_context(|| format!("no pending request to cancel for node {id}"))?;
            next.req_param.remove(id);
            let request_id = next
                .find(*id)
                .map(|rs| rs.request_id)
                .with_context(|| format!("cancel targets unknown node {id}"))?;
            // A node that never started joining leaves nothing behind but
            // its id.
            if matches!(
                request,
                crate::requests::TopologyRequest::Join | crate::requests::TopologyRequest::Replace
            ) && next.new_nodes.remove(id).is_some()
            {
                next.left_nodes.insert(*id);
            }
            touched.insert(*id);
            extra.push(Mutation::CloseRequest {
                request_id,
                error: error.clone(),
            });
        }

        Command::BeginNodeTransition {
            id,
            state,
            tstate,
            ring,
            session,
        } => {
            ensure!(
                next.tstate.is_none(),
                "cannot begin a node transition while {} is in progress",
                next.tstate.unwrap()
            );
            let mut rs = next
                .new_nodes
                .remove(id)
                .or_else(|| next.normal_nodes.remove(id))
                .with_context(|| format!("transition targets unknown node {id}"))?;
            rs.state = *state;
            if let Some(ring) = ring {
                rs.ring = Some(ring.clone());
            }
            next.transition_nodes.insert(*id, rs);
            next.tstate = Some(*tstate);
            next.session = *session;
            touched.insert(*id);
        }

        Command::AdvanceTransition { tstate } => {
            ensure!(
                next.tstate.is_some(),
                "cannot advance to {tstate} with no transition in progress"
            );
            next.tstate = Some(*tstate);
            if *tstate == TransitionState::WriteBothReadNew {
                // Read-ownership handover: fence out in-flight work against
                // the old ring.
                next.fence_version = next.version;
            }
        }

        Command::BeginCdcCommit { data_uuid, data } => {
            ensure!(
                next.tstate.is_none() || next.tstate == Some(TransitionState::JoinGroup0),
                "cdc commit cannot start during {}",
                next.tstate.unwrap()
            );
            next.tstate = Some(TransitionState::CommitCdcGeneration);
            next.new_cdc_generation_data_uuid = Some(*data_uuid);
            for (index, range) in data.ranges.iter().enumerate() {
                extra.push(Mutation::PutCdcRange {
                    generation: *data_uuid,
                    range_index: index as u32,
                    payload: serde_json::to_vec(range)?,
                });
            }
        }

        Command::CommitCdcGeneration {
            generation,
            next_tstate,
        } => {
            ensure!(
                next.tstate == Some(TransitionState::CommitCdcGeneration),
                "cdc generation committed outside commit_cdc_generation"
            );
            next.current_cdc_generation_id = Some(*generation);
            next.unpublished_cdc_generations.push(*generation);
            next.new_cdc_generation_data_uuid = None;
            next.tstate = *next_tstate;
            if next_tstate.is_none() {
                let entry = next
                    .global_request
                    .take()
                    .context("standalone cdc commit without a global request")?;
                extra.push(Mutation::CloseRequest {
                    request_id: entry.request_id,
                    error: String::new(),
                });
            }
        }

        Command::PublishCdcGenerations { up_to } => {
            if let Some(pos) = next
                .unpublished_cdc_generations
                .iter()
                .position(|g| g == up_to)
            {
                next.unpublished_cdc_generations.drain(..=pos);
            }
        }

        Command::PromoteNode { id } => {
            let mut rs = next
                .transition_nodes
                .remove(id)
                .or_else(|| next.new_nodes.remove(id))
                .with_context(|| format!("promotion targets unknown node {id}"))?;
            ensure!(
                rs.ring.is_some(),
                "cannot promote node {id} without a ring slice"
            );
            // A replacement takes over in the same entry its predecessor
            // leaves, so the ring never shows both owners.
            if let Some(replaced) = Topology::parse_replaced_node(next.req_param.get(id)) {
                if next.normal_nodes.remove(&replaced).is_some() {
                    next.left_nodes.insert(replaced);
                    touched.insert(replaced);
                }
            }
            rs.state = NodeState::Normal;
            let request_id = rs.request_id;
            next.normal_nodes.insert(*id, rs);
            next.requests.remove(id);
            next.req_param.remove(id);
            if next.transition_nodes.is_empty() {
                next.tstate = None;
            }
            touched.insert(*id);
            extra.push(Mutation::CloseRequest {
                request_id,
                error: String::new(),
            });
        }

        Command::RemoveNode { id } => {
            let rs = next
                .transition_nodes
                .remove(id)
                .with_context(|| format!("removal targets non-transitioning node {id}"))?;
            next.left_nodes.insert(*id);
            next.requests.remove(id);
            next.req_param.remove(id);
            if next.transition_nodes.is_empty() {
                next.tstate = None;
            }
            touched.insert(*id);
            extra.push(Mutation::CloseRequest {
                request_id: rs.request_id,
                error: String::new(),
            });
        }

        Command::RollbackNode { id, error } => {
            let rs = next
                .transition_nodes
                .get_mut(id)
                .with_context(|| format!("rollback targets non-transitioning node {id}"))?;
            rs.state = NodeState::RollbackToNormal;
            let request_id = rs.request_id;
            touched.insert(*id);
            extra.push(Mutation::CloseRequest {
                request_id,
                error: error.clone(),
            });
        }

        Command::FinishRollback { id } => {
            let mut rs = next
                .transition_nodes
                .remove(id)
                .with_context(|| format!("rollback finish targets unknown node {id}"))?;
            ensure!(
                rs.state == NodeState::RollbackToNormal,
                "node {id} is {} rather than rolling back",
                rs.state
            );
            ensure!(rs.ring.is_some(), "rolled-back node {id} lost its ring");
            rs.state = NodeState::Normal;
            next.normal_nodes.insert(*id, rs);
            next.requests.remove(id);
            next.req_param.remove(id);
            if next.transition_nodes.is_empty() {
                next.tstate = None;
            }
            touched.insert(*id);
        }

        Command::SetEnabledFeatures { features } => {
            next.enabled_features = features.clone();
        }

        Command::SetSession { session } => {
            next.session = *session;
        }

        Command::SetCleanupStatus { id, status } => {
            replica_mut(&mut next, *id)
                .with_context(|| format!("cleanup status update for unknown node {id}"))?
                .cleanup = *status;
            touched.insert(*id);
        }

        Command::FinishGlobalRequest { error } => {
            let entry = next
                .global_request
                .take()
                .context("no global request to finish")?;
            extra.push(Mutation::CloseRequest {
                request_id: entry.request_id,
                error: error.clone(),
            });
        }

        Command::SetTabletBalancing { enabled } => {
            next.tablet_balancing_enabled = *enabled;
        }
    }

    let mut mutations = vec![Mutation::PutMeta(MetaRow::from_topology(&next))];
    for id in touched {
        mutations.push(Mutation::PutNode {
            id,
            row: node_row(&next, id),
        });
    }
    mutations.extend(extra);
    Ok((next, mutations))
}

fn replica_mut<'a>(topo: &'a mut Topology, id: NodeId) -> Option<&'a mut ReplicaState> {
    if topo.normal_nodes.contains_key(&id) {
        return topo.normal_nodes.get_mut(&id);
    }
    if topo.transition_nodes.contains_key(&id) {
        return topo.transition_nodes.get_mut(&id);
    }
    topo.new_nodes.get_mut(&id)
}

fn node_row(topo: &Topology, id: NodeId) -> NodeRow {
    let (collection, replica) = if let Some(rs) = topo.normal_nodes.get(&id) {
        (NodeCollection::Normal, Some(rs.clone()))
    } else if let Some(rs) = topo.new_nodes.get(&id) {
        (NodeCollection::New, Some(rs.clone()))
    } else if let Some(rs) = topo.transition_nodes.get(&id) {
        (NodeCollection::Transition, Some(rs.clone()))
    } else {
        (NodeCollection::Left, None)
    };
    NodeRow {
        collection,
        replica,
        request: topo.requests.get(&id).copied(),
        param: topo.req_param.get(&id).cloned(),
    }
}

/// Model invariants that must hold after every committed entry.
pub fn check_invariants(prev: &Topology, next: &Topology) -> anyhow::Result<()> {
    let mut seen: BTreeSet<NodeId> = BTreeSet::new();
    let all = next
        .normal_nodes
        .keys()
        .chain(next.new_nodes.keys())
        .chain(next.transition_nodes.keys())
        .chain(next.left_nodes.iter());
    for id in all {
        ensure!(seen.insert(*id), "node {id} appears in two collections");
    }

    if !next.transition_nodes.is_empty() {
        ensure!(
            next.tstate.is_some(),
            "transitioning nodes present without a transition state"
        );
    }
    if next.tstate.is_some() {
        ensure!(
            !next.transition_nodes.is_empty() || next.global_request.is_some(),
            "transition state {} with nothing in progress",
            next.tstate.unwrap()
        );
    }

    if next.tstate == Some(TransitionState::CommitCdcGeneration) {
        ensure!(
            next.new_cdc_generation_data_uuid.is_some(),
            "commit_cdc_generation without in-flight generation data"
        );
    }

    for feature in &next.enabled_features {
        for (id, rs) in &next.normal_nodes {
            ensure!(
                rs.supported_features.contains(feature),
                "enabled feature {feature} is not supported by node {id}"
            );
        }
    }

    ensure!(
        next.version > prev.version,
        "version must strictly increase ({} -> {})",
        prev.version,
        next.version
    );
    ensure!(
        next.fence_version >= prev.fence_version,
        "fence version went backwards"
    );
    ensure!(
        next.fence_version <= next.version,
        "fence version {} exceeds version {}",
        next.fence_version,
        next.version
    );

    for (id, rs) in &next.normal_nodes {
        ensure!(rs.ring.is_some(), "normal node {id} has no ring slice");
    }

    for (id, request) in &next.requests {
        let param = next
            .req_param
            .get(id)
            .with_context(|| format!("request for node {id} has no parameters"))?;
        ensure!(
            param.matches(*request),
            "request {request} for node {id} has mismatched parameters"
        );
    }

    Ok(())
}

/// Replica-local topology state machine: the applier plus the snapshot other
/// components read.
pub struct TopologyStateMachine {
    state: RwLock<Arc<Topology>>,
    tables: SystemTables,
    fencing: Arc<FencingRegistry>,
    event: Notify,
    last_applied: AtomicU64,
}

impl TopologyStateMachine {
    /// Open over the given tables, recovering any persisted topology.
    pub fn new(tables: SystemTables) -> anyhow::Result<Arc<Self>> {
        let topo = tables.load_topology()?.unwrap_or_default();
        let fencing = FencingRegistry::new();
        fencing.advance(topo.version, topo.fence_version);
        Ok(Arc::new(Self {
            state: RwLock::new(Arc::new(topo)),
            tables,
            fencing,
            event: Notify::new(),
            last_applied: AtomicU64::new(0),
        }))
    }

    /// The latest applied topology.
    pub fn topology(&self) -> Arc<Topology> {
        self.state.read().unwrap().clone()
    }

    pub fn fencing(&self) -> &Arc<FencingRegistry> {
        &self.fencing
    }

    pub fn tables(&self) -> &SystemTables {
        &self.tables
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied.load(Ordering::SeqCst)
    }

    /// Wait until the applied topology satisfies `cond`, with no deadline.
    pub async fn wait_until<F>(&self, cond: F) -> Arc<Topology>
    where
        F: Fn(&Topology) -> bool,
    {
        loop {
            let wakeup = self.event.notified();
            let topo = self.topology();
            if cond(&topo) {
                return topo;
            }
            wakeup.await;
        }
    }

    /// Wait (bounded) until the local applier reaches `version`.
    pub async fn wait_for_version(
        &self,
        version: u64,
        deadline: Duration,
    ) -> Result<(), TopologyError> {
        let expires = Instant::now() + deadline;
        loop {
            let wakeup = self.event.notified();
            if self.topology().version >= version {
                return Ok(());
            }
            if tokio::time::timeout_at(expires, wakeup).await.is_err() {
                return Err(TopologyError::BarrierFailed(format!(
                    "timed out waiting for topology version {version} (applied {})",
                    self.topology().version
                )));
            }
        }
    }

    /// Wake any `wait_until`/`wait_for_version` callers. Called after every
    /// applied entry; also usable by tests.
    pub fn notify(&self) {
        self.event.notify_waiters();
    }

    /// Bundle the persisted tables for follower catch-up.
    pub fn snapshot(&self) -> anyhow::Result<TopologySnapshot> {
        self.tables.snapshot(self.last_applied())
    }

    /// Install a leader-provided snapshot, replacing local state.
    pub fn install_snapshot(&self, snapshot: &TopologySnapshot) -> anyhow::Result<()> {
        self.tables.install(snapshot)?;
        let topo = self
            .tables
            .load_topology()?
            .context("installed snapshot holds no topology")?;
        self.fencing.advance(topo.version, topo.fence_version);
        *self.state.write().unwrap() = Arc::new(topo);
        self.last_applied
            .store(snapshot.applied_index, Ordering::SeqCst);
        self.event.notify_waiters();
        Ok(())
    }

    fn fatal(&self, index: u64, message: &str, err: &anyhow::Error) -> ! {
        tracing::error!(index, error = ?err, "{message}");
        panic!("{message} at log index {index}: {err:#}");
    }
}

impl LogApplier for TopologyStateMachine {
    fn apply(&self, index: u64, command: &[u8]) {
        let cmd = match Command::decode(command) {
            Ok(cmd) => cmd,
            Err(err) => self.fatal(index, "undecodable topology command", &err),
        };

        let prev = self.topology();
        let (topo, mutations) = match apply_command(&prev, &cmd) {
            Ok(result) => result,
            Err(err) => self.fatal(index, "topology command violates the model", &err),
        };
        if let Err(err) = check_invariants(&prev, &topo) {
            self.fatal(index, "topology invariant violated", &err);
        }
        if let Err(err) = self.tables.apply(&mutations) {
            self.fatal(index, "system table write failed", &err);
        }

        tracing::debug!(index, version = topo.version, "applied topology entry");
        let topo = Arc::new(topo);
        *self.state.write().unwrap() = topo.clone();
        self.fencing.advance(topo.version, topo.fence_version);
        self.last_applied.store(index, Ordering::SeqCst);
        self.event.notify_waiters();
    }
}
