//! Topology coordinator.
//!
//! Runs on the consensus leader only and drives every topology change
//! through the fixed transition sequence. The coordinator keeps no durable
//! state of its own: each state advance is committed to the log *before* the
//! RPCs that depend on it are issued, so a newly elected coordinator resumes
//! from whatever `Topology` the log left behind.
//!
//! Per-node operations are serialized; the model does not assume
//! exclusivity, but this coordinator drives one at a time.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use futures_util::stream::{FuturesUnordered, StreamExt};
use rand::Rng;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

use tessera_log::{GroupLog, NodeId};

use crate::applier::TopologyStateMachine;
use crate::collaborators::{AddressMap, TabletOps, TokenAllocator};
use crate::command::{CdcGenerationData, CdcStreamRange, Command};
use crate::error::TopologyError;
use crate::model::{
    CdcGenerationId, NodeState, ReplicaState, SessionId, Token, Topology, TransitionState,
};
use crate::requests::{next_request, GlobalRequest, RequestParam, TopologyRequest};
use crate::rpc::{CmdStatus, CoordinatorRpc, TopologyCmdKind, TopologyCmdRequest};

/// Coordinator tuning knobs.
#[derive(Clone, Copy, Debug)]
pub struct CoordinatorConfig {
    /// Deadline for a single RPC round trip.
    pub rpc_timeout: Duration,
    /// First retry delay; doubles up to `retry_cap` with jitter.
    pub retry_base: Duration,
    pub retry_cap: Duration,
    /// Per-target attempts for barriers and other transient commands.
    pub max_rpc_attempts: u32,
    /// Streaming attempts before a leave/remove/rebuild rolls back.
    pub max_stream_attempts: u32,
    /// How long to wait for a joining node's address to appear.
    pub wait_for_ip_timeout: Duration,
    pub wait_for_ip_poll: Duration,
    /// Poll interval while tablet migrations drain.
    pub tablet_poll: Duration,
    /// Pause after a failed step before re-reading the topology.
    pub step_retry: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            rpc_timeout: Duration::from_secs(30),
            retry_base: Duration::from_millis(100),
            retry_cap: Duration::from_secs(5),
            max_rpc_attempts: 10,
            max_stream_attempts: 3,
            wait_for_ip_timeout: Duration::from_secs(60),
            wait_for_ip_poll: Duration::from_millis(100),
            tablet_poll: Duration::from_millis(200),
            step_retry: Duration::from_millis(100),
        }
    }
}

struct CoordinatorTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Leader-only driver of topology transitions.
pub struct Coordinator {
    node_id: NodeId,
    log: Arc<dyn GroupLog>,
    sm: Arc<TopologyStateMachine>,
    rpc: Arc<dyn CoordinatorRpc>,
    tokens: Arc<dyn TokenAllocator>,
    addr_map: Arc<dyn AddressMap>,
    tablets: Arc<dyn TabletOps>,
    cfg: CoordinatorConfig,
    /// Serializes administrative start/stop; contenders fail fast.
    ops: Semaphore,
    task: Mutex<Option<CoordinatorTask>>,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: NodeId,
        log: Arc<dyn GroupLog>,
        sm: Arc<TopologyStateMachine>,
        rpc: Arc<dyn CoordinatorRpc>,
        tokens: Arc<dyn TokenAllocator>,
        addr_map: Arc<dyn AddressMap>,
        tablets: Arc<dyn TabletOps>,
        cfg: CoordinatorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            log,
            sm,
            rpc,
            tokens,
            addr_map,
            tablets,
            cfg,
            ops: Semaphore::new(1),
            task: Mutex::new(None),
        })
    }

    /// Start the coordinator task. Fails with `Busy` when another start or
    /// stop is in flight, or the coordinator is already running.
    pub fn start(self: &Arc<Self>) -> Result<(), TopologyError> {
        let _permit = self.ops.try_acquire().map_err(|_| TopologyError::Busy)?;
        let mut slot = self.task.lock().unwrap();
        if slot.is_some() {
            return Err(TopologyError::Busy);
        }
        let (shutdown, shutdown_rx) = watch::channel(false);
        let this = self.clone();
        let handle = tokio::spawn(async move { this.run(shutdown_rx).await });
        *slot = Some(CoordinatorTask { shutdown, handle });
        Ok(())
    }

    /// Stop the coordinator, cancelling pending RPCs and draining the task.
    pub async fn stop(&self) -> Result<(), TopologyError> {
        let _permit = self.ops.try_acquire().map_err(|_| TopologyError::Busy)?;
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.shutdown.send(true);
            let _ = task.handle.await;
        }
        Ok(())
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut leadership = self.log.leadership();
        tracing::info!(node = %self.node_id, "topology coordinator started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            if *leadership.borrow_and_update() != Some(self.node_id) {
                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = leadership.changed() => {}
                }
                continue;
            }
            // A leadership change cancels whatever step is in flight; the
            // next leader resumes from the committed topology.
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = leadership.changed() => {
                    tracing::info!(node = %self.node_id, "leadership changed mid-step");
                }
                result = self.step() => {
                    if let Err(err) = result {
                        tracing::warn!(node = %self.node_id, error = %err, "coordinator step failed");
                        tokio::time::sleep(self.cfg.step_retry).await;
                    }
                }
            }
        }
        tracing::info!(node = %self.node_id, "topology coordinator stopped");
    }

    /// One unit of coordinator work against the current topology snapshot.
    async fn step(&self) -> anyhow::Result<()> {
        let topo = self.sm.topology();

        if let Some(tstate) = topo.tstate {
            return self.advance(&topo, tstate).await;
        }
        if let Some((id, request)) = next_request(&topo.requests) {
            return self.start_request(&topo, id, request).await;
        }
        if let Some(entry) = topo.global_request {
            return self.drive_global(&topo, entry.request).await;
        }
        if !topo.unpublished_cdc_generations.is_empty() {
            return self.publish_cdc_generations(&topo).await;
        }
        let to_enable = topo.not_yet_enabled_features();
        if !to_enable.is_empty() {
            return self.enable_features(&topo, to_enable).await;
        }

        self.sm
            .wait_until(|t| {
                t.is_busy()
                    || !t.requests.is_empty()
                    || !t.unpublished_cdc_generations.is_empty()
                    || !t.not_yet_enabled_features().is_empty()
            })
            .await;
        Ok(())
    }

    /// Begin the highest-priority pending request.
    async fn start_request(
        &self,
        topo: &Topology,
        id: NodeId,
        request: TopologyRequest,
    ) -> anyhow::Result<()> {
        tracing::info!(node = %id, request = %request, "starting topology operation");
        let session = SessionId(Uuid::new_v4());
        match request {
            TopologyRequest::Join => {
                let Some(RequestParam::Join { num_tokens }) = topo.request_param(id) else {
                    anyhow::bail!("join request for node {id} lost its parameters");
                };
                // The submission gate may have raced with feature enabling
                // (a feature turned on between the node registering and its
                // request landing); re-check before the transition opens.
                let missing = unsupported_enabled_features(topo, id);
                if !missing.is_empty() {
                    return self.cancel_request(id, missing).await;
                }
                self.wait_for_ip(topo, id, &BTreeSet::new()).await?;
                let ring = self.tokens.allocate(id, *num_tokens, topo).await?;
                self.append(Command::BeginNodeTransition {
                    id,
                    state: NodeState::Bootstrapping,
                    tstate: TransitionState::JoinGroup0,
                    ring: Some(ring),
                    session,
                })
                .await
            }
            TopologyRequest::Replace => {
                let replaced = Topology::parse_replaced_node(topo.request_param(id))
                    .context("replace request lost its parameters")?;
                let missing = unsupported_enabled_features(topo, id);
                if !missing.is_empty() {
                    return self.cancel_request(id, missing).await;
                }
                let ring = topo
                    .normal_nodes
                    .get(&replaced)
                    .and_then(|rs| rs.ring.clone())
                    .with_context(|| format!("replaced node {replaced} has no ring slice"))?;
                // The dead node and its declared ignore set are not yet in
                // `excluded_nodes()` (the transition has not begun); exclude
                // them from the address fan-out explicitly.
                let mut exclude = Topology::parse_ignored_nodes(topo.request_param(id));
                exclude.insert(replaced);
                self.wait_for_ip(topo, id, &exclude).await?;
                self.append(Command::BeginNodeTransition {
                    id,
                    state: NodeState::Replacing,
                    tstate: TransitionState::JoinGroup0,
                    ring: Some(ring),
                    session,
                })
                .await
            }
            TopologyRequest::Leave => {
                self.append(Command::BeginNodeTransition {
                    id,
                    state: NodeState::Decommissioning,
                    tstate: TransitionState::WriteBothReadOld,
                    ring: None,
                    session,
                })
                .await
            }
            TopologyRequest::Remove => {
                self.append(Command::BeginNodeTransition {
                    id,
                    state: NodeState::Removing,
                    tstate: TransitionState::WriteBothReadOld,
                    ring: None,
                    session,
                })
                .await
            }
            TopologyRequest::Rebuild => {
                self.append(Command::BeginNodeTransition {
                    id,
                    state: NodeState::Rebuilding,
                    tstate: TransitionState::WriteBothReadOld,
                    ring: None,
                    session,
                })
                .await
            }
        }
    }

    /// Resume the in-progress transition at `tstate`.
    async fn advance(&self, topo: &Topology, tstate: TransitionState) -> anyhow::Result<()> {
        let subject = topo
            .transition_nodes
            .iter()
            .next()
            .map(|(id, rs)| (*id, rs.clone()));

        match tstate {
            TransitionState::JoinGroup0 => {
                let (id, _) = subject.context("join_group0 with no transitioning node")?;
                self.log
                    .add_member(id)
                    .await
                    .with_context(|| format!("adding node {id} to the log group"))?;
                let data_uuid = Uuid::new_v4();
                let data = build_cdc_generation(topo);
                self.append(Command::BeginCdcCommit { data_uuid, data }).await
            }

            TransitionState::CommitCdcGeneration => {
                let data_uuid = topo
                    .new_cdc_generation_data_uuid
                    .context("commit_cdc_generation without generation data")?;
                let next_tstate = if subject.is_some() {
                    Some(TransitionState::TabletDraining)
                } else {
                    // Standalone generation turnover requested globally.
                    None
                };
                self.append(Command::CommitCdcGeneration {
                    generation: CdcGenerationId(data_uuid),
                    next_tstate,
                })
                .await
            }

            TransitionState::TabletDraining => {
                self.barrier(topo, TopologyCmdKind::BarrierAndDrain).await?;
                self.append(Command::AdvanceTransition {
                    tstate: TransitionState::WriteBothReadOld,
                })
                .await
            }

            TransitionState::WriteBothReadOld => {
                let (id, rs) = subject.context("write_both_read_old with no transitioning node")?;
                if rs.state == NodeState::RollbackToNormal {
                    return self.append(Command::FinishRollback { id }).await;
                }
                self.barrier(topo, TopologyCmdKind::Barrier).await?;
                match self.stream_ranges(topo, id, &rs).await {
                    Ok(()) => match rs.state {
                        NodeState::Bootstrapping
                        | NodeState::Replacing
                        | NodeState::Decommissioning
                        | NodeState::Removing => {
                            self.append(Command::AdvanceTransition {
                                tstate: TransitionState::WriteBothReadNew,
                            })
                            .await
                        }
                        // Ownership is unchanged; no fencing boundary.
                        NodeState::Rebuilding => self.append(Command::PromoteNode { id }).await,
                        other => anyhow::bail!("node {id} is {other} in write_both_read_old"),
                    },
                    Err(err) => match rs.state {
                        NodeState::Decommissioning
                        | NodeState::Removing
                        | NodeState::Rebuilding => {
                            tracing::warn!(node = %id, error = %err, "streaming failed; rolling back");
                            let error = TopologyError::RolledBack(err.to_string()).to_string();
                            self.append(Command::RollbackNode { id, error }).await
                        }
                        // A joining node has no steady state to return to;
                        // keep retrying while the operation stays valid.
                        _ => Err(err),
                    },
                }
            }

            TransitionState::WriteBothReadNew => {
                let (id, rs) = subject.context("write_both_read_new with no transitioning node")?;
                if rs.state == NodeState::RollbackToNormal {
                    return self.append(Command::FinishRollback { id }).await;
                }
                self.barrier(topo, TopologyCmdKind::Barrier).await?;
                match rs.state {
                    NodeState::Bootstrapping | NodeState::Replacing => {
                        self.append(Command::AdvanceTransition {
                            tstate: TransitionState::TabletMigration,
                        })
                        .await
                    }
                    NodeState::Decommissioning | NodeState::Removing => {
                        self.append(Command::AdvanceTransition {
                            tstate: TransitionState::LeftTokenRing,
                        })
                        .await
                    }
                    other => anyhow::bail!("node {id} is {other} in write_both_read_new"),
                }
            }

            TransitionState::TabletMigration => {
                let (id, rs) = subject.context("tablet_migration with no transitioning node")?;
                while topo.tablet_balancing_enabled && self.tablets.pending_migrations().await > 0
                {
                    tokio::time::sleep(self.cfg.tablet_poll).await;
                }
                if rs.state == NodeState::Replacing {
                    if let Some(replaced) = Topology::parse_replaced_node(topo.request_param(id)) {
                        self.log
                            .remove_member(replaced)
                            .await
                            .with_context(|| format!("removing replaced node {replaced}"))?;
                    }
                }
                self.append(Command::PromoteNode { id }).await
            }

            TransitionState::LeftTokenRing => {
                let (id, _) = subject.context("left_token_ring with no transitioning node")?;
                self.log
                    .remove_member(id)
                    .await
                    .with_context(|| format!("removing node {id} from the log group"))?;
                self.append(Command::RemoveNode { id }).await
            }
        }
    }

    /// Drive a pending global request by one step.
    async fn drive_global(&self, topo: &Topology, request: GlobalRequest) -> anyhow::Result<()> {
        match request {
            GlobalRequest::NewCdcGeneration => {
                let data_uuid = Uuid::new_v4();
                let data = build_cdc_generation(topo);
                self.append(Command::BeginCdcCommit { data_uuid, data }).await
            }
            GlobalRequest::Cleanup => {
                let pending = topo
                    .normal_nodes
                    .iter()
                    .find(|(_, rs)| rs.cleanup != crate::model::CleanupStatus::Clean)
                    .map(|(id, rs)| (*id, rs.cleanup));
                match pending {
                    Some((id, crate::model::CleanupStatus::Needed)) => {
                        self.append(Command::SetCleanupStatus {
                            id,
                            status: crate::model::CleanupStatus::Running,
                        })
                        .await
                    }
                    Some((id, crate::model::CleanupStatus::Running)) => {
                        self.node_cmd(
                            id,
                            TopologyCmdRequest {
                                cmd: TopologyCmdKind::Cleanup,
                                operation_id: topo
                                    .global_request
                                    .map(|e| e.request_id)
                                    .unwrap_or_else(Uuid::nil),
                                topology_version: topo.version,
                            },
                            self.cfg.max_rpc_attempts,
                        )
                        .await?;
                        self.append(Command::SetCleanupStatus {
                            id,
                            status: crate::model::CleanupStatus::Clean,
                        })
                        .await
                    }
                    Some((_, crate::model::CleanupStatus::Clean)) => unreachable!(),
                    None => {
                        self.append(Command::FinishGlobalRequest {
                            error: String::new(),
                        })
                        .await
                    }
                }
            }
        }
    }

    /// Publish committed generations once every normal node has applied the
    /// commit.
    async fn publish_cdc_generations(&self, topo: &Topology) -> anyhow::Result<()> {
        let Some(up_to) = topo.unpublished_cdc_generations.last().copied() else {
            return Ok(());
        };
        self.barrier(topo, TopologyCmdKind::Barrier).await?;
        tracing::info!(generation = %up_to, "publishing cdc generations");
        self.append(Command::PublishCdcGenerations { up_to }).await
    }

    async fn enable_features(
        &self,
        topo: &Topology,
        to_enable: BTreeSet<String>,
    ) -> anyhow::Result<()> {
        let mut features = topo.enabled_features.clone();
        features.extend(to_enable.clone());
        tracing::info!(?to_enable, "enabling cluster features");
        self.append(Command::SetEnabledFeatures { features }).await
    }

    /// Fan a command out to every non-excluded ring participant and wait for
    /// all of them to succeed.
    async fn barrier(&self, topo: &Topology, cmd: TopologyCmdKind) -> anyhow::Result<()> {
        let excluded = topo.excluded_nodes();
        let targets: Vec<NodeId> = topo
            .normal_nodes
            .keys()
            .chain(topo.transition_nodes.keys())
            .copied()
            .filter(|id| !excluded.contains(id))
            .collect();
        let request = TopologyCmdRequest {
            cmd,
            operation_id: Uuid::new_v4(),
            topology_version: topo.version,
        };
        self.fanout(&targets, request).await
    }

    /// Issue `stream_ranges` to the nodes that move data for this operation.
    async fn stream_ranges(
        &self,
        topo: &Topology,
        id: NodeId,
        rs: &ReplicaState,
    ) -> anyhow::Result<()> {
        let excluded = topo.excluded_nodes();
        let targets: Vec<NodeId> = match rs.state {
            // Dead node: the surviving replicas stream its ranges over.
            NodeState::Removing => topo
                .normal_nodes
                .keys()
                .copied()
                .filter(|t| *t != id && !excluded.contains(t))
                .collect(),
            _ => vec![id],
        };
        // Keyed by the driving request so a re-elected coordinator re-issues
        // the same operation and completed targets answer idempotently.
        let request = TopologyCmdRequest {
            cmd: TopologyCmdKind::StreamRanges,
            operation_id: rs.request_id,
            topology_version: topo.version,
        };
        let mut pending = FuturesUnordered::new();
        for target in targets {
            pending
                .push(async move { (target, self.node_cmd(target, request, self.cfg.max_stream_attempts).await) });
        }
        while let Some((target, result)) = pending.next().await {
            result.map_err(|err| {
                anyhow::Error::from(TopologyError::StreamFailed(format!(
                    "node {target}: {err}"
                )))
            })?;
        }
        Ok(())
    }

    /// Block until the joining node's address is resolvable locally, then
    /// make the rest of the ring wait for it too.
    async fn wait_for_ip(
        &self,
        topo: &Topology,
        id: NodeId,
        exclude: &BTreeSet<NodeId>,
    ) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + self.cfg.wait_for_ip_timeout;
        while !self.addr_map.contains(id).await {
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("address of joining node {id} did not appear");
            }
            tokio::time::sleep(self.cfg.wait_for_ip_poll).await;
        }
        let mut excluded = topo.excluded_nodes();
        excluded.extend(exclude.iter().copied());
        let targets: Vec<NodeId> = topo
            .normal_nodes
            .keys()
            .chain(topo.transition_nodes.keys())
            .copied()
            .filter(|t| *t != id && !excluded.contains(t))
            .collect();
        let request = TopologyCmdRequest {
            cmd: TopologyCmdKind::WaitForIp { node: id },
            operation_id: Uuid::new_v4(),
            topology_version: topo.version,
        };
        self.fanout(&targets, request).await
    }

    async fn fanout(&self, targets: &[NodeId], request: TopologyCmdRequest) -> anyhow::Result<()> {
        let mut pending = FuturesUnordered::new();
        for target in targets {
            let target = *target;
            pending.push(async move {
                (
                    target,
                    self.node_cmd(target, request, self.cfg.max_rpc_attempts).await,
                )
            });
        }
        while let Some((target, result)) = pending.next().await {
            result.map_err(|err| {
                anyhow::Error::from(TopologyError::BarrierFailed(format!(
                    "node {target}: {err}"
                )))
            })?;
        }
        Ok(())
    }

    /// One command to one node, retried with jittered exponential backoff.
    async fn node_cmd(
        &self,
        target: NodeId,
        request: TopologyCmdRequest,
        attempts: u32,
    ) -> anyhow::Result<()> {
        let mut delay = self.cfg.retry_base;
        for attempt in 1..=attempts {
            let outcome =
                tokio::time::timeout(self.cfg.rpc_timeout, self.rpc.topology_cmd(target, request))
                    .await;
            let err = match outcome {
                Ok(Ok(result)) => match result.status {
                    CmdStatus::Success => return Ok(()),
                    CmdStatus::Fail { reason } => anyhow::anyhow!(reason),
                },
                Ok(Err(err)) => err,
                Err(_) => anyhow::anyhow!("rpc timed out"),
            };
            if attempt == attempts {
                return Err(err.context(format!("command {:?} to node {target}", request.cmd)));
            }
            tracing::debug!(
                node = %target,
                cmd = ?request.cmd,
                attempt,
                error = %err,
                "topology command failed; backing off"
            );
            let jitter_ms = rand::thread_rng().gen_range(0..=delay.as_millis().max(1) as u64 / 2);
            tokio::time::sleep(delay + Duration::from_millis(jitter_ms)).await;
            delay = (delay * 2).min(self.cfg.retry_cap);
        }
        unreachable!("retry loop returns before exhausting attempts")
    }

    /// Abort a queued join/replace whose node no longer qualifies, recording
    /// the reason in its `topology_requests` row.
    async fn cancel_request(&self, id: NodeId, missing: BTreeSet<String>) -> anyhow::Result<()> {
        let error = TopologyError::InvalidRequest(format!(
            "node does not support enabled features {missing:?}"
        ))
        .to_string();
        tracing::warn!(node = %id, %error, "cancelling topology request");
        self.append(Command::CancelRequest { id, error }).await
    }

    async fn append(&self, command: Command) -> anyhow::Result<()> {
        let bytes = command.encode()?;
        self.log
            .append(bytes)
            .await
            .map(|_| ())
            .map_err(anyhow::Error::from)
    }
}

/// Features enabled cluster-wide that node `id` does not advertise.
fn unsupported_enabled_features(topo: &Topology, id: NodeId) -> BTreeSet<String> {
    match topo.find(id) {
        Some(rs) => topo
            .enabled_features
            .iter()
            .filter(|f| !rs.supported_features.contains(*f))
            .cloned()
            .collect(),
        None => BTreeSet::new(),
    }
}

/// Assemble generation data covering the current (and joining) token
/// ownership. Stream ids are fresh per generation.
fn build_cdc_generation(topo: &Topology) -> CdcGenerationData {
    let mut tokens: BTreeSet<Token> = BTreeSet::new();
    for rs in topo
        .normal_nodes
        .values()
        .chain(topo.transition_nodes.values())
    {
        if let Some(ring) = &rs.ring {
            tokens.extend(ring.tokens.iter().copied());
        }
    }
    CdcGenerationData {
        ranges: tokens
            .into_iter()
            .map(|token| CdcStreamRange {
                token,
                streams: vec![Uuid::new_v4()],
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CleanupStatus, RingSlice};

    fn replica(state: NodeState, tokens: &[i64]) -> ReplicaState {
        ReplicaState {
            state,
            datacenter: "dc1".into(),
            rack: "r1".into(),
            release_version: "1.0.0".into(),
            ring: Some(RingSlice::new(tokens.iter().map(|t| Token(*t)))),
            shard_count: 4,
            ignore_msb: 12,
            supported_features: Default::default(),
            cleanup: CleanupStatus::Clean,
            request_id: Uuid::nil(),
        }
    }

    #[test]
    fn generation_data_covers_all_owned_tokens() {
        let mut topo = Topology::default();
        topo.normal_nodes
            .insert(NodeId(1), replica(NodeState::Normal, &[1, 2]));
        topo.transition_nodes
            .insert(NodeId(2), replica(NodeState::Bootstrapping, &[2, 3]));
        topo.tstate = Some(TransitionState::JoinGroup0);

        let data = build_cdc_generation(&topo);
        let tokens: Vec<i64> = data.ranges.iter().map(|r| r.token.0).collect();
        assert_eq!(tokens, vec![1, 2, 3]);
        assert!(data.ranges.iter().all(|r| !r.streams.is_empty()));
    }
}
