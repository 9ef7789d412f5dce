//! Coordinator RPC surface.
//!
//! The coordinator drives participating nodes with a single command RPC;
//! followers pull table snapshots from the leader after log truncation. The
//! wire codec is out of scope: the client side is the [`CoordinatorRpc`]
//! trait, the server side is [`TopologyRpcHandler`] operating on the local
//! replica.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tessera_log::NodeId;

use crate::applier::TopologyStateMachine;
use crate::collaborators::{AddressMap, CompactionDriver, StreamPlan, Streaming};
use crate::model::NodeState;
use crate::tables::TopologySnapshot;

/// Command kinds the coordinator issues to nodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopologyCmdKind {
    /// Wait until the local applier reaches the carried topology version.
    Barrier,
    /// Barrier, then reject new data-plane work below the fence and wait
    /// for in-flight work to finish.
    BarrierAndDrain,
    /// Stream the ranges implied by the current transition.
    StreamRanges,
    /// Wait until `node` resolves in the address map.
    WaitForIp { node: NodeId },
    /// Run local cleanup compactions.
    Cleanup,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyCmdRequest {
    pub cmd: TopologyCmdKind,
    /// Stable id of the driving operation; targets are idempotent with
    /// respect to `(operation_id, topology_version)`.
    pub operation_id: Uuid,
    pub topology_version: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmdStatus {
    Success,
    Fail { reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyCmdResult {
    pub status: CmdStatus,
}

impl TopologyCmdResult {
    pub fn is_success(&self) -> bool {
        matches!(self.status, CmdStatus::Success)
    }
}

/// Client side of the coordinator RPCs. Implementations route to the target
/// node's [`TopologyRpcHandler`].
#[async_trait]
pub trait CoordinatorRpc: Send + Sync + 'static {
    async fn topology_cmd(
        &self,
        target: NodeId,
        request: TopologyCmdRequest,
    ) -> anyhow::Result<TopologyCmdResult>;

    async fn pull_topology_snapshot(&self, target: NodeId) -> anyhow::Result<TopologySnapshot>;
}

/// Timeouts for node-side command execution.
#[derive(Clone, Copy, Debug)]
pub struct RpcHandlerConfig {
    pub barrier_timeout: Duration,
    pub drain_timeout: Duration,
    pub wait_for_ip_poll: Duration,
    pub wait_for_ip_timeout: Duration,
}

impl Default for RpcHandlerConfig {
    fn default() -> Self {
        Self {
            barrier_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(30),
            wait_for_ip_poll: Duration::from_millis(100),
            wait_for_ip_timeout: Duration::from_secs(30),
        }
    }
}

/// Node-side executor for coordinator commands.
pub struct TopologyRpcHandler {
    node_id: NodeId,
    sm: Arc<TopologyStateMachine>,
    streaming: Arc<dyn Streaming>,
    compaction: Arc<dyn CompactionDriver>,
    addr_map: Arc<dyn AddressMap>,
    cfg: RpcHandlerConfig,
    /// Streaming operations already completed on this node.
    completed_streams: Mutex<HashSet<(Uuid, u64)>>,
}

impl TopologyRpcHandler {
    pub fn new(
        node_id: NodeId,
        sm: Arc<TopologyStateMachine>,
        streaming: Arc<dyn Streaming>,
        compaction: Arc<dyn CompactionDriver>,
        addr_map: Arc<dyn AddressMap>,
        cfg: RpcHandlerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            sm,
            streaming,
            compaction,
            addr_map,
            cfg,
            completed_streams: Mutex::new(HashSet::new()),
        })
    }

    /// Execute one coordinator command. Failures are reported as a typed
    /// `Fail` status; the coordinator retries.
    pub async fn handle(&self, request: TopologyCmdRequest) -> TopologyCmdResult {
        let status = match self.execute(&request).await {
            Ok(()) => CmdStatus::Success,
            Err(err) => {
                tracing::warn!(
                    node = %self.node_id,
                    cmd = ?request.cmd,
                    version = request.topology_version,
                    error = %err,
                    "topology command failed"
                );
                CmdStatus::Fail {
                    reason: err.to_string(),
                }
            }
        };
        TopologyCmdResult { status }
    }

    /// Serve the three-table snapshot bundle to a catching-up follower.
    pub fn pull_topology_snapshot(&self) -> anyhow::Result<TopologySnapshot> {
        self.sm.snapshot()
    }

    async fn execute(&self, request: &TopologyCmdRequest) -> anyhow::Result<()> {
        match request.cmd {
            TopologyCmdKind::Barrier => {
                self.sm
                    .wait_for_version(request.topology_version, self.cfg.barrier_timeout)
                    .await?;
                Ok(())
            }
            TopologyCmdKind::BarrierAndDrain => {
                self.sm
                    .wait_for_version(request.topology_version, self.cfg.barrier_timeout)
                    .await?;
                self.sm.fencing().drain(self.cfg.drain_timeout).await?;
                Ok(())
            }
            TopologyCmdKind::StreamRanges => {
                self.stream_ranges(request).await
            }
            TopologyCmdKind::WaitForIp { node } => self.wait_for_ip(node).await,
            TopologyCmdKind::Cleanup => {
                let session = self.sm.topology().session;
                self.compaction.cleanup(session).await
            }
        }
    }

    async fn stream_ranges(&self, request: &TopologyCmdRequest) -> anyhow::Result<()> {
        // The streaming plan is derived from the topology at the carried
        // version, so catch up first.
        self.sm
            .wait_for_version(request.topology_version, self.cfg.barrier_timeout)
            .await?;

        let key = (request.operation_id, request.topology_version);
        if self.completed_streams.lock().unwrap().contains(&key) {
            return Ok(());
        }

        let topo = self.sm.topology();
        let (subject, rs) = topo
            .transition_nodes
            .iter()
            .next()
            .map(|(id, rs)| (*id, rs.clone()))
            .ok_or_else(|| anyhow::anyhow!("stream_ranges with no transitioning node"))?;
        let source_dc = match topo.request_param(subject) {
            Some(crate::requests::RequestParam::Rebuild { source_dc }) => {
                Some(source_dc.clone())
            }
            _ => None,
        };
        let plan = StreamPlan {
            subject,
            state: rs.state,
            source_dc,
            exclude: topo.excluded_nodes(),
            session: topo.session,
        };
        if !matches!(
            plan.state,
            NodeState::Bootstrapping
                | NodeState::Replacing
                | NodeState::Decommissioning
                | NodeState::Removing
                | NodeState::Rebuilding
        ) {
            anyhow::bail!("node {subject} is {} and has nothing to stream", plan.state);
        }

        tracing::info!(
            node = %self.node_id,
            subject = %plan.subject,
            state = %plan.state,
            session = %plan.session,
            "streaming ranges"
        );
        self.streaming.stream(plan).await?;
        self.completed_streams.lock().unwrap().insert(key);
        Ok(())
    }

    async fn wait_for_ip(&self, node: NodeId) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + self.cfg.wait_for_ip_timeout;
        while !self.addr_map.contains(node).await {
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("address of node {node} did not appear");
            }
            tokio::time::sleep(self.cfg.wait_for_ip_poll).await;
        }
        Ok(())
    }
}
