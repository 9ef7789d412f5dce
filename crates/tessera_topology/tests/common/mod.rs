//! Shared helpers for integration tests.
//!
//! Builds an in-process cluster: every replica has its own system tables,
//! state machine, RPC handler and coordinator, all sharing one `LocalLog`.
//! Collaborators are recording stubs with injectable failure behavior.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tempfile::TempDir;

use uuid::Uuid;

use tessera_log::{GroupLog, LocalLog, NodeId};
use tessera_topology::applier::TopologyStateMachine;
use tessera_topology::collaborators::{
    AddressMap, CompactionDriver, Gossip, StreamPlan, Streaming, TabletOps, TokenAllocator,
};
use tessera_topology::command::{CdcGenerationData, Command};
use tessera_topology::coordinator::{Coordinator, CoordinatorConfig};
use tessera_topology::model::{
    CdcGenerationId, NodeProperties, NodeState, RingSlice, SessionId, Token, Topology,
    TransitionState,
};
use tessera_topology::requests::{RequestParam, RequestQueue, TopologyRequest};
use tessera_topology::rpc::{
    CoordinatorRpc, RpcHandlerConfig, TopologyCmdKind, TopologyCmdRequest, TopologyCmdResult,
    TopologyRpcHandler,
};
use tessera_topology::tables::{SystemTables, TopologySnapshot};

/// Timeout for any single wait in a test.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// In-process RPC fabric routing coordinator commands to node handlers.
pub struct RpcHub {
    handlers: RwLock<HashMap<NodeId, Arc<TopologyRpcHandler>>>,
    down: RwLock<BTreeSet<NodeId>>,
    calls: Mutex<Vec<(NodeId, TopologyCmdKind)>>,
}

impl RpcHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handlers: RwLock::new(HashMap::new()),
            down: RwLock::new(BTreeSet::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn register(&self, id: NodeId, handler: Arc<TopologyRpcHandler>) {
        self.handlers.write().unwrap().insert(id, handler);
    }

    /// Make RPCs to `id` fail, as if the node were dead.
    pub fn set_down(&self, id: NodeId, down: bool) {
        let mut set = self.down.write().unwrap();
        if down {
            set.insert(id);
        } else {
            set.remove(&id);
        }
    }

    pub fn calls(&self) -> Vec<(NodeId, TopologyCmdKind)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl CoordinatorRpc for RpcHub {
    async fn topology_cmd(
        &self,
        target: NodeId,
        request: TopologyCmdRequest,
    ) -> anyhow::Result<TopologyCmdResult> {
        self.calls.lock().unwrap().push((target, request.cmd));
        if self.down.read().unwrap().contains(&target) {
            anyhow::bail!("node {target} is unreachable");
        }
        let handler = self
            .handlers
            .read()
            .unwrap()
            .get(&target)
            .cloned()
            .with_context(|| format!("no handler registered for node {target}"))?;
        Ok(handler.handle(request).await)
    }

    async fn pull_topology_snapshot(&self, target: NodeId) -> anyhow::Result<TopologySnapshot> {
        let handler = self
            .handlers
            .read()
            .unwrap()
            .get(&target)
            .cloned()
            .with_context(|| format!("no handler registered for node {target}"))?;
        handler.pull_topology_snapshot()
    }
}

/// How a stubbed stream attempt behaves for a given subject node.
#[derive(Clone, Copy, Debug)]
pub enum StreamBehavior {
    Succeed,
    Fail,
    Hang,
}

pub struct StubStreaming {
    plans: Mutex<Vec<StreamPlan>>,
    behavior: Mutex<HashMap<NodeId, StreamBehavior>>,
}

impl StubStreaming {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            plans: Mutex::new(Vec::new()),
            behavior: Mutex::new(HashMap::new()),
        })
    }

    pub fn set_behavior(&self, subject: NodeId, behavior: StreamBehavior) {
        self.behavior.lock().unwrap().insert(subject, behavior);
    }

    pub fn plans(&self) -> Vec<StreamPlan> {
        self.plans.lock().unwrap().clone()
    }

    pub fn attempts_for(&self, subject: NodeId) -> usize {
        self.plans
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.subject == subject)
            .count()
    }
}

#[async_trait]
impl Streaming for StubStreaming {
    async fn stream(&self, plan: StreamPlan) -> anyhow::Result<()> {
        let behavior = self
            .behavior
            .lock()
            .unwrap()
            .get(&plan.subject)
            .copied()
            .unwrap_or(StreamBehavior::Succeed);
        self.plans.lock().unwrap().push(plan);
        match behavior {
            StreamBehavior::Succeed => Ok(()),
            StreamBehavior::Fail => anyhow::bail!("injected stream failure"),
            StreamBehavior::Hang => {
                futures_util::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}

struct StubCompaction {
    node: NodeId,
    log: Arc<Mutex<Vec<NodeId>>>,
}

#[async_trait]
impl CompactionDriver for StubCompaction {
    async fn cleanup(&self, _session: SessionId) -> anyhow::Result<()> {
        self.log.lock().unwrap().push(self.node);
        Ok(())
    }
}

struct StubAddressMap;

#[async_trait]
impl AddressMap for StubAddressMap {
    async fn contains(&self, _id: NodeId) -> bool {
        true
    }
}

/// Deterministic token assignment: node n owns n*1000, n*1000+1, ...
struct StubTokens;

#[async_trait]
impl TokenAllocator for StubTokens {
    async fn allocate(
        &self,
        node: NodeId,
        num_tokens: u32,
        _topo: &Topology,
    ) -> anyhow::Result<RingSlice> {
        Ok(RingSlice::new(
            (0..num_tokens).map(|i| Token(node.0 as i64 * 1_000 + i as i64)),
        ))
    }
}

struct StubTablets;

#[async_trait]
impl TabletOps for StubTablets {
    async fn pending_migrations(&self) -> usize {
        0
    }
}

pub struct StubGossip {
    pub states: Mutex<Vec<(String, String)>>,
}

impl StubGossip {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            states: Mutex::new(Vec::new()),
        })
    }

    pub fn last_state(&self, key: &str) -> Option<String> {
        self.states
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }
}

#[async_trait]
impl Gossip for StubGossip {
    async fn set_application_state(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.states
            .lock()
            .unwrap()
            .push((key.to_string(), value.to_string()));
        Ok(())
    }

    async fn address_of(&self, _id: NodeId) -> Option<IpAddr> {
        Some(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }
}

pub struct Replica {
    pub id: NodeId,
    pub sm: Arc<TopologyStateMachine>,
    pub handler: Arc<TopologyRpcHandler>,
    pub coordinator: Arc<Coordinator>,
    pub queue: RequestQueue,
    _data: TempDir,
}

pub struct TestCluster {
    pub log: LocalLog,
    pub hub: Arc<RpcHub>,
    pub streaming: Arc<StubStreaming>,
    pub cleanup_log: Arc<Mutex<Vec<NodeId>>>,
    pub replicas: BTreeMap<NodeId, Replica>,
    cfg: CoordinatorConfig,
}

pub fn fast_config() -> CoordinatorConfig {
    CoordinatorConfig {
        rpc_timeout: Duration::from_secs(5),
        retry_base: Duration::from_millis(5),
        retry_cap: Duration::from_millis(50),
        max_rpc_attempts: 5,
        max_stream_attempts: 2,
        wait_for_ip_timeout: Duration::from_secs(2),
        wait_for_ip_poll: Duration::from_millis(10),
        tablet_poll: Duration::from_millis(10),
        step_retry: Duration::from_millis(10),
    }
}

pub fn props(features: &[&str]) -> NodeProperties {
    NodeProperties {
        datacenter: "dc1".into(),
        rack: "r1".into(),
        release_version: "1.0.0".into(),
        shard_count: 8,
        ignore_msb: 12,
        supported_features: features.iter().map(|s| s.to_string()).collect(),
    }
}

/// Opt-in test logging: set `RUST_LOG` (e.g. `RUST_LOG=tessera_topology=debug`)
/// to see coordinator and applier traces.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

impl TestCluster {
    pub fn new() -> Self {
        init_tracing();
        Self {
            log: LocalLog::new(),
            hub: RpcHub::new(),
            streaming: StubStreaming::new(),
            cleanup_log: Arc::new(Mutex::new(Vec::new())),
            replicas: BTreeMap::new(),
            cfg: fast_config(),
        }
    }

    /// Create a replica process for `id`: tables, state machine, handler and
    /// a (started) coordinator, all wired to the shared log and hub.
    pub fn add_replica(&mut self, id: NodeId) -> &Replica {
        let data = tempfile::tempdir().expect("tempdir");
        let tables = SystemTables::open(data.path()).expect("open tables");
        let sm = TopologyStateMachine::new(tables).expect("state machine");
        // First boot into an existing cluster: install the leader's snapshot
        // before subscribing for new entries (the cluster is quiescent when
        // tests add replicas).
        if let Some(leader) = self.log.leader() {
            if let Some(leader_replica) = self.replicas.get(&leader) {
                let snapshot = leader_replica.sm.snapshot().expect("leader snapshot");
                sm.install_snapshot(&snapshot).expect("install snapshot");
            }
        }
        let log: Arc<dyn GroupLog> = Arc::new(self.log.handle(id));
        log.subscribe(sm.clone());

        let handler = TopologyRpcHandler::new(
            id,
            sm.clone(),
            self.streaming.clone(),
            Arc::new(StubCompaction {
                node: id,
                log: self.cleanup_log.clone(),
            }),
            Arc::new(StubAddressMap),
            RpcHandlerConfig {
                barrier_timeout: Duration::from_secs(5),
                drain_timeout: Duration::from_secs(5),
                wait_for_ip_poll: Duration::from_millis(10),
                wait_for_ip_timeout: Duration::from_secs(2),
            },
        );
        self.hub.register(id, handler.clone());

        let coordinator = Coordinator::new(
            id,
            log.clone(),
            sm.clone(),
            self.hub.clone(),
            Arc::new(StubTokens),
            Arc::new(StubAddressMap),
            Arc::new(StubTablets),
            self.cfg,
        );
        coordinator.start().expect("start coordinator");

        let queue = RequestQueue::new(log, sm.clone());
        self.replicas.insert(
            id,
            Replica {
                id,
                sm,
                handler,
                coordinator,
                queue,
                _data: data,
            },
        );
        &self.replicas[&id]
    }

    /// A cluster with replicas for the given ids, the first one leader.
    pub fn with_replicas(ids: &[u64]) -> Self {
        let mut cluster = Self::new();
        for id in ids {
            cluster.add_replica(NodeId(*id));
        }
        cluster.log.set_leader(Some(NodeId(ids[0])));
        cluster
    }

    pub fn replica(&self, id: u64) -> &Replica {
        &self.replicas[&NodeId(id)]
    }

    /// The request queue bound to the current leader replica.
    pub fn leader_queue(&self) -> &RequestQueue {
        let leader = self.log.leader().expect("no leader elected");
        &self.replicas[&leader].queue
    }

    /// Wait until the leader's applied topology satisfies `cond`.
    pub async fn wait_topology<F>(&self, cond: F) -> Arc<Topology>
    where
        F: Fn(&Topology) -> bool,
    {
        let leader = self.log.leader().expect("no leader elected");
        let sm = &self.replicas[&leader].sm;
        tokio::time::timeout(WAIT_TIMEOUT, sm.wait_until(cond))
            .await
            .expect("timed out waiting for topology condition")
    }

    /// Submit joins for `ids` and wait until all are normal members.
    pub async fn join_all(&self, ids: &[u64], num_tokens: u32, features: &[&str]) {
        for id in ids {
            self.leader_queue()
                .request_join(NodeId(*id), props(features), num_tokens)
                .await
                .expect("queue join");
        }
        let want: BTreeSet<NodeId> = ids.iter().map(|id| NodeId(*id)).collect();
        self.wait_topology(|t| {
            want.iter().all(|id| t.normal_nodes.contains_key(id)) && !t.is_busy()
        })
        .await;
    }

    /// Decoded committed commands, in commit order.
    pub fn commands(&self) -> Vec<Command> {
        self.log
            .entries()
            .iter()
            .map(|bytes| Command::decode(bytes).expect("decode committed command"))
            .collect()
    }

    /// Poll until the committed command stream satisfies `cond`.
    pub async fn wait_commands<F>(&self, cond: F) -> Vec<Command>
    where
        F: Fn(&[Command]) -> bool,
    {
        wait_until(|| {
            let cmds = self.commands();
            cond(&cmds)
        })
        .await;
        self.commands()
    }
}

/// Raw command sequence driving `id` through a complete join. Used by tests
/// that stage topology states directly, without a running coordinator.
pub fn join_commands(id: NodeId, features: &[&str], tokens: &[i64]) -> Vec<Command> {
    let data_uuid = Uuid::new_v4();
    vec![
        Command::AddNode {
            id,
            props: props(features),
        },
        Command::SetRequest {
            id,
            request: TopologyRequest::Join,
            param: RequestParam::Join {
                num_tokens: tokens.len() as u32,
            },
            request_id: Uuid::new_v4(),
        },
        Command::BeginNodeTransition {
            id,
            state: NodeState::Bootstrapping,
            tstate: TransitionState::JoinGroup0,
            ring: Some(RingSlice::new(tokens.iter().map(|t| Token(*t)))),
            session: SessionId(Uuid::new_v4()),
        },
        Command::BeginCdcCommit {
            data_uuid,
            data: CdcGenerationData::default(),
        },
        Command::CommitCdcGeneration {
            generation: CdcGenerationId(data_uuid),
            next_tstate: Some(TransitionState::TabletDraining),
        },
        Command::AdvanceTransition {
            tstate: TransitionState::WriteBothReadOld,
        },
        Command::AdvanceTransition {
            tstate: TransitionState::WriteBothReadNew,
        },
        Command::AdvanceTransition {
            tstate: TransitionState::TabletMigration,
        },
        Command::PromoteNode { id },
    ]
}

/// Poll `cond` every few milliseconds until it holds or the wait times out.
pub async fn wait_until<F>(cond: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while !cond() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for test condition");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
