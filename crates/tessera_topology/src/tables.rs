//! Persisted topology state: the `topology`, `cdc_generations` and
//! `topology_requests` system tables.
//!
//! The tables are fjall partitions written exclusively from mutation batches
//! emitted by the applier, so their contents are a deterministic function of
//! the committed log. Snapshot/install round-trips the raw rows for follower
//! catch-up after log truncation.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::Context;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tessera_log::NodeId;

use crate::model::{
    CdcGenerationId, GlobalRequestEntry, ReplicaState, SessionId, Topology, TransitionState,
};
use crate::requests::{RequestParam, TopologyRequest};

const META_KEY: &[u8] = b"m:singleton";
const NODE_PREFIX: &[u8] = b"n:";

/// Which collection a persisted node row belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeCollection {
    Normal,
    New,
    Transition,
    Left,
}

/// One row of the `topology` table for a node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRow {
    pub collection: NodeCollection,
    /// Dropped once the node is `Left`; only the id remains.
    pub replica: Option<ReplicaState>,
    pub request: Option<TopologyRequest>,
    pub param: Option<RequestParam>,
}

/// The singleton row of the `topology` table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaRow {
    pub tstate: Option<TransitionState>,
    pub version: u64,
    pub fence_version: u64,
    pub global_request: Option<GlobalRequestEntry>,
    pub current_cdc_generation_id: Option<CdcGenerationId>,
    pub new_cdc_generation_data_uuid: Option<Uuid>,
    pub unpublished_cdc_generations: Vec<CdcGenerationId>,
    pub enabled_features: BTreeSet<String>,
    pub session: SessionId,
    pub tablet_balancing_enabled: bool,
}

impl MetaRow {
    pub fn from_topology(topo: &Topology) -> Self {
        Self {
            tstate: topo.tstate,
            version: topo.version,
            fence_version: topo.fence_version,
            global_request: topo.global_request,
            current_cdc_generation_id: topo.current_cdc_generation_id,
            new_cdc_generation_data_uuid: topo.new_cdc_generation_data_uuid,
            unpublished_cdc_generations: topo.unpublished_cdc_generations.clone(),
            enabled_features: topo.enabled_features.clone(),
            session: topo.session,
            tablet_balancing_enabled: topo.tablet_balancing_enabled,
        }
    }
}

/// One row of the `topology_requests` table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRow {
    pub kind: String,
    pub done: bool,
    pub error: String,
}

/// A canonical mutation against one of the three tables.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
    PutMeta(MetaRow),
    PutNode { id: NodeId, row: NodeRow },
    PutCdcRange {
        generation: Uuid,
        range_index: u32,
        payload: Vec<u8>,
    },
    OpenRequest { request_id: Uuid, kind: String },
    CloseRequest { request_id: Uuid, error: String },
}

/// Raw-row bundle for the three tables, pulled by followers after log
/// truncation or first boot.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologySnapshot {
    pub applied_index: u64,
    pub topology_rows: Vec<(Vec<u8>, Vec<u8>)>,
    pub cdc_generation_rows: Vec<(Vec<u8>, Vec<u8>)>,
    pub topology_request_rows: Vec<(Vec<u8>, Vec<u8>)>,
}

fn node_key(id: NodeId) -> Vec<u8> {
    let mut key = NODE_PREFIX.to_vec();
    key.extend_from_slice(&id.0.to_be_bytes());
    key
}

fn cdc_key(generation: Uuid, range_index: u32) -> Vec<u8> {
    let mut key = generation.as_bytes().to_vec();
    key.extend_from_slice(&range_index.to_be_bytes());
    key
}

/// The three system tables over one fjall keyspace.
#[derive(Clone)]
pub struct SystemTables {
    _keyspace: Keyspace,
    topology: PartitionHandle,
    cdc_generations: PartitionHandle,
    requests: PartitionHandle,
}

impl SystemTables {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let keyspace = fjall::Config::new(path.as_ref())
            .open()
            .context("open system keyspace")?;
        Self::with_keyspace(keyspace)
    }

    pub fn with_keyspace(keyspace: Keyspace) -> anyhow::Result<Self> {
        let opts = PartitionCreateOptions::default;
        Ok(Self {
            topology: keyspace.open_partition("topology", opts())?,
            cdc_generations: keyspace.open_partition("cdc_generations", opts())?,
            requests: keyspace.open_partition("topology_requests", opts())?,
            _keyspace: keyspace,
        })
    }

    /// Apply one batch of applier-emitted mutations.
    pub fn apply(&self, mutations: &[Mutation]) -> anyhow::Result<()> {
        for mutation in mutations {
            match mutation {
                Mutation::PutMeta(row) => {
                    self.topology
                        .insert(META_KEY, serde_json::to_vec(row)?)
                        .context("write topology meta row")?;
                }
                Mutation::PutNode { id, row } => {
                    self.topology
                        .insert(node_key(*id), serde_json::to_vec(row)?)
                        .with_context(|| format!("write topology row for node {id}"))?;
                }
                Mutation::PutCdcRange {
                    generation,
                    range_index,
                    payload,
                } => {
                    self.cdc_generations
                        .insert(cdc_key(*generation, *range_index), payload.clone())
                        .context("write cdc generation row")?;
                }
                Mutation::OpenRequest { request_id, kind } => {
                    let row = RequestRow {
                        kind: kind.clone(),
                        done: false,
                        error: String::new(),
                    };
                    self.requests
                        .insert(request_id.as_bytes().as_slice(), serde_json::to_vec(&row)?)
                        .context("write topology_requests row")?;
                }
                Mutation::CloseRequest { request_id, error } => {
                    let mut row = self
                        .request_row(*request_id)?
                        .with_context(|| format!("closing unknown request {request_id}"))?;
                    row.done = true;
                    row.error = error.clone();
                    self.requests
                        .insert(request_id.as_bytes().as_slice(), serde_json::to_vec(&row)?)
                        .context("close topology_requests row")?;
                }
            }
        }
        Ok(())
    }

    pub fn request_row(&self, request_id: Uuid) -> anyhow::Result<Option<RequestRow>> {
        match self.requests.get(request_id.as_bytes().as_slice())? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    /// Raw rows of the `cdc_generations` table for one generation.
    pub fn cdc_generation_rows(&self, generation: Uuid) -> anyhow::Result<Vec<Vec<u8>>> {
        let mut rows = Vec::new();
        for item in self.cdc_generations.prefix(generation.as_bytes().to_vec()) {
            let (_, value) = item?;
            rows.push(value.to_vec());
        }
        Ok(rows)
    }

    pub fn snapshot(&self, applied_index: u64) -> anyhow::Result<TopologySnapshot> {
        Ok(TopologySnapshot {
            applied_index,
            topology_rows: dump(&self.topology)?,
            cdc_generation_rows: dump(&self.cdc_generations)?,
            topology_request_rows: dump(&self.requests)?,
        })
    }

    /// Replace table contents with a snapshot bundle.
    pub fn install(&self, snapshot: &TopologySnapshot) -> anyhow::Result<()> {
        restore(&self.topology, &snapshot.topology_rows)?;
        restore(&self.cdc_generations, &snapshot.cdc_generation_rows)?;
        restore(&self.requests, &snapshot.topology_request_rows)?;
        Ok(())
    }

    /// Rebuild the in-memory topology from persisted rows. `None` when the
    /// tables have never been written.
    pub fn load_topology(&self) -> anyhow::Result<Option<Topology>> {
        let Some(meta_bytes) = self.topology.get(META_KEY)? else {
            return Ok(None);
        };
        let meta: MetaRow = serde_json::from_slice(&meta_bytes)?;
        let mut topo = Topology {
            tstate: meta.tstate,
            version: meta.version,
            fence_version: meta.fence_version,
            global_request: meta.global_request,
            current_cdc_generation_id: meta.current_cdc_generation_id,
            new_cdc_generation_data_uuid: meta.new_cdc_generation_data_uuid,
            unpublished_cdc_generations: meta.unpublished_cdc_generations,
            enabled_features: meta.enabled_features,
            session: meta.session,
            tablet_balancing_enabled: meta.tablet_balancing_enabled,
            ..Topology::default()
        };

        for item in self.topology.prefix(NODE_PREFIX.to_vec()) {
            let (key, value) = item?;
            let raw: [u8; 8] = key[NODE_PREFIX.len()..]
                .try_into()
                .context("malformed node row key")?;
            let id = NodeId(u64::from_be_bytes(raw));
            let row: NodeRow = serde_json::from_slice(&value)?;
            if let Some(request) = row.request {
                topo.requests.insert(id, request);
            }
            if let Some(param) = row.param {
                topo.req_param.insert(id, param);
            }
            match row.collection {
                NodeCollection::Left => {
                    topo.left_nodes.insert(id);
                }
                collection => {
                    let replica = row
                        .replica
                        .with_context(|| format!("node {id} row is missing its replica state"))?;
                    let target = match collection {
                        NodeCollection::Normal => &mut topo.normal_nodes,
                        NodeCollection::New => &mut topo.new_nodes,
                        NodeCollection::Transition => &mut topo.transition_nodes,
                        NodeCollection::Left => unreachable!(),
                    };
                    target.insert(id, replica);
                }
            }
        }
        Ok(Some(topo))
    }
}

fn dump(partition: &PartitionHandle) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut rows = Vec::new();
    for item in partition.iter() {
        let (key, value) = item?;
        rows.push((key.to_vec(), value.to_vec()));
    }
    Ok(rows)
}

fn restore(partition: &PartitionHandle, rows: &[(Vec<u8>, Vec<u8>)]) -> anyhow::Result<()> {
    let existing: Vec<Vec<u8>> = partition
        .iter()
        .map(|item| item.map(|(key, _)| key.to_vec()))
        .collect::<Result<_, _>>()?;
    for key in existing {
        partition.remove(key)?;
    }
    for (key, value) in rows {
        partition.insert(key.clone(), value.clone())?;
    }
    Ok(())
}
