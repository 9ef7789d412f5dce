//! Cluster topology control plane for the tessera wide-column store.
//!
//! The authoritative, consensus-replicated model of which nodes exist, what
//! role each plays in the ring, what token ranges they own, and which
//! cluster-wide reconfiguration is in progress. All membership changes
//! (join/leave/replace/remove/rebuild) and global reconfigurations (CDC
//! generation turnover, cluster-wide cleanup) funnel through one state
//! machine and are driven by a single elected coordinator.
//!
//! Components:
//! - [`model`]: the replicated topology data structure and its queries
//! - [`command`] + [`applier`]: committed log entries and their
//!   deterministic application
//! - [`fencing`]: per-node version gate rejecting stale data-plane requests
//! - [`requests`]: replicated request queue and prioritizer
//! - [`coordinator`]: the leader-only transition driver
//! - [`rpc`]: commands the coordinator issues to nodes, and snapshot pull
//! - [`readiness`]: gossip adapter for the node's "ready to serve" bit
//! - [`tables`]: the three persisted system tables
//! - [`collaborators`]: interfaces to gossip, streaming and friends

pub mod applier;
pub mod collaborators;
pub mod command;
pub mod coordinator;
pub mod error;
pub mod fencing;
pub mod model;
pub mod readiness;
pub mod requests;
pub mod rpc;
pub mod tables;

pub use applier::TopologyStateMachine;
pub use coordinator::{Coordinator, CoordinatorConfig};
pub use error::TopologyError;
pub use fencing::{FencingRegistry, FencingToken};
pub use model::{NodeState, ReplicaState, Topology, TransitionState};
pub use requests::{GlobalRequest, RequestParam, RequestQueue, TopologyRequest};
pub use rpc::{CoordinatorRpc, TopologyRpcHandler};
pub use tables::SystemTables;
