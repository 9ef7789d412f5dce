//! Readiness publisher.
//!
//! Once the local node is a normal ring member it may accept client
//! connections; that single bit travels out of band through gossip so
//! connection pools can start (or stop) directing traffic here.

use std::sync::Arc;

use tokio::task::JoinHandle;

use tessera_log::NodeId;

use crate::applier::TopologyStateMachine;
use crate::collaborators::Gossip;

/// Gossip application-state key carrying the ready bit.
pub const CQL_READY_KEY: &str = "cql_ready";

/// Watch the applied topology and mirror the local node's membership into
/// gossip. Returns the watcher task; abort it on shutdown.
pub fn spawn(
    node_id: NodeId,
    sm: Arc<TopologyStateMachine>,
    gossip: Arc<dyn Gossip>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut published: Option<bool> = None;
        loop {
            let topo = match published {
                // First pass publishes unconditionally.
                None => sm.topology(),
                Some(ready) => {
                    sm.wait_until(|t| t.normal_nodes.contains_key(&node_id) != ready)
                        .await
                }
            };
            let ready = topo.normal_nodes.contains_key(&node_id);
            let value = if ready { "true" } else { "false" };
            if let Err(err) = gossip.set_application_state(CQL_READY_KEY, value).await {
                tracing::warn!(node = %node_id, error = %err, "failed to publish readiness");
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                continue;
            }
            tracing::info!(node = %node_id, ready, "published readiness");
            published = Some(ready);
        }
    })
}
