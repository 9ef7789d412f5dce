//! Global requests: cluster-wide cleanup and standalone CDC generation
//! turnover, plus queue admission rules.

mod common;

use common::*;
use tessera_log::NodeId;
use tessera_topology::command::Command;
use tessera_topology::error::TopologyError;
use tessera_topology::model::CleanupStatus;
use tessera_topology::requests::GlobalRequest;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cleanup_cycles_every_node_to_clean() {
    let cluster = TestCluster::with_replicas(&[1, 2, 3]);
    cluster.join_all(&[1, 2, 3], 8, &["base"]).await;

    let request_id = cluster
        .leader_queue()
        .request_global(GlobalRequest::Cleanup)
        .await
        .expect("queue cleanup");

    wait_until(|| {
        cluster
            .replica(1)
            .sm
            .tables()
            .request_row(request_id)
            .unwrap()
            .is_some_and(|row| row.done)
    })
    .await;

    let topo = cluster
        .wait_topology(|t| t.global_request.is_none() && !t.is_busy())
        .await;
    assert!(topo
        .normal_nodes
        .values()
        .all(|rs| rs.cleanup == CleanupStatus::Clean));

    // Each node ran exactly one local cleanup.
    let mut cleaned = cluster.cleanup_log.lock().unwrap().clone();
    cleaned.sort();
    assert_eq!(cleaned, vec![NodeId(1), NodeId(2), NodeId(3)]);

    // Per node the status cycled needed -> running -> clean.
    let cmds = cluster.commands();
    for id in [1u64, 2, 3] {
        let running = cmds.iter().position(|cmd| {
            matches!(cmd, Command::SetCleanupStatus { id: n, status: CleanupStatus::Running } if *n == NodeId(id))
        });
        let clean = cmds.iter().position(|cmd| {
            matches!(cmd, Command::SetCleanupStatus { id: n, status: CleanupStatus::Clean } if *n == NodeId(id))
        });
        assert!(running.is_some() && clean.is_some());
        assert!(running < clean);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cdc_generation_turnover_commits_and_publishes() {
    let cluster = TestCluster::with_replicas(&[1, 2]);
    cluster.join_all(&[1, 2], 8, &["base"]).await;
    let before = cluster
        .wait_topology(|t| !t.is_busy() && t.unpublished_cdc_generations.is_empty())
        .await;
    let generation_before = before.current_cdc_generation_id;

    let request_id = cluster
        .leader_queue()
        .request_global(GlobalRequest::NewCdcGeneration)
        .await
        .expect("queue cdc turnover");

    let topo = cluster
        .wait_topology(|t| {
            t.current_cdc_generation_id != generation_before
                && t.unpublished_cdc_generations.is_empty()
                && t.global_request.is_none()
        })
        .await;
    assert_eq!(topo.tstate, None);

    wait_until(|| {
        cluster
            .replica(1)
            .sm
            .tables()
            .request_row(request_id)
            .unwrap()
            .is_some_and(|row| row.done && row.error.is_empty())
    })
    .await;

    // Generation data rows exist under the committed generation id.
    let generation = topo.current_cdc_generation_id.unwrap();
    let rows = cluster
        .replica(2)
        .sm
        .tables()
        .cdc_generation_rows(generation.0)
        .unwrap();
    assert!(!rows.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn admin_entries_rotate_session_and_toggle_balancing() {
    let cluster = TestCluster::with_replicas(&[1]);
    cluster.join_all(&[1], 4, &[]).await;

    let queue = cluster.leader_queue();
    let session_before = queue.state_machine().topology().session;
    let session = queue.rotate_session().await.expect("rotate session");
    assert_ne!(session, session_before);

    queue
        .set_tablet_balancing(false)
        .await
        .expect("disable balancing");
    let topo = cluster
        .wait_topology(|t| !t.tablet_balancing_enabled && t.session == session)
        .await;
    assert_eq!(topo.session, session);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn queue_rejects_conflicting_requests() {
    let cluster = TestCluster::with_replicas(&[1, 2, 3]);
    cluster.join_all(&[1, 2, 3], 8, &["base"]).await;
    cluster.wait_topology(|t| !t.is_busy()).await;

    // Freeze processing so the queue state is deterministic.
    cluster.replica(1).coordinator.stop().await.unwrap();

    let queue = cluster.leader_queue();
    queue
        .request_global(GlobalRequest::Cleanup)
        .await
        .expect("first global request");
    assert_eq!(
        queue
            .request_global(GlobalRequest::NewCdcGeneration)
            .await
            .unwrap_err(),
        TopologyError::Busy
    );

    queue.request_leave(NodeId(3)).await.expect("queue leave");
    assert_eq!(
        queue.request_leave(NodeId(3)).await.unwrap_err(),
        TopologyError::Busy
    );
    assert!(matches!(
        queue.request_leave(NodeId(9)).await.unwrap_err(),
        TopologyError::InvalidRequest(_)
    ));

    // Resume; the per-node request runs before the global one, then both
    // settle.
    cluster.replica(1).coordinator.start().unwrap();
    let topo = cluster
        .wait_topology(|t| {
            t.left_nodes.contains(&NodeId(3)) && t.global_request.is_none() && !t.is_busy()
        })
        .await;
    assert!(topo
        .normal_nodes
        .values()
        .all(|rs| rs.cleanup == CleanupStatus::Clean));
}
