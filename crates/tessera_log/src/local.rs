//! Single-process implementation of [`GroupLog`].
//!
//! Commit equals append under one mutex, and committed entries fan out to
//! every subscriber before the append resolves, so the log is trivially
//! linearizable. Replica handles share one `LocalLog`; tests drive
//! leadership explicitly.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::{GroupLog, LogApplier, LogError, NodeId};

#[derive(Default)]
struct LogState {
    entries: Vec<Vec<u8>>,
    subscribers: Vec<Arc<dyn LogApplier>>,
    members: BTreeSet<NodeId>,
}

struct Shared {
    state: Mutex<LogState>,
    leader_tx: watch::Sender<Option<NodeId>>,
}

/// Shared in-process log. Clone-cheap; use [`LocalLog::handle`] to obtain a
/// per-replica [`GroupLog`].
#[derive(Clone)]
pub struct LocalLog {
    shared: Arc<Shared>,
}

impl LocalLog {
    pub fn new() -> Self {
        let (leader_tx, _) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(LogState::default()),
                leader_tx,
            }),
        }
    }

    /// Elect `leader` (or clear leadership with `None`).
    pub fn set_leader(&self, leader: Option<NodeId>) {
        self.shared.leader_tx.send_replace(leader);
    }

    pub fn leader(&self) -> Option<NodeId> {
        *self.shared.leader_tx.borrow()
    }

    /// A replica-local view of the log for node `id`.
    pub fn handle(&self, id: NodeId) -> LocalLogHandle {
        LocalLogHandle {
            shared: self.shared.clone(),
            local: id,
        }
    }

    /// All committed commands, in commit order.
    pub fn entries(&self) -> Vec<Vec<u8>> {
        self.shared.state.lock().unwrap().entries.clone()
    }

    pub fn members(&self) -> BTreeSet<NodeId> {
        self.shared.state.lock().unwrap().members.clone()
    }
}

impl Default for LocalLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-replica handle implementing [`GroupLog`] against a shared [`LocalLog`].
#[derive(Clone)]
pub struct LocalLogHandle {
    shared: Arc<Shared>,
    local: NodeId,
}

#[async_trait]
impl GroupLog for LocalLogHandle {
    async fn append(&self, command: Vec<u8>) -> Result<u64, LogError> {
        let leader = *self.shared.leader_tx.borrow();
        if leader != Some(self.local) {
            return Err(LogError::NotLeader { leader });
        }

        // Commit and fan out under the same lock so every subscriber observes
        // the same total order.
        let mut state = self.shared.state.lock().unwrap();
        state.entries.push(command.clone());
        let index = state.entries.len() as u64;
        for sub in &state.subscribers {
            sub.apply(index, &command);
        }
        Ok(index)
    }

    fn subscribe(&self, applier: Arc<dyn LogApplier>) {
        self.shared.state.lock().unwrap().subscribers.push(applier);
    }

    fn leadership(&self) -> watch::Receiver<Option<NodeId>> {
        self.shared.leader_tx.subscribe()
    }

    async fn add_member(&self, id: NodeId) -> anyhow::Result<()> {
        self.shared.state.lock().unwrap().members.insert(id);
        Ok(())
    }

    async fn remove_member(&self, id: NodeId) -> anyhow::Result<()> {
        self.shared.state.lock().unwrap().members.remove(&id);
        Ok(())
    }

    async fn snapshot_install(&self, _snapshot: Vec<u8>) -> Result<(), LogError> {
        // The in-process log never truncates, so there is no prefix to
        // replace; state machines install snapshot bundles directly.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct Recorder {
        seen: Mutex<Vec<(u64, Vec<u8>)>>,
        last_index: AtomicU64,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                last_index: AtomicU64::new(0),
            })
        }
    }

    impl LogApplier for Recorder {
        fn apply(&self, index: u64, command: &[u8]) {
            let prev = self.last_index.swap(index, Ordering::SeqCst);
            assert!(index > prev, "indexes must be strictly increasing");
            self.seen.lock().unwrap().push((index, command.to_vec()));
        }
    }

    #[tokio::test]
    async fn append_requires_leadership() {
        let log = LocalLog::new();
        let handle = log.handle(NodeId(1));

        let err = handle.append(b"x".to_vec()).await.unwrap_err();
        assert!(matches!(err, LogError::NotLeader { leader: None }));

        log.set_leader(Some(NodeId(2)));
        let err = handle.append(b"x".to_vec()).await.unwrap_err();
        assert!(matches!(
            err,
            LogError::NotLeader {
                leader: Some(NodeId(2))
            }
        ));

        log.set_leader(Some(NodeId(1)));
        assert_eq!(handle.append(b"x".to_vec()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn subscribers_observe_commit_order() {
        let log = LocalLog::new();
        log.set_leader(Some(NodeId(1)));
        let leader = log.handle(NodeId(1));
        let follower = log.handle(NodeId(2));

        let a = Recorder::new();
        let b = Recorder::new();
        leader.subscribe(a.clone());
        follower.subscribe(b.clone());

        for i in 0..5u8 {
            leader.append(vec![i]).await.unwrap();
        }

        let seen_a = a.seen.lock().unwrap().clone();
        let seen_b = b.seen.lock().unwrap().clone();
        assert_eq!(seen_a.len(), 5);
        assert_eq!(seen_a, seen_b);
    }

    #[tokio::test]
    async fn leadership_changes_are_observable() {
        let log = LocalLog::new();
        let handle = log.handle(NodeId(1));
        let mut rx = handle.leadership();
        assert_eq!(*rx.borrow(), None);

        log.set_leader(Some(NodeId(3)));
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), Some(NodeId(3)));
    }
}
