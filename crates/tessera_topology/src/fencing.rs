//! Fencing registry.
//!
//! Every data-plane RPC carries a fencing token (the caller's topology
//! version). The registry holds the locally applied `(version,
//! fence_version)` pair, written only by the applier, and gates request
//! admission: stale tokens are rejected, tokens from the future wait for the
//! local applier to catch up.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::TopologyError;
use crate::model::INITIAL_VERSION;

/// Wire-format fencing token: a single topology version. Zero means the
/// caller opted out (legacy or bootstrapping callers).
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct FencingToken {
    pub topology_version: u64,
}

impl FencingToken {
    pub fn new(topology_version: u64) -> Self {
        Self { topology_version }
    }

    /// Token used by callers that do not participate in fencing.
    pub fn opt_out() -> Self {
        Self {
            topology_version: 0,
        }
    }

    pub fn is_opt_out(&self) -> bool {
        self.topology_version == 0
    }
}

impl fmt::Display for FencingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}", self.topology_version)
    }
}

/// Tracks an admitted data-plane operation until it finishes.
#[derive(Debug)]
pub struct FencingGuard {
    registry: Arc<FencingRegistry>,
    version: u64,
}

impl FencingGuard {
    /// Version this operation was admitted at.
    pub fn version(&self) -> u64 {
        self.version
    }
}

impl Drop for FencingGuard {
    fn drop(&mut self) {
        let mut inflight = self.registry.inflight.lock().unwrap();
        if let Some(count) = inflight.get_mut(&self.version) {
            *count -= 1;
            if *count == 0 {
                inflight.remove(&self.version);
            }
        }
        drop(inflight);
        self.registry.drained.notify_waiters();
    }
}

/// Per-replica fencing state. Written only by the applier; read by every
/// data-plane handler.
#[derive(Debug)]
pub struct FencingRegistry {
    versions: RwLock<(u64, u64)>,
    /// Admitted-but-unfinished operations, keyed by admission version.
    inflight: Mutex<BTreeMap<u64, usize>>,
    applied: Notify,
    drained: Notify,
}

impl FencingRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            versions: RwLock::new((INITIAL_VERSION, INITIAL_VERSION)),
            inflight: Mutex::new(BTreeMap::new()),
            applied: Notify::new(),
            drained: Notify::new(),
        })
    }

    /// `(version, fence_version)` as last applied.
    pub fn versions(&self) -> (u64, u64) {
        *self.versions.read().unwrap()
    }

    /// Applier hook: record a newly applied topology version pair.
    pub(crate) fn advance(&self, version: u64, fence_version: u64) {
        {
            let mut v = self.versions.write().unwrap();
            *v = (version, fence_version);
        }
        self.applied.notify_waiters();
    }

    /// Admit a data-plane operation carrying `token`, waiting up to
    /// `deadline` for the local applier when the token is ahead of us.
    pub async fn enforce(
        self: &Arc<Self>,
        token: FencingToken,
        deadline: Duration,
    ) -> Result<FencingGuard, TopologyError> {
        let expires = Instant::now() + deadline;
        loop {
            let wakeup = self.applied.notified();
            let (version, fence) = self.versions();
            if !token.is_opt_out() {
                if token.topology_version < fence {
                    return Err(TopologyError::StaleTopology {
                        token,
                        fence_version: fence,
                    });
                }
                if token.topology_version > version {
                    // The caller has seen a newer topology; wait for our
                    // applier to catch up.
                    if tokio::time::timeout_at(expires, wakeup).await.is_err() {
                        return Err(TopologyError::BarrierFailed(format!(
                            "timed out waiting for topology version {}",
                            token.topology_version
                        )));
                    }
                    continue;
                }
            }
            let admitted = if token.is_opt_out() {
                version
            } else {
                token.topology_version
            };
            *self.inflight.lock().unwrap().entry(admitted).or_insert(0) += 1;
            return Ok(FencingGuard {
                registry: self.clone(),
                version: admitted,
            });
        }
    }

    /// Wait until every operation admitted below the current fence version
    /// has finished. Used by `barrier_and_drain`.
    pub async fn drain(&self, deadline: Duration) -> Result<(), TopologyError> {
        let expires = Instant::now() + deadline;
        loop {
            let wakeup = self.drained.notified();
            let (_, fence) = self.versions();
            let pending = {
                let inflight = self.inflight.lock().unwrap();
                inflight.range(..fence).map(|(_, c)| *c).sum::<usize>()
            };
            if pending == 0 {
                return Ok(());
            }
            if tokio::time::timeout_at(expires, wakeup).await.is_err() {
                return Err(TopologyError::BarrierFailed(format!(
                    "timed out draining {pending} operations below fence {fence}"
                )));
            }
        }
    }
}
