//! Liveness markers and failure detection
//!
//! Each running node refreshes an expiring marker under the job's liveness
//! directory. Peers watch that directory; a marker that expires or is
//! deleted means its occupant is gone.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::metrics::standard;
use crate::runtime::ShutdownListener;
use crate::store::{Action, CoordinationStore, KeyLayout, Node, Response, ResumableWatch, WatchGuard};

/// A peer's liveness marker disappeared
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerFailure {
    pub task_id: u64,
    /// Address the peer advertised, when the store reported it
    pub address: Option<String>,
}

/// Publishes our marker and watches everyone else's
pub struct LivenessMonitor {
    store: Arc<dyn CoordinationStore>,
    keys: KeyLayout,
    task_id: u64,
    address: String,
    heartbeat_interval: Duration,
    ttl: Duration,
}

impl LivenessMonitor {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        keys: KeyLayout,
        task_id: u64,
        address: impl Into<String>,
        heartbeat_interval: Duration,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            keys,
            task_id,
            address: address.into(),
            heartbeat_interval,
            ttl,
        }
    }

    /// Write (or refresh) our marker with the configured TTL
    pub async fn publish(&self) -> Result<()> {
        self.store
            .set(&self.keys.liveness(self.task_id), &self.address, Some(self.ttl))
            .await?;
        standard::HEARTBEATS_SENT.inc();
        Ok(())
    }

    /// Refresh the marker every heartbeat interval until the guard stops.
    /// Failed refreshes are logged and retried on the next tick.
    pub fn start_heartbeat(&self) -> WatchGuard {
        let store = self.store.clone();
        let key = self.keys.liveness(self.task_id);
        let address = self.address.clone();
        let ttl = self.ttl;
        let period = self.heartbeat_interval;

        WatchGuard::spawn(format!("heartbeat {}", key), move |mut stop| async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.recv() => break,
                    _ = ticker.tick() => {}
                }
                match store.set(&key, &address, Some(ttl)).await {
                    Ok(_) => {
                        standard::HEARTBEATS_SENT.inc();
                        debug!("Heartbeat {}", key);
                    }
                    Err(e) => warn!("Heartbeat on {} failed: {}", key, e),
                }
            }
            debug!("Heartbeat on {} stopped", key);
        })
    }

    /// Report every peer whose marker expires or is deleted on `failures`.
    ///
    /// When the watch loses history and resyncs, every occupied slot that
    /// has no marker at that point is reported instead.
    pub async fn watch_failures(&self, failures: mpsc::Sender<PeerFailure>) -> Result<WatchGuard> {
        let dir = self.keys.liveness_dir();
        let (watch, _) = ResumableWatch::open(self.store.clone(), dir.clone(), true).await?;
        let detector = FailureDetector {
            store: self.store.clone(),
            keys: self.keys.clone(),
            own: self.task_id,
            failures,
        };

        Ok(WatchGuard::spawn(format!("liveness {}", dir), move |stop| {
            detector.run(watch, stop)
        }))
    }
}

/// Occupied slot entries with no liveness marker behind them
pub async fn unmarked_slots(store: &dyn CoordinationStore, keys: &KeyLayout) -> Result<Vec<Node>> {
    let slots = match store.list(&keys.slot_dir()).await {
        Ok(resp) => resp.node.nodes,
        Err(e) if e.is_key_not_found() => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let marked: HashSet<u64> = match store.list(&keys.liveness_dir()).await {
        Ok(resp) => resp
            .node
            .nodes
            .iter()
            .filter_map(|n| KeyLayout::task_id_of(&n.key))
            .collect(),
        Err(e) if e.is_key_not_found() => HashSet::new(),
        Err(e) => return Err(e),
    };

    Ok(slots
        .into_iter()
        .filter(|slot| !slot.dir && !slot.value.is_empty())
        .filter(|slot| KeyLayout::task_id_of(&slot.key).is_some_and(|id| !marked.contains(&id)))
        .collect())
}

struct FailureDetector {
    store: Arc<dyn CoordinationStore>,
    keys: KeyLayout,
    own: u64,
    failures: mpsc::Sender<PeerFailure>,
}

impl FailureDetector {
    async fn run(self, mut watch: ResumableWatch, mut stop: ShutdownListener) {
        while let Some(resp) = watch.next_until(&mut stop).await {
            let lost = if resp.action == Action::Get {
                self.unmarked().await
            } else {
                self.removed_marker(resp).into_iter().collect()
            };

            for failure in lost {
                standard::PEER_FAILURES.inc();
                info!("Task {} lost its liveness marker", failure.task_id);
                tokio::select! {
                    _ = stop.recv() => return,
                    sent = self.failures.send(failure) => if sent.is_err() {
                        return;
                    },
                }
            }
        }
        debug!("Failure detector on {} stopped", watch.key());
    }

    /// The peer behind a marker that just expired or was deleted
    fn removed_marker(&self, resp: Response) -> Option<PeerFailure> {
        if !resp.action.is_removal() {
            return None;
        }
        let Some(task_id) = KeyLayout::task_id_of(&resp.node.key) else {
            warn!("Liveness entry {} isn't a task ID", resp.node.key);
            return None;
        };
        if task_id == self.own {
            if resp.action == Action::Expire {
                warn!("Our own liveness marker expired, heartbeats are falling behind");
            }
            return None;
        }
        debug!("Marker of task {} removed ({:?})", task_id, resp.action);
        Some(PeerFailure {
            task_id,
            address: resp.prev_node.map(|n| n.value).filter(|v| !v.is_empty()),
        })
    }

    /// Peers whose markers vanished while the watch had no history
    async fn unmarked(&self) -> Vec<PeerFailure> {
        match unmarked_slots(self.store.as_ref(), &self.keys).await {
            Ok(slots) => slots
                .into_iter()
                .filter_map(|slot| {
                    let task_id = KeyLayout::task_id_of(&slot.key)?;
                    (task_id != self.own).then_some(PeerFailure {
                        task_id,
                        address: Some(slot.value),
                    })
                })
                .collect(),
            Err(e) => {
                warn!("Could not list slots after liveness resync: {}", e);
                Vec::new()
            }
        }
    }
}
