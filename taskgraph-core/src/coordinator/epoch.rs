//! Global epoch synchronization
//!
//! Reads the job's epoch and forwards every later value, in order, through
//! a single-slot channel. The channel is deliberately that small: a slow
//! consumer blocks the forwarder instead of values being dropped, and the
//! store's index keeps the writes that arrive meanwhile.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::{Result, TaskGraphError};
use crate::runtime::ShutdownListener;
use crate::store::{Action, CoordinationStore, KeyLayout, Node, ResumableWatch, WatchGuard};

/// Capacity of the epoch delivery channel
pub const EPOCH_CHANNEL_CAPACITY: usize = 1;

/// Shared, read-only view of the last epoch delivered to the task
#[derive(Debug, Clone, Default)]
pub struct EpochCursor(Arc<AtomicU64>);

impl EpochCursor {
    pub fn new(epoch: u64) -> Self {
        Self(Arc::new(AtomicU64::new(epoch)))
    }

    /// Get current epoch
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Move the cursor forward; lower values are ignored
    pub(crate) fn advance(&self, epoch: u64) {
        self.0.fetch_max(epoch, Ordering::AcqRel);
    }
}

/// Parse an epoch value stored at `node`
pub fn parse_epoch(node: &Node) -> Result<u64> {
    node.value
        .trim()
        .parse::<u64>()
        .map_err(|e| TaskGraphError::CorruptEntry {
            key: node.key.clone(),
            reason: format!("epoch {:?} is not an unsigned integer: {}", node.value, e),
        })
}

/// Initial epoch plus the stream of later ones
pub struct EpochSubscription {
    pub initial: u64,
    pub updates: mpsc::Receiver<u64>,
    pub guard: WatchGuard,
}

/// Reads and watches the job's epoch key
pub struct EpochCoordinator {
    store: Arc<dyn CoordinationStore>,
    keys: KeyLayout,
}

impl EpochCoordinator {
    pub fn new(store: Arc<dyn CoordinationStore>, keys: KeyLayout) -> Self {
        Self { store, keys }
    }

    /// Fetch the current epoch and start forwarding every later value.
    ///
    /// If the epoch key does not exist yet this waits for its first write.
    pub async fn get_and_watch(&self) -> Result<EpochSubscription> {
        let key = self.keys.epoch();
        let (mut watch, baseline) = ResumableWatch::open(self.store.clone(), &key, false).await?;

        let initial = match baseline {
            Some(resp) => parse_epoch(&resp.node)?,
            None => {
                info!("Epoch key {} not created yet, waiting for the controller", key);
                loop {
                    let resp = watch.next().await?;
                    if resp.action.is_write() {
                        break parse_epoch(&resp.node)?;
                    }
                }
            }
        };
        info!("Job {} is at epoch {}", self.keys.job(), initial);

        let (tx, updates) = mpsc::channel(EPOCH_CHANNEL_CAPACITY);
        let guard = WatchGuard::spawn(format!("epoch {}", key), move |stop| {
            forward_epochs(watch, tx, initial, stop)
        });

        Ok(EpochSubscription {
            initial,
            updates,
            guard,
        })
    }
}

async fn forward_epochs(
    mut watch: ResumableWatch,
    tx: mpsc::Sender<u64>,
    initial: u64,
    mut stop: ShutdownListener,
) {
    let mut last = initial;

    while let Some(resp) = watch.next_until(&mut stop).await {
        if !resp.action.is_write() && resp.action != Action::Get {
            debug!("Ignoring {:?} on {}", resp.action, resp.node.key);
            continue;
        }

        let epoch = match parse_epoch(&resp.node) {
            Ok(epoch) => epoch,
            Err(e) => {
                error!("Skipping unreadable epoch: {}", e);
                continue;
            }
        };
        if epoch < last {
            warn!("Epoch went backwards ({} -> {}), not delivering", last, epoch);
            continue;
        }
        if resp.action == Action::Get && epoch == last {
            continue;
        }
        last = epoch;

        // Blocks while the consumer still holds the previous value
        tokio::select! {
            _ = stop.recv() => break,
            sent = tx.send(epoch) => if sent.is_err() {
                break;
            },
        }
    }
    debug!("Epoch forwarder on {} stopped", watch.key());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::time::Duration;

    async fn recv(rx: &mut mpsc::Receiver<u64>) -> u64 {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("epoch not delivered")
            .expect("epoch channel closed")
    }

    #[tokio::test]
    async fn test_delivers_in_order() {
        let store = MemoryStore::new();
        let keys = KeyLayout::new("job");
        store.set(&keys.epoch(), "0", None).await.unwrap();

        let coordinator = EpochCoordinator::new(store.clone(), keys.clone());
        let mut sub = coordinator.get_and_watch().await.unwrap();
        assert_eq!(sub.initial, 0);

        store.set(&keys.epoch(), "1", None).await.unwrap();
        store.set(&keys.epoch(), "2", None).await.unwrap();

        assert_eq!(recv(&mut sub.updates).await, 1);
        assert_eq!(recv(&mut sub.updates).await, 2);
        sub.guard.stop().await;
    }

    #[tokio::test]
    async fn test_slow_consumer_sees_every_value() {
        let store = MemoryStore::new();
        let keys = KeyLayout::new("job");
        store.set(&keys.epoch(), "0", None).await.unwrap();

        let mut sub = EpochCoordinator::new(store.clone(), keys.clone())
            .get_and_watch()
            .await
            .unwrap();

        for epoch in 1..=20u64 {
            store.set(&keys.epoch(), &epoch.to_string(), None).await.unwrap();
        }

        let mut seen = Vec::new();
        while seen.len() < 20 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            seen.push(recv(&mut sub.updates).await);
        }
        assert_eq!(seen, (1..=20).collect::<Vec<_>>());
        sub.guard.stop().await;
    }

    #[tokio::test]
    async fn test_waits_for_missing_epoch() {
        let store = MemoryStore::new();
        let keys = KeyLayout::new("job");

        let task = {
            let store = store.clone();
            let keys = keys.clone();
            tokio::spawn(async move {
                EpochCoordinator::new(store, keys).get_and_watch().await
            })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        store.set(&keys.epoch(), "3", None).await.unwrap();

        let sub = task.await.unwrap().unwrap();
        assert_eq!(sub.initial, 3);
        sub.guard.stop().await;
    }

    #[tokio::test]
    async fn test_regression_not_delivered() {
        let store = MemoryStore::new();
        let keys = KeyLayout::new("job");
        store.set(&keys.epoch(), "5", None).await.unwrap();

        let mut sub = EpochCoordinator::new(store.clone(), keys.clone())
            .get_and_watch()
            .await
            .unwrap();

        store.set(&keys.epoch(), "4", None).await.unwrap();
        store.set(&keys.epoch(), "6", None).await.unwrap();

        assert_eq!(recv(&mut sub.updates).await, 6);
        sub.guard.stop().await;
    }

    #[tokio::test]
    async fn test_corrupt_initial_epoch_is_fatal() {
        let store = MemoryStore::new();
        let keys = KeyLayout::new("job");
        store.set(&keys.epoch(), "zero", None).await.unwrap();

        let err = EpochCoordinator::new(store, keys).get_and_watch().await.err().unwrap();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_cursor_never_moves_back() {
        let cursor = EpochCursor::new(3);
        cursor.advance(2);
        assert_eq!(cursor.get(), 3);
        cursor.advance(7);
        assert_eq!(cursor.get(), 7);
    }
}
