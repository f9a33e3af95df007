//! Handle given to the task
//!
//! Holds immutable copies of what callbacks need (job keys, task ID, store
//! handle) plus shared cursors; the bootstrap keeps the mutable lifecycle
//! state to itself.

use std::sync::Arc;
use tracing::{debug, info};

use crate::coordinator::{parse_epoch, EpochCursor};
use crate::dataplane::DataRequester;
use crate::error::{Result, TaskGraphError};
use crate::runtime::ShutdownSignal;
use crate::store::{CoordinationStore, KeyLayout, Precondition};

/// The task's window onto the framework
#[derive(Clone)]
pub struct FrameworkHandle {
    task_id: u64,
    keys: KeyLayout,
    store: Arc<dyn CoordinationStore>,
    epoch: EpochCursor,
    requester: DataRequester,
    shutdown: ShutdownSignal,
}

impl FrameworkHandle {
    pub(crate) fn new(
        task_id: u64,
        keys: KeyLayout,
        store: Arc<dyn CoordinationStore>,
        epoch: EpochCursor,
        requester: DataRequester,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            task_id,
            keys,
            store,
            epoch,
            requester,
            shutdown,
        }
    }

    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    pub fn job(&self) -> &str {
        self.keys.job()
    }

    /// Last epoch delivered to the task
    pub fn epoch(&self) -> u64 {
        self.epoch.get()
    }

    /// Publish `meta` to our parents (fires their `child_meta_ready`)
    pub async fn flag_meta_to_parent(&self, meta: &str) -> Result<()> {
        let key = self.keys.parent_meta(self.task_id);
        self.store.set(&key, meta, None).await?;
        debug!("Task {} flagged {:?} to parents", self.task_id, meta);
        Ok(())
    }

    /// Publish `meta` to our children (fires their `parent_meta_ready`)
    pub async fn flag_meta_to_child(&self, meta: &str) -> Result<()> {
        let key = self.keys.child_meta(self.task_id);
        self.store.set(&key, meta, None).await?;
        debug!("Task {} flagged {:?} to children", self.task_id, meta);
        Ok(())
    }

    /// Ask neighbor `to_id` for data. Returns immediately; the answer
    /// arrives through `parent_data_ready` or `child_data_ready`.
    pub fn data_request(&self, to_id: u64, req: &str) {
        self.requester.request(to_id, req);
    }

    /// Move the job from the epoch this task last saw to the next one.
    ///
    /// Returns false if another task already advanced past it.
    pub async fn inc_epoch(&self) -> Result<bool> {
        let key = self.keys.epoch();
        let seen = self.epoch.get();
        let current = parse_epoch(&self.store.get(&key).await?.node)?;
        if current != seen {
            debug!("Epoch already at {} (task saw {})", current, seen);
            return Ok(false);
        }

        let next = seen + 1;
        match self
            .store
            .compare_and_swap(&key, &next.to_string(), None, &Precondition::value(seen.to_string()))
            .await
        {
            Ok(_) => {
                info!("Task {} advanced job {} to epoch {}", self.task_id, self.job(), next);
                Ok(true)
            }
            Err(TaskGraphError::CompareFailed { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Ask the node to shut down in order
    pub fn shutdown(&self) {
        info!("Task {} requested shutdown", self.task_id);
        self.shutdown.shutdown();
    }
}

impl std::fmt::Debug for FrameworkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameworkHandle")
            .field("job", &self.keys.job())
            .field("task_id", &self.task_id)
            .field("epoch", &self.epoch.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn handle(store: &Arc<MemoryStore>, task_id: u64, epoch: u64) -> FrameworkHandle {
        let keys = KeyLayout::new("job");
        let (tx, _rx) = mpsc::channel(1);
        let requester =
            DataRequester::new(store.clone(), keys.clone(), task_id, 1, Duration::from_secs(1), tx)
                .unwrap();
        FrameworkHandle::new(
            task_id,
            keys,
            store.clone(),
            EpochCursor::new(epoch),
            requester,
            ShutdownSignal::new(),
        )
    }

    #[tokio::test]
    async fn test_flag_meta_writes_own_keys() {
        let store = MemoryStore::new();
        let fw = handle(&store, 4, 0);
        fw.flag_meta_to_parent("grads").await.unwrap();
        fw.flag_meta_to_child("params").await.unwrap();

        assert_eq!(store.get("/job/meta/4/parent").await.unwrap().node.value, "grads");
        assert_eq!(store.get("/job/meta/4/child").await.unwrap().node.value, "params");
    }

    #[tokio::test]
    async fn test_inc_epoch_advances_once() {
        let store = MemoryStore::new();
        store.set("/job/epoch", "3", None).await.unwrap();

        let a = handle(&store, 0, 3);
        let b = handle(&store, 1, 3);
        assert!(a.inc_epoch().await.unwrap());
        assert!(!b.inc_epoch().await.unwrap());
        assert_eq!(store.get("/job/epoch").await.unwrap().node.value, "4");
    }

    #[tokio::test]
    async fn test_shutdown_fires_signal() {
        let store = MemoryStore::new();
        let fw = handle(&store, 0, 0);
        let signal = fw.shutdown.clone();
        fw.clone().shutdown();
        assert!(signal.is_shutdown());
    }
}
