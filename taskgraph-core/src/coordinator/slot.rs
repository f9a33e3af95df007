//! Task slot acquisition
//!
//! A node becomes a task by claiming an unassigned entry in the job's slot
//! directory with an atomic compare-and-swap. Nodes that find every slot
//! taken wait in standby, freeing slots whose liveness marker is gone and
//! retrying whenever the directory changes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::liveness::unmarked_slots;
use crate::error::{Result, TaskGraphError};
use crate::metrics::standard;
use crate::runtime::ShutdownListener;
use crate::store::{Action, CoordinationStore, KeyLayout, Precondition, ResumableWatch};
use crate::DEFAULT_LIVENESS_TTL_MS;

/// Shortest pause between orphan sweeps
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

/// Claims, reclaims and releases task slots
pub struct SlotAllocator {
    store: Arc<dyn CoordinationStore>,
    keys: KeyLayout,
    /// Marker value written into a claimed slot
    address: String,
    /// How long an occupied slot may lack a liveness marker before
    /// standby frees it
    orphan_grace: Duration,
}

impl SlotAllocator {
    /// Create a new slot allocator
    pub fn new(store: Arc<dyn CoordinationStore>, keys: KeyLayout, address: impl Into<String>) -> Self {
        Self {
            store,
            keys,
            address: address.into(),
            orphan_grace: Duration::from_millis(DEFAULT_LIVENESS_TTL_MS),
        }
    }

    /// Set to the liveness TTL: a holder that has not published its marker
    /// within one TTL of claiming is considered dead.
    pub fn with_orphan_grace(mut self, grace: Duration) -> Self {
        self.orphan_grace = grace;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Claim the first unassigned slot in directory order.
    ///
    /// Entries whose key is not a number are logged and skipped. Fails with
    /// `NoUnassignedTask` when every slot is taken.
    pub async fn acquire(&self) -> Result<u64> {
        let dir = self.keys.slot_dir();
        let listing = match self.store.list(&dir).await {
            Ok(resp) => resp,
            Err(e) if e.is_key_not_found() => {
                warn!("Slot directory {} does not exist", dir);
                return Err(self.no_slot());
            }
            Err(e) => return Err(e),
        };

        for slot in &listing.node.nodes {
            let task_id = match slot.name().parse::<u64>() {
                Ok(id) if !slot.dir => id,
                _ => {
                    warn!(
                        "Slot entry {} isn't a task ID, registration for job {} has been corrupted",
                        slot.key,
                        self.keys.job()
                    );
                    continue;
                }
            };
            if !slot.value.is_empty() {
                continue;
            }
            if self.try_claim(task_id).await? {
                return Ok(task_id);
            }
        }

        Err(self.no_slot())
    }

    /// Atomically claim `task_id`. Returns false if another node won.
    pub async fn try_claim(&self, task_id: u64) -> Result<bool> {
        let key = self.keys.slot(task_id);
        match self
            .store
            .compare_and_swap(&key, &self.address, None, &Precondition::value(""))
            .await
        {
            Ok(_) => {
                standard::SLOT_CLAIMS.inc();
                info!("Claimed slot {} of job {} as {}", task_id, self.keys.job(), self.address);
                Ok(true)
            }
            Err(TaskGraphError::CompareFailed { .. }) | Err(TaskGraphError::KeyNotFound { .. }) => {
                debug!("Lost the race for slot {}", task_id);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Wait for a slot to free up and claim it.
    ///
    /// Re-attempts `acquire` whenever an entry in the slot directory is
    /// written empty. Slots whose liveness marker expires are freed right
    /// away; slots held without any marker for the orphan grace period are
    /// freed by a periodic sweep. Gives up with `StandbyTimeout` after
    /// `timeout` (when set), or `ShutdownInProgress` once `stop` fires.
    pub async fn standby(
        &self,
        timeout: Option<Duration>,
        stop: &mut ShutdownListener,
    ) -> Result<u64> {
        let started = Instant::now();
        let (mut slots, _) = ResumableWatch::open(self.store.clone(), self.keys.slot_dir(), true).await?;
        let (mut markers, _) =
            ResumableWatch::open(self.store.clone(), self.keys.liveness_dir(), true).await?;
        let mut marker_stop = stop.clone();

        // A slot may have been freed between the failed claim and the watch
        match self.acquire().await {
            Err(TaskGraphError::NoUnassignedTask { .. }) => {}
            other => return other,
        }
        info!("Job {} has no free slot, {} standing by", self.keys.job(), self.address);

        let expiry = async {
            match timeout {
                Some(t) => tokio::time::sleep_until(started + t).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(expiry);

        let mut sweep = interval((self.orphan_grace / 2).max(MIN_SWEEP_INTERVAL));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut orphans = HashMap::new();

        loop {
            let freed = tokio::select! {
                _ = &mut expiry => {
                    return Err(TaskGraphError::StandbyTimeout {
                        job: self.keys.job().to_string(),
                        waited_secs: started.elapsed().as_secs(),
                    });
                }
                resp = slots.next_until(stop) => {
                    let Some(resp) = resp else {
                        return Err(TaskGraphError::ShutdownInProgress);
                    };
                    !resp.action.is_removal() && resp.node.value.is_empty()
                }
                resp = markers.next_until(&mut marker_stop) => {
                    let Some(resp) = resp else {
                        return Err(TaskGraphError::ShutdownInProgress);
                    };
                    match resp.action {
                        Action::Expire => self.reclaim_expired(&resp.node.key, resp.prev_node.map(|n| n.value)).await,
                        Action::Get => self.sweep_orphans(&mut orphans).await,
                        _ => false,
                    }
                }
                _ = sweep.tick() => self.sweep_orphans(&mut orphans).await,
            };
            if !freed {
                continue;
            }

            debug!("A slot of job {} became free, retrying acquisition", self.keys.job());
            match self.acquire().await {
                Err(TaskGraphError::NoUnassignedTask { .. }) => continue,
                other => return other,
            }
        }
    }

    /// Free the slot behind a marker that just expired
    async fn reclaim_expired(&self, marker_key: &str, address: Option<String>) -> bool {
        let Some(task_id) = KeyLayout::task_id_of(marker_key) else {
            return false;
        };
        let address = address.filter(|a| !a.is_empty());
        match self.reclaim(task_id, address.as_deref()).await {
            Ok(freed) => freed,
            Err(e) => {
                warn!("Could not reclaim slot {}: {}", task_id, e);
                false
            }
        }
    }

    /// Free occupied slots that have had no liveness marker for the whole
    /// orphan grace period. `orphans` remembers when each was first seen
    /// unmarked; a slot rewritten since then starts over.
    async fn sweep_orphans(&self, orphans: &mut HashMap<u64, (u64, Instant)>) -> bool {
        let unmarked = match unmarked_slots(self.store.as_ref(), &self.keys).await {
            Ok(unmarked) => unmarked,
            Err(e) => {
                warn!("Orphan sweep of job {} failed: {}", self.keys.job(), e);
                return false;
            }
        };

        let now = Instant::now();
        let mut still = HashMap::new();
        let mut freed = false;
        for slot in unmarked {
            let Some(task_id) = KeyLayout::task_id_of(&slot.key) else {
                continue;
            };
            let since = match orphans.get(&task_id) {
                Some(&(index, at)) if index == slot.modified_index => at,
                _ => now,
            };
            if now.duration_since(since) < self.orphan_grace {
                still.insert(task_id, (slot.modified_index, since));
                continue;
            }

            warn!(
                "Slot {} held by {} has had no liveness marker for {:?}",
                task_id,
                slot.value,
                now.duration_since(since)
            );
            match self.reclaim(task_id, Some(&slot.value)).await {
                Ok(true) => freed = true,
                Ok(false) => {}
                Err(e) => warn!("Could not reclaim slot {}: {}", task_id, e),
            }
        }
        *orphans = still;
        freed
    }

    /// Free the slot of a task whose liveness marker expired.
    ///
    /// Only resets the entry if it still holds `dead_address` (when known)
    /// and the marker is still absent; returns whether the slot was freed.
    pub async fn reclaim(&self, task_id: u64, dead_address: Option<&str>) -> Result<bool> {
        let key = self.keys.slot(task_id);
        let slot = match self.store.get(&key).await {
            Ok(resp) => resp.node,
            Err(e) if e.is_key_not_found() => return Ok(false),
            Err(e) => return Err(e),
        };
        if slot.value.is_empty() {
            return Ok(false);
        }
        if let Some(addr) = dead_address {
            if slot.value != addr {
                debug!("Slot {} already re-occupied by {}", task_id, slot.value);
                return Ok(false);
            }
        }

        match self.store.get(&self.keys.liveness(task_id)).await {
            Ok(_) => {
                debug!("Task {} is alive again, not reclaiming", task_id);
                return Ok(false);
            }
            Err(e) if e.is_key_not_found() => {}
            Err(e) => return Err(e),
        }

        let cond = Precondition {
            prev_value: Some(slot.value.clone()),
            prev_index: Some(slot.modified_index),
        };
        match self.store.compare_and_swap(&key, "", None, &cond).await {
            Ok(_) => {
                info!("Freed slot {} previously held by {}", task_id, slot.value);
                Ok(true)
            }
            Err(TaskGraphError::CompareFailed { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Give up our own slot: drop the liveness marker and empty the entry.
    pub async fn release(&self, task_id: u64) -> Result<()> {
        match self.store.delete(&self.keys.liveness(task_id), false).await {
            Ok(_) => {}
            Err(e) if e.is_key_not_found() => {}
            Err(e) => return Err(e),
        }

        let cond = Precondition::value(self.address.clone());
        match self
            .store
            .compare_and_swap(&self.keys.slot(task_id), "", None, &cond)
            .await
        {
            Ok(_) => {
                info!("Released slot {} of job {}", task_id, self.keys.job());
                Ok(())
            }
            Err(TaskGraphError::CompareFailed { .. }) | Err(TaskGraphError::KeyNotFound { .. }) => {
                warn!("Slot {} was no longer ours at release", task_id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn no_slot(&self) -> TaskGraphError {
        TaskGraphError::NoUnassignedTask {
            job: self.keys.job().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ShutdownSignal;
    use crate::store::MemoryStore;
    use std::collections::HashSet;

    async fn layout(store: &MemoryStore, keys: &KeyLayout, slots: u64) {
        for id in 0..slots {
            store.set(&keys.slot(id), "", None).await.unwrap();
        }
    }

    fn allocator(store: &Arc<MemoryStore>, keys: &KeyLayout, addr: &str) -> SlotAllocator {
        SlotAllocator::new(store.clone(), keys.clone(), addr)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_two_nodes_split_two_slots() {
        let store = MemoryStore::new();
        let keys = KeyLayout::new("job");
        layout(&store, &keys, 2).await;

        let a = allocator(&store, &keys, "10.0.0.1:7000");
        let b = allocator(&store, &keys, "10.0.0.2:7000");
        let (ra, rb) = tokio::join!(a.acquire(), b.acquire());

        let ids: HashSet<u64> = [ra.unwrap(), rb.unwrap()].into_iter().collect();
        assert_eq!(ids, HashSet::from([0, 1]));

        let listing = store.list(&keys.slot_dir()).await.unwrap();
        assert!(listing.node.nodes.iter().all(|n| !n.value.is_empty()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_surplus_nodes_get_no_slot() {
        let store = MemoryStore::new();
        let keys = KeyLayout::new("job");
        layout(&store, &keys, 3).await;

        let mut handles = Vec::new();
        for i in 0..5 {
            let a = allocator(&store, &keys, &format!("10.0.0.{}:7000", i));
            handles.push(tokio::spawn(async move { a.acquire().await }));
        }

        let mut claimed = HashSet::new();
        let mut standby = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(id) => assert!(claimed.insert(id), "slot {} claimed twice", id),
                Err(TaskGraphError::NoUnassignedTask { .. }) => standby += 1,
                Err(e) => panic!("unexpected error {}", e),
            }
        }
        assert_eq!(claimed, HashSet::from([0, 1, 2]));
        assert_eq!(standby, 2);
    }

    #[tokio::test]
    async fn test_non_numeric_entries_skipped() {
        let store = MemoryStore::new();
        let keys = KeyLayout::new("job");
        store.set("/job/slots/abc", "", None).await.unwrap();
        store.set(&keys.slot(7), "", None).await.unwrap();

        let id = allocator(&store, &keys, "n1").acquire().await.unwrap();
        assert_eq!(id, 7);
    }

    #[tokio::test]
    async fn test_missing_directory_means_no_slot() {
        let store = MemoryStore::new();
        let keys = KeyLayout::new("job");
        let err = allocator(&store, &keys, "n1").acquire().await.unwrap_err();
        assert!(matches!(err, TaskGraphError::NoUnassignedTask { .. }));
    }

    #[tokio::test]
    async fn test_standby_promoted_when_slot_frees() {
        let store = MemoryStore::new();
        let keys = KeyLayout::new("job");
        layout(&store, &keys, 1).await;

        let holder = allocator(&store, &keys, "holder");
        assert_eq!(holder.acquire().await.unwrap(), 0);

        let waiting = {
            let standby = allocator(&store, &keys, "standby");
            tokio::spawn(async move {
                let signal = ShutdownSignal::new();
                let mut stop = signal.subscribe();
                standby.standby(Some(Duration::from_secs(5)), &mut stop).await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        holder.release(0).await.unwrap();

        assert_eq!(waiting.await.unwrap().unwrap(), 0);
        let slot = store.get(&keys.slot(0)).await.unwrap();
        assert_eq!(slot.node.value, "standby");
    }

    #[tokio::test]
    async fn test_standby_times_out() {
        let store = MemoryStore::new();
        let keys = KeyLayout::new("job");
        layout(&store, &keys, 1).await;
        allocator(&store, &keys, "holder").acquire().await.unwrap();

        let signal = ShutdownSignal::new();
        let mut stop = signal.subscribe();
        let err = allocator(&store, &keys, "late")
            .standby(Some(Duration::from_millis(100)), &mut stop)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskGraphError::StandbyTimeout { .. }));
    }

    #[tokio::test]
    async fn test_standby_takes_slot_of_expired_holder() {
        let store = MemoryStore::new();
        let keys = KeyLayout::new("solo");
        layout(&store, &keys, 1).await;

        // The holder publishes once and then goes silent
        assert_eq!(allocator(&store, &keys, "a:1").acquire().await.unwrap(), 0);
        store
            .set(&keys.liveness(0), "a:1", Some(Duration::from_millis(200)))
            .await
            .unwrap();

        let signal = ShutdownSignal::new();
        let mut stop = signal.subscribe();
        let id = allocator(&store, &keys, "b:1")
            .standby(Some(Duration::from_secs(3)), &mut stop)
            .await
            .unwrap();
        assert_eq!(id, 0);
        assert_eq!(store.get(&keys.slot(0)).await.unwrap().node.value, "b:1");
    }

    #[tokio::test]
    async fn test_standby_frees_slot_never_marked() {
        let store = MemoryStore::new();
        let keys = KeyLayout::new("job");
        layout(&store, &keys, 2).await;
        allocator(&store, &keys, "crashed").acquire().await.unwrap();
        allocator(&store, &keys, "healthy").acquire().await.unwrap();
        store.set(&keys.liveness(1), "healthy", None).await.unwrap();

        let signal = ShutdownSignal::new();
        let mut stop = signal.subscribe();
        let standby = allocator(&store, &keys, "standby").with_orphan_grace(Duration::from_millis(200));
        let started = Instant::now();
        let id = standby
            .standby(Some(Duration::from_secs(3)), &mut stop)
            .await
            .unwrap();
        assert_eq!(id, 0);
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(store.get(&keys.slot(1)).await.unwrap().node.value, "healthy");
    }

    #[tokio::test]
    async fn test_marked_slots_survive_sweeps() {
        let store = MemoryStore::new();
        let keys = KeyLayout::new("job");
        layout(&store, &keys, 1).await;
        allocator(&store, &keys, "holder").acquire().await.unwrap();
        store.set(&keys.liveness(0), "holder", None).await.unwrap();

        let signal = ShutdownSignal::new();
        let mut stop = signal.subscribe();
        let err = allocator(&store, &keys, "late")
            .with_orphan_grace(Duration::from_millis(50))
            .standby(Some(Duration::from_millis(300)), &mut stop)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskGraphError::StandbyTimeout { .. }));
        assert_eq!(store.get(&keys.slot(0)).await.unwrap().node.value, "holder");
    }

    #[tokio::test]
    async fn test_reclaim_only_dead_slots() {
        let store = MemoryStore::new();
        let keys = KeyLayout::new("job");
        layout(&store, &keys, 2).await;

        let a = allocator(&store, &keys, "a");
        assert_eq!(a.acquire().await.unwrap(), 0);
        assert_eq!(allocator(&store, &keys, "b").acquire().await.unwrap(), 1);

        // slot 0 still has a liveness marker
        store.set(&keys.liveness(0), "a", None).await.unwrap();
        assert!(!a.reclaim(0, Some("a")).await.unwrap());

        store.delete(&keys.liveness(0), false).await.unwrap();
        assert!(!a.reclaim(0, Some("someone-else")).await.unwrap());
        assert!(a.reclaim(0, Some("a")).await.unwrap());
        assert_eq!(store.get(&keys.slot(0)).await.unwrap().node.value, "");

        // nothing left to free
        assert!(!a.reclaim(0, None).await.unwrap());
    }
}
