//! Neighbor meta watches
//!
//! For every parent we follow the meta it publishes for its children, and
//! for every child the meta it publishes for its parents. Each neighbor has
//! its own forwarding task, so ordering holds per neighbor only.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, error, info};

use super::epoch::EpochCursor;
use crate::error::Result;
use crate::metrics::standard;
use crate::runtime::ShutdownListener;
use crate::store::{Action, CoordinationStore, KeyLayout, Response, ResumableWatch, WatchGuard};
use crate::task::{Context, Task};
use crate::topology::Role;

/// Distinct meta values remembered per neighbor
pub const META_DEDUPE_WINDOW: usize = 1024;

/// Meta values already handed to the task for one neighbor, oldest
/// forgotten first once the window is full
#[derive(Debug)]
pub struct DeliveredMeta {
    order: VecDeque<String>,
    values: HashSet<String>,
    capacity: usize,
}

impl DeliveredMeta {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            values: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// Record `meta`; false if it was already delivered
    pub fn insert(&mut self, meta: &str) -> bool {
        if self.values.contains(meta) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.values.remove(&oldest);
            }
        }
        self.order.push_back(meta.to_string());
        self.values.insert(meta.to_string());
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

type DeliveredByNeighbor = HashMap<(Role, u64), Arc<Mutex<DeliveredMeta>>>;

/// Establishes the per-neighbor forwarding tasks. Delivery history is kept
/// per neighbor for the watcher's lifetime, so re-watching a neighbor does
/// not hand its current value to the task again.
pub struct NeighborWatcher {
    store: Arc<dyn CoordinationStore>,
    keys: KeyLayout,
    task: Arc<dyn Task>,
    task_id: u64,
    epoch: EpochCursor,
    delivered: Mutex<DeliveredByNeighbor>,
}

impl NeighborWatcher {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        keys: KeyLayout,
        task: Arc<dyn Task>,
        task_id: u64,
        epoch: EpochCursor,
    ) -> Self {
        Self {
            store,
            keys,
            task,
            task_id,
            epoch,
            delivered: Mutex::new(HashMap::new()),
        }
    }

    /// Key holding the meta `neighbor` publishes towards us
    pub fn watch_path(&self, role: Role, neighbor: u64) -> String {
        match role {
            Role::Parent => self.keys.child_meta(neighbor),
            Role::Child => self.keys.parent_meta(neighbor),
        }
    }

    /// Start one watch per neighbor.
    ///
    /// A store error other than "not found" while reading a baseline is
    /// fatal: watches already started are stopped and the error returned.
    pub async fn watch_all(&self, role: Role, neighbors: &[u64]) -> Result<Vec<WatchGuard>> {
        let mut guards = Vec::with_capacity(neighbors.len());

        for &neighbor in neighbors {
            let path = self.watch_path(role, neighbor);
            let (watch, baseline) = match ResumableWatch::open(self.store.clone(), path.clone(), false).await {
                Ok(opened) => opened,
                Err(e) => {
                    error!("Failed to read meta of {} {} at {}: {}", role, neighbor, path, e);
                    for guard in guards {
                        WatchGuard::stop(guard).await;
                    }
                    return Err(e);
                }
            };

            let forwarder = MetaForwarder {
                task: self.task.clone(),
                epoch: self.epoch.clone(),
                task_id: self.task_id,
                role,
                neighbor,
                delivered: self
                    .delivered
                    .lock()
                    .entry((role, neighbor))
                    .or_insert_with(|| Arc::new(Mutex::new(DeliveredMeta::new(META_DEDUPE_WINDOW))))
                    .clone(),
            };
            guards.push(WatchGuard::spawn(format!("{} {} meta", role, neighbor), move |stop| {
                forwarder.run(watch, baseline, stop)
            }));
        }

        if !neighbors.is_empty() {
            info!("Task {} watching {} {}(s): {:?}", self.task_id, neighbors.len(), role, neighbors);
        }
        Ok(guards)
    }
}

struct MetaForwarder {
    task: Arc<dyn Task>,
    epoch: EpochCursor,
    task_id: u64,
    role: Role,
    neighbor: u64,
    delivered: Arc<Mutex<DeliveredMeta>>,
}

impl MetaForwarder {
    async fn run(self, mut watch: ResumableWatch, baseline: Option<Response>, mut stop: ShutdownListener) {
        if let Some(resp) = baseline {
            self.deliver(&resp);
        }
        while let Some(resp) = watch.next_until(&mut stop).await {
            if resp.action.is_write() || resp.action == Action::Get {
                self.deliver(&resp);
            }
        }
        debug!("Meta watch on {} stopped", watch.key());
    }

    fn deliver(&self, resp: &Response) {
        let meta = &resp.node.value;
        if !self.delivered.lock().insert(meta) {
            debug!("Meta {:?} from {} {} already delivered", meta, self.role, self.neighbor);
            return;
        }

        standard::META_DELIVERED.inc();
        let ctx = Context::new(self.task_id, self.epoch.get());
        match self.role {
            Role::Parent => self.task.parent_meta_ready(ctx, self.neighbor, meta),
            Role::Child => self.task.child_meta_ready(ctx, self.neighbor, meta),
        }
    }
}
