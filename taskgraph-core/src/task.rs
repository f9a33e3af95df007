//! Task contract
//!
//! Application logic plugs into the framework by implementing [`Task`].
//! The framework drives every callback from its own background tasks, so
//! all of them must return promptly: a blocking metadata callback stalls
//! that neighbor's stream, and a blocking `set_epoch` back-pressures epoch
//! delivery for the whole node.

use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::framework::FrameworkHandle;

/// Per-callback context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Context {
    task_id: u64,
    epoch: u64,
}

impl Context {
    pub fn new(task_id: u64, epoch: u64) -> Self {
        Self { task_id, epoch }
    }

    /// Task this callback is addressed to
    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    /// Epoch the node was in when the callback was dispatched
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

/// A computing unit occupying one slot of the task graph.
pub trait Task: Send + Sync {
    /// Bring the task up to speed, from scratch or after taking over a
    /// failed node's slot. Called before any other callback.
    fn init(&self, task_id: u64, framework: FrameworkHandle);

    /// Last chance to save task specific work before the node releases.
    fn exit(&self);

    /// The global epoch changed (or was read for the first time).
    fn set_epoch(&self, ctx: Context, epoch: u64);

    /// A parent published new meta for its children. Fires at most once
    /// per distinct value per parent.
    fn parent_meta_ready(&self, ctx: Context, parent_id: u64, meta: &str);

    /// A child published new meta for its parents. Fires at most once per
    /// distinct value per child.
    fn child_meta_ready(&self, ctx: Context, child_id: u64, meta: &str);

    /// Response to a data request previously sent to a parent.
    fn parent_data_ready(&self, ctx: Context, parent_id: u64, req: &str, resp: Bytes);

    /// Response to a data request previously sent to a child.
    fn child_data_ready(&self, ctx: Context, child_id: u64, req: &str, resp: Bytes);

    /// A child asked this task for data. Push response chunks into `data`;
    /// dropping the sender ends the response.
    fn serve_as_parent(&self, from_id: u64, req: &str, data: mpsc::Sender<Bytes>);

    /// A parent asked this task for data. Push response chunks into `data`;
    /// dropping the sender ends the response.
    fn serve_as_child(&self, from_id: u64, req: &str, data: mpsc::Sender<Bytes>);
}

/// Produces the task implementation for a claimed slot
pub trait TaskBuilder: Send + Sync {
    fn build(&self, task_id: u64) -> Arc<dyn Task>;
}

impl<F> TaskBuilder for F
where
    F: Fn(u64) -> Arc<dyn Task> + Send + Sync,
{
    fn build(&self, task_id: u64) -> Arc<dyn Task> {
        self(task_id)
    }
}
