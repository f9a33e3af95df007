//! Test doubles
//!
//! A [`Task`] that records every callback, and a builder handing out one
//! per claimed slot. Used by the unit tests, the integration tests and the
//! demo node.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::framework::FrameworkHandle;
use crate::task::{Context, Task, TaskBuilder};

/// One recorded callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    Init { task_id: u64 },
    Exit,
    SetEpoch(u64),
    ParentMeta { parent_id: u64, meta: String },
    ChildMeta { child_id: u64, meta: String },
    ParentData { parent_id: u64, req: String, data: Bytes },
    ChildData { child_id: u64, req: String, data: Bytes },
    ServeAsParent { from_id: u64, req: String },
    ServeAsChild { from_id: u64, req: String },
}

/// Records callbacks and answers data requests with fixed chunks
#[derive(Default)]
pub struct RecordingTask {
    events: Mutex<Vec<TaskEvent>>,
    framework: Mutex<Option<FrameworkHandle>>,
    chunks: Vec<Bytes>,
    /// How long `init` blocks, like a task restoring a checkpoint
    init_delay: Duration,
}

impl RecordingTask {
    /// Answer every data request with `chunks`, pushed in order
    pub fn with_chunks<I, C>(chunks: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Bytes>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn events(&self) -> Vec<TaskEvent> {
        self.events.lock().clone()
    }

    /// Epochs passed to `set_epoch`, in call order
    pub fn epochs(&self) -> Vec<u64> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                TaskEvent::SetEpoch(epoch) => Some(*epoch),
                _ => None,
            })
            .collect()
    }

    /// Handle received in `init`
    pub fn framework(&self) -> Option<FrameworkHandle> {
        self.framework.lock().clone()
    }

    /// Poll until `pred` holds over the recorded events or `timeout` passes.
    /// `pred` sees a snapshot, so it may call back into this task.
    pub async fn wait_for<F>(&self, pred: F, timeout: Duration) -> bool
    where
        F: Fn(&[TaskEvent]) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if pred(&self.events()) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn record(&self, event: TaskEvent) {
        self.events.lock().push(event);
    }

    fn push_chunks(&self, data: mpsc::Sender<Bytes>) {
        let chunks = self.chunks.clone();
        tokio::spawn(async move {
            for chunk in chunks {
                if data.send(chunk).await.is_err() {
                    break;
                }
            }
        });
    }
}

impl Task for RecordingTask {
    fn init(&self, task_id: u64, framework: FrameworkHandle) {
        if !self.init_delay.is_zero() {
            std::thread::sleep(self.init_delay);
        }
        *self.framework.lock() = Some(framework);
        self.record(TaskEvent::Init { task_id });
    }

    fn exit(&self) {
        self.record(TaskEvent::Exit);
    }

    fn set_epoch(&self, _ctx: Context, epoch: u64) {
        self.record(TaskEvent::SetEpoch(epoch));
    }

    fn parent_meta_ready(&self, _ctx: Context, parent_id: u64, meta: &str) {
        self.record(TaskEvent::ParentMeta {
            parent_id,
            meta: meta.to_string(),
        });
    }

    fn child_meta_ready(&self, _ctx: Context, child_id: u64, meta: &str) {
        self.record(TaskEvent::ChildMeta {
            child_id,
            meta: meta.to_string(),
        });
    }

    fn parent_data_ready(&self, _ctx: Context, parent_id: u64, req: &str, resp: Bytes) {
        self.record(TaskEvent::ParentData {
            parent_id,
            req: req.to_string(),
            data: resp,
        });
    }

    fn child_data_ready(&self, _ctx: Context, child_id: u64, req: &str, resp: Bytes) {
        self.record(TaskEvent::ChildData {
            child_id,
            req: req.to_string(),
            data: resp,
        });
    }

    fn serve_as_parent(&self, from_id: u64, req: &str, data: mpsc::Sender<Bytes>) {
        self.record(TaskEvent::ServeAsParent {
            from_id,
            req: req.to_string(),
        });
        self.push_chunks(data);
    }

    fn serve_as_child(&self, from_id: u64, req: &str, data: mpsc::Sender<Bytes>) {
        self.record(TaskEvent::ServeAsChild {
            from_id,
            req: req.to_string(),
        });
        self.push_chunks(data);
    }
}

/// Hands out a [`RecordingTask`] per slot and keeps them for inspection
#[derive(Default)]
pub struct RecordingTaskBuilder {
    chunks: Vec<Bytes>,
    init_delay: Duration,
    built: Mutex<HashMap<u64, Arc<RecordingTask>>>,
}

impl RecordingTaskBuilder {
    pub fn with_chunks<I, C>(chunks: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Bytes>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Every task built blocks in `init` for `delay`
    pub fn with_init_delay(mut self, delay: Duration) -> Self {
        self.init_delay = delay;
        self
    }

    /// Task most recently built for `task_id`
    pub fn task(&self, task_id: u64) -> Option<Arc<RecordingTask>> {
        self.built.lock().get(&task_id).cloned()
    }
}

impl TaskBuilder for RecordingTaskBuilder {
    fn build(&self, task_id: u64) -> Arc<dyn Task> {
        let task = Arc::new(RecordingTask {
            chunks: self.chunks.clone(),
            init_delay: self.init_delay,
            ..Default::default()
        });
        self.built.lock().insert(task_id, task.clone());
        task
    }
}
