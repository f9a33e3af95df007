//! Data-plane client
//!
//! Pulls data from a neighbor's `/datareq` endpoint. Requests are fired in
//! the background; finished responses are queued on a bounded channel and
//! dispatched to the task by [`dispatch_responses`].

use bytes::Bytes;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::coordinator::EpochCursor;
use crate::error::{Result, TaskGraphError};
use crate::runtime::ShutdownListener;
use crate::store::{CoordinationStore, KeyLayout};
use crate::task::{Context, Task};
use crate::topology::{Role, Topology};

/// A neighbor's answer to one of our data requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataResponse {
    pub from_id: u64,
    pub req: String,
    pub data: Bytes,
}

/// Issues data requests on behalf of the local task
#[derive(Clone)]
pub struct DataRequester {
    inner: Arc<RequesterInner>,
}

struct RequesterInner {
    http: Client,
    store: Arc<dyn CoordinationStore>,
    keys: KeyLayout,
    task_id: u64,
    retries: u32,
    responses: mpsc::Sender<DataResponse>,
}

impl DataRequester {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        keys: KeyLayout,
        task_id: u64,
        retries: u32,
        request_timeout: Duration,
        responses: mpsc::Sender<DataResponse>,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| TaskGraphError::Internal {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            inner: Arc::new(RequesterInner {
                http,
                store,
                keys,
                task_id,
                retries: retries.max(1),
                responses,
            }),
        })
    }

    /// Ask `to_id` for data without waiting. The answer arrives later as a
    /// `DataResponse`; failures after all retries are logged and dropped.
    pub fn request(&self, to_id: u64, req: impl Into<String>) {
        let this = self.clone();
        let req = req.into();
        tokio::spawn(async move {
            match this.fetch_with_retry(to_id, &req).await {
                Ok(data) => {
                    let resp = DataResponse {
                        from_id: to_id,
                        req,
                        data,
                    };
                    if this.inner.responses.send(resp).await.is_err() {
                        debug!("Response receiver gone, dropping data from task {}", to_id);
                    }
                }
                Err(e) => error!(
                    "Data request {:?} from task {} to task {} abandoned: {}",
                    req, this.inner.task_id, to_id, e
                ),
            }
        });
    }

    /// Fetch with exponential backoff between retryable failures
    pub async fn fetch_with_retry(&self, to_id: u64, req: &str) -> Result<Bytes> {
        let retries = self.inner.retries;
        let mut attempt = 0;
        loop {
            match self.fetch(to_id, req).await {
                Ok(data) => return Ok(data),
                Err(e) if e.is_retryable() && attempt + 1 < retries => {
                    let delay = Duration::from_millis(100 * 2u64.pow(attempt));
                    warn!(
                        "Data request to task {} failed (attempt {}/{}): {}; retrying in {:?}",
                        to_id,
                        attempt + 1,
                        retries,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Single attempt: resolve the neighbor's address and read the body
    pub async fn fetch(&self, to_id: u64, req: &str) -> Result<Bytes> {
        let addr = self.resolve(to_id).await?;
        let url = format!("http://{}/datareq", addr);
        let failed = |reason: String| TaskGraphError::DataRequestFailed {
            task_id: to_id,
            reason,
        };

        let resp = self
            .inner
            .http
            .get(&url)
            .query(&[("taskID", self.inner.task_id.to_string().as_str()), ("req", req)])
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;

        let status = resp.status();
        if status.is_client_error() {
            return Err(TaskGraphError::DataRequestRejected {
                task_id: to_id,
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(failed(format!("status {}", status)));
        }

        resp.bytes()
            .await
            .map_err(|e| failed(format!("reading body: {}", e)))
    }

    /// Address of the node currently occupying `to_id`'s slot
    async fn resolve(&self, to_id: u64) -> Result<String> {
        let key = self.inner.keys.slot(to_id);
        let slot = match self.inner.store.get(&key).await {
            Ok(resp) => resp.node.value,
            Err(e) if e.is_key_not_found() => String::new(),
            Err(e) => return Err(e),
        };
        if slot.is_empty() {
            // Vacant while a standby takes over; worth retrying
            return Err(TaskGraphError::DataRequestFailed {
                task_id: to_id,
                reason: format!("slot {} has no occupant", key),
            });
        }
        Ok(slot)
    }
}

/// Hand queued responses to the task until `stop` fires or every
/// requester is gone.
pub async fn dispatch_responses(
    mut responses: mpsc::Receiver<DataResponse>,
    task: Arc<dyn Task>,
    topology: Arc<dyn Topology>,
    epoch: EpochCursor,
    task_id: u64,
    mut stop: ShutdownListener,
) {
    loop {
        let resp = tokio::select! {
            _ = stop.recv() => break,
            resp = responses.recv() => match resp {
                Some(resp) => resp,
                None => break,
            },
        };

        let current = epoch.get();
        let ctx = Context::new(task_id, current);
        match topology.role_of(current, resp.from_id) {
            Some(Role::Parent) => task.parent_data_ready(ctx, resp.from_id, &resp.req, resp.data),
            Some(Role::Child) => task.child_data_ready(ctx, resp.from_id, &resp.req, resp.data),
            None => warn!(
                "Dropping data from task {}: no longer a neighbor at epoch {}",
                resp.from_id, current
            ),
        }
    }
    debug!("Data response dispatcher for task {} stopped", task_id);
}
