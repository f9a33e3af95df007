//! Data-plane HTTP server
//!
//! `GET /datareq?taskID=<id>&req=<string>` streams whatever the task pushes
//! into its response channel. The requester must be a parent or a child of
//! this task at the current epoch.

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::coordinator::EpochCursor;
use crate::error::{Result, TaskGraphError};
use crate::metrics::{self, standard};
use crate::runtime::ShutdownListener;
use crate::task::Task;
use crate::topology::{Role, Topology};

/// Everything a request handler needs
#[derive(Clone)]
pub struct DataPlaneState {
    pub task: Arc<dyn Task>,
    pub topology: Arc<dyn Topology>,
    pub epoch: EpochCursor,
    /// Capacity of each response's chunk channel
    pub chunk_buffer: usize,
}

#[derive(Debug, Deserialize)]
pub struct DataRequestParams {
    #[serde(rename = "taskID")]
    pub task_id: u64,
    pub req: String,
}

pub fn router(state: DataPlaneState) -> Router {
    Router::new()
        .route("/datareq", get(serve_data_request))
        .route("/metrics", get(serve_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn serve_data_request(
    State(state): State<DataPlaneState>,
    Query(params): Query<DataRequestParams>,
) -> Response {
    let epoch = state.epoch.get();
    let Some(role) = state.topology.role_of(epoch, params.task_id) else {
        warn!("Rejecting data request from task {} at epoch {}", params.task_id, epoch);
        let err = TaskGraphError::NotNeighbor {
            task_id: params.task_id,
            epoch,
        };
        return (StatusCode::BAD_REQUEST, err.to_string()).into_response();
    };

    let (tx, rx) = mpsc::channel::<Bytes>(state.chunk_buffer.max(1));
    let task = state.task.clone();
    let from = params.task_id;
    let req = params.req;
    debug!("Serving {:?} to {} {}", req, role, from);

    // The callback may push synchronously or hand the sender to its own task
    tokio::task::spawn_blocking(move || match role {
        // The requester is our parent, so we answer as its child
        Role::Parent => task.serve_as_child(from, &req, tx),
        Role::Child => task.serve_as_parent(from, &req, tx),
    });

    standard::DATA_REQUESTS_SERVED.inc();
    let started = Instant::now();
    let chunks = futures::stream::unfold(rx, move |mut rx| async move {
        match rx.recv().await {
            Some(chunk) => Some((Ok::<_, Infallible>(chunk), rx)),
            None => {
                standard::DATA_REQUEST_DURATION.observe(started.elapsed());
                None
            }
        }
    });

    Body::from_stream(chunks).into_response()
}

async fn serve_metrics() -> String {
    metrics::gather_system_metrics()
}

/// Serve the data plane on `listener` until `stop` fires
pub async fn serve(
    listener: TcpListener,
    state: DataPlaneState,
    mut stop: ShutdownListener,
) -> Result<()> {
    let addr = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "<unknown>".into());
    info!("Serving data plane on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { stop.recv().await })
        .await
        .map_err(|e| TaskGraphError::ListenerFailed {
            addr,
            reason: e.to_string(),
        })
}
