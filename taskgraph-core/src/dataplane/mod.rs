//! Inter-node data plane
//!
//! Tasks pull opaque byte payloads from their neighbors over HTTP. The
//! server side dispatches to `serve_as_parent`/`serve_as_child`; the client
//! side delivers answers through `parent_data_ready`/`child_data_ready`.

pub mod client;
pub mod server;

pub use client::{dispatch_responses, DataRequester, DataResponse};
pub use server::{router, serve, DataPlaneState};

/// Capacity of the queue between finished requests and the task
pub const DATA_RESPONSE_BUFFER: usize = 100;
