//! TaskGraph Core - coordination runtime for distributed task graphs
//!
//! Each participating node runs this crate to:
//! - Claim a task slot in the job, or stand by until one frees up
//! - Follow the job's global epoch
//! - Deliver neighbor meta to its task exactly once per value
//! - Heartbeat, and free the slots of peers that stop heartbeating
//! - Serve and issue data requests between neighboring tasks

pub mod config;
pub mod controller;
pub mod coordinator;
pub mod dataplane;
pub mod error;
pub mod framework;
pub mod metrics;
pub mod runtime;
pub mod storage;
pub mod store;
pub mod task;
pub mod testing;
pub mod topology;

pub use config::NodeConfig;
pub use controller::JobController;
pub use coordinator::{Bootstrap, NodePhase};
pub use error::{Result, TaskGraphError};
pub use framework::FrameworkHandle;
pub use task::{Context, Task, TaskBuilder};
pub use topology::{Role, Topology, TreeTopology};

/// Default liveness marker refresh period in milliseconds
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 2_000;

/// Default liveness marker lifetime in milliseconds
pub const DEFAULT_LIVENESS_TTL_MS: u64 = 6_000;

/// Default capacity of a served response's chunk channel
pub const DEFAULT_DATA_CHUNK_BUFFER: usize = 16;
