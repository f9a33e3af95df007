//! Async runtime helpers
//!
//! Stop signals shared by the node's background tasks.

pub mod shutdown;

pub use shutdown::{ShutdownListener, ShutdownSignal};
