//! Error types for the task-graph framework
//!
//! Covers the coordination store, slot/epoch coordination, the data plane
//! and durable storage.

use thiserror::Error;

/// Primary error type for all framework operations
#[derive(Debug, Error)]
pub enum TaskGraphError {
    // ========== Coordination Store Errors ==========

    /// Key does not exist; `index` is the store index at the time of the read
    #[error("Key not found: {key} (store index {index})")]
    KeyNotFound { key: String, index: u64 },

    /// Conditional write rejected because the precondition did not hold
    #[error("Compare failed for {key}: {cause}")]
    CompareFailed { key: String, cause: String },

    /// Create rejected because the key already exists
    #[error("Key already exists: {key}")]
    NodeExists { key: String },

    /// Watch index fell out of the store's retained history
    #[error("Event index {index} cleared for {key}")]
    EventIndexCleared { key: String, index: u64 },

    /// Store could not be reached
    #[error("Coordination store at {endpoint} unavailable: {reason}")]
    StoreUnavailable { endpoint: String, reason: String },

    /// Store replied with something we could not interpret
    #[error("Malformed store response: {message}")]
    StoreProtocol { message: String },

    // ========== Coordination Errors ==========

    /// Every slot in the task directory is already claimed
    #[error("No unassigned task found for job {job}")]
    NoUnassignedTask { job: String },

    /// Standby gave up waiting for a slot
    #[error("Standby for job {job} timed out after {waited_secs}s")]
    StandbyTimeout { job: String, waited_secs: u64 },

    /// A stored value could not be parsed
    #[error("Corrupt entry at {key}: {reason}")]
    CorruptEntry { key: String, reason: String },

    /// Configuration rejected at startup
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // ========== Data Plane Errors ==========

    /// Network listener could not be started
    #[error("Listener on {addr} failed: {reason}")]
    ListenerFailed { addr: String, reason: String },

    /// Requesting task is neither a parent nor a child at the current epoch
    #[error("Task {task_id} is not a neighbor at epoch {epoch}")]
    NotNeighbor { task_id: u64, epoch: u64 },

    /// Data request to a neighbor failed
    #[error("Data request to task {task_id} failed: {reason}")]
    DataRequestFailed { task_id: u64, reason: String },

    /// Neighbor refused the data request with a client error status
    #[error("Data request to task {task_id} rejected with status {status}")]
    DataRequestRejected { task_id: u64, status: u16 },

    // ========== Durable Storage Errors ==========

    /// Object storage operation failed
    #[error("Storage operation failed: {message}")]
    StorageError { message: String },

    /// Object not found in storage
    #[error("Object not found: {key}")]
    ObjectNotFound { key: String },

    /// Local I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ========== Runtime Errors ==========

    /// Shutdown in progress
    #[error("Shutdown in progress")]
    ShutdownInProgress,

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl TaskGraphError {
    /// Returns true for the store's "key not found" condition
    pub fn is_key_not_found(&self) -> bool {
        matches!(self, TaskGraphError::KeyNotFound { .. })
    }

    /// Returns true if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TaskGraphError::StoreUnavailable { .. }
                | TaskGraphError::EventIndexCleared { .. }
                | TaskGraphError::StorageError { .. }
                | TaskGraphError::DataRequestFailed { .. }
        )
    }

    /// Returns true if this error indicates corrupted coordination state
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            TaskGraphError::CorruptEntry { .. } | TaskGraphError::StoreProtocol { .. }
        )
    }
}

/// Result type alias for framework operations
pub type Result<T> = std::result::Result<T, TaskGraphError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let missing = TaskGraphError::KeyNotFound { key: "/job/epoch".into(), index: 7 };
        assert!(missing.is_key_not_found());
        assert!(!missing.is_retryable());

        let down = TaskGraphError::StoreUnavailable {
            endpoint: "http://127.0.0.1:2379".into(),
            reason: "connection refused".into(),
        };
        assert!(down.is_retryable());

        let corrupt = TaskGraphError::CorruptEntry { key: "/job/slots/x".into(), reason: "nan".into() };
        assert!(corrupt.is_corruption());
        assert!(corrupt.to_string().contains("/job/slots/x"));
    }
}
