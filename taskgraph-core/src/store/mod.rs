//! Coordination store client
//!
//! The framework coordinates through an external linearizable key-value
//! service with hierarchical keys, conditional writes, expiring keys and
//! index-based watches. This module defines the surface the framework uses
//! and ships an in-process store plus an HTTP client for etcd's v2 keys API.

pub mod etcd;
pub mod keys;
pub mod memory;
pub mod watch;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::Result;

pub use etcd::{EtcdConfig, EtcdStore};
pub use keys::KeyLayout;
pub use memory::MemoryStore;
pub use watch::{ResumableWatch, WatchGuard};

/// Kind of change a store response describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Action {
    Get,
    Set,
    Create,
    Update,
    CompareAndSwap,
    Delete,
    CompareAndDelete,
    Expire,
}

impl Action {
    /// True for actions that leave a new value behind
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Action::Set | Action::Create | Action::Update | Action::CompareAndSwap
        )
    }

    /// True for actions that remove the key
    pub fn is_removal(&self) -> bool {
        matches!(
            self,
            Action::Delete | Action::CompareAndDelete | Action::Expire
        )
    }
}

/// A key (or directory) in the store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub dir: bool,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub created_index: u64,
    #[serde(default)]
    pub modified_index: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
}

impl Node {
    /// Last path segment of the key
    pub fn name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or("")
    }
}

/// Result of a store operation or a watch event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub action: Action,
    pub node: Node,
    #[serde(default)]
    pub prev_node: Option<Node>,
    /// Store-wide index when the response was produced
    #[serde(skip)]
    pub index: u64,
}

/// Preconditions for a compare-and-swap
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Precondition {
    pub prev_value: Option<String>,
    pub prev_index: Option<u64>,
}

impl Precondition {
    pub fn value(prev: impl Into<String>) -> Self {
        Self {
            prev_value: Some(prev.into()),
            prev_index: None,
        }
    }

    pub fn index(prev: u64) -> Self {
        Self {
            prev_value: None,
            prev_index: Some(prev),
        }
    }
}

/// Operations the framework needs from the coordination store.
///
/// Implementations must be safe for concurrent use: a single handle is
/// shared by the allocator and every watcher of a node.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Short name for logging
    fn name(&self) -> &'static str;

    /// Read a single key
    async fn get(&self, key: &str) -> Result<Response>;

    /// Read the direct children of a directory, sorted by key
    async fn list(&self, dir: &str) -> Result<Response>;

    /// Unconditionally write a key, optionally expiring after `ttl`
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<Response>;

    /// Write a key only if it does not exist yet
    async fn create(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<Response>;

    /// Atomically replace an existing key's value if `cond` holds
    async fn compare_and_swap(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        cond: &Precondition,
    ) -> Result<Response>;

    /// Remove a key, or a whole subtree when `recursive`
    async fn delete(&self, key: &str, recursive: bool) -> Result<Response>;

    /// Block until the first change to `key` (or below it, when
    /// `recursive`) with a modification index of at least `index`.
    /// An `index` of zero waits for the next change.
    async fn wait(&self, key: &str, index: u64, recursive: bool) -> Result<Response>;
}
