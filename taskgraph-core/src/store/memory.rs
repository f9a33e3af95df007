//! In-process coordination store
//!
//! Linearizable single-process implementation of [`CoordinationStore`]:
//! one global modification index, TTL expiry that emits `expire` events,
//! and a bounded event history backing index-based waits.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, trace};

use super::{Action, CoordinationStore, Node, Precondition, Response};
use crate::error::{Result, TaskGraphError};

/// Number of events retained for `wait`
pub const HISTORY_LIMIT: usize = 1000;

/// How often the background reaper expires keys
const REAPER_INTERVAL: Duration = Duration::from_millis(20);

struct Entry {
    value: String,
    created_index: u64,
    modified_index: u64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn to_node(&self, key: &str) -> Node {
        Node {
            key: key.to_string(),
            value: self.value.clone(),
            dir: false,
            nodes: Vec::new(),
            created_index: self.created_index,
            modified_index: self.modified_index,
            ttl: self.expires_at.map(|at| {
                at.saturating_duration_since(Instant::now()).as_secs() as i64
            }),
        }
    }
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<String, Entry>,
    index: u64,
    history: VecDeque<Response>,
    /// Highest index evicted from `history`
    cleared_through: u64,
}

impl Inner {
    fn record(&mut self, resp: Response) {
        self.history.push_back(resp);
        while self.history.len() > HISTORY_LIMIT {
            if let Some(evicted) = self.history.pop_front() {
                self.cleared_through = evicted.node.modified_index;
            }
        }
    }

    fn purge_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at.is_some_and(|at| at <= now))
            .map(|(k, _)| k.clone())
            .collect();

        for key in expired {
            if let Some(entry) = self.entries.remove(&key) {
                self.index += 1;
                debug!("Key {} expired at index {}", key, self.index);
                let prev = entry.to_node(&key);
                self.record(Response {
                    action: Action::Expire,
                    node: Node {
                        key,
                        created_index: entry.created_index,
                        modified_index: self.index,
                        ..Default::default()
                    },
                    prev_node: Some(prev),
                    index: self.index,
                });
            }
        }
    }

    fn write(
        &mut self,
        action: Action,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Response {
        self.index += 1;
        let prev = self.entries.get(key).map(|e| e.to_node(key));
        let created_index = prev.as_ref().map(|p| p.created_index).unwrap_or(self.index);
        let entry = Entry {
            value: value.to_string(),
            created_index,
            modified_index: self.index,
            expires_at: ttl.map(|t| Instant::now() + t),
        };
        let node = entry.to_node(key);
        self.entries.insert(key.to_string(), entry);

        let resp = Response {
            action,
            node,
            prev_node: prev,
            index: self.index,
        };
        self.record(resp.clone());
        resp
    }

    fn remove(&mut self, key: &str) -> Option<Response> {
        let entry = self.entries.remove(key)?;
        self.index += 1;
        let resp = Response {
            action: Action::Delete,
            node: Node {
                key: key.to_string(),
                created_index: entry.created_index,
                modified_index: self.index,
                ..Default::default()
            },
            prev_node: Some(entry.to_node(key)),
            index: self.index,
        };
        self.record(resp.clone());
        Some(resp)
    }

    fn not_found(&self, key: &str) -> TaskGraphError {
        TaskGraphError::KeyNotFound {
            key: key.to_string(),
            index: self.index,
        }
    }

    fn scan(&self, key: &str, index: u64, recursive: bool) -> Result<Option<Response>> {
        if index <= self.cleared_through {
            return Err(TaskGraphError::EventIndexCleared {
                key: key.to_string(),
                index,
            });
        }
        let prefix = format!("{}/", key.trim_end_matches('/'));
        Ok(self
            .history
            .iter()
            .filter(|r| r.node.modified_index >= index)
            .find(|r| r.node.key == key || (recursive && r.node.key.starts_with(&prefix)))
            .cloned())
    }
}

/// In-process coordination store
pub struct MemoryStore {
    inner: Mutex<Inner>,
    index_tx: watch::Sender<u64>,
}

impl MemoryStore {
    /// Create a store. When called inside a Tokio runtime a background
    /// reaper is spawned so expiring keys fire without further traffic.
    pub fn new() -> Arc<Self> {
        let (index_tx, _) = watch::channel(0);
        let store = Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            index_tx,
        });

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let weak = Arc::downgrade(&store);
            handle.spawn(async move {
                let mut tick = tokio::time::interval(REAPER_INTERVAL);
                loop {
                    tick.tick().await;
                    match weak.upgrade() {
                        Some(store) => store.with_inner(|_| ()),
                        None => break,
                    }
                }
            });
        }

        store
    }

    /// Current store-wide index
    pub fn index(&self) -> u64 {
        self.inner.lock().index
    }

    /// Run `f` against the state after expiring stale keys, then wake
    /// waiters if anything changed.
    fn with_inner<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> T {
        let (out, before, after) = {
            let mut inner = self.inner.lock();
            let before = inner.index;
            inner.purge_expired(Instant::now());
            let out = f(&mut *inner);
            (out, before, inner.index)
        };
        if after != before {
            self.index_tx.send_replace(after);
        }
        out
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Response> {
        self.with_inner(|inner| match inner.entries.get(key) {
            Some(entry) => Ok(Response {
                action: Action::Get,
                node: entry.to_node(key),
                prev_node: None,
                index: inner.index,
            }),
            None => Err(inner.not_found(key)),
        })
    }

    async fn list(&self, dir: &str) -> Result<Response> {
        self.with_inner(|inner| {
            let prefix = format!("{}/", dir.trim_end_matches('/'));
            let mut nodes: Vec<Node> = Vec::new();

            for (key, entry) in inner.entries.range(prefix.clone()..) {
                let Some(rest) = key.strip_prefix(&prefix) else {
                    break;
                };
                match rest.split_once('/') {
                    None => nodes.push(entry.to_node(key)),
                    Some((child, _)) => {
                        let child_key = format!("{}{}", prefix, child);
                        if nodes.last().map(|n| n.key.as_str()) != Some(child_key.as_str()) {
                            nodes.push(Node {
                                key: child_key,
                                dir: true,
                                ..Default::default()
                            });
                        }
                    }
                }
            }

            if nodes.is_empty() {
                return Err(inner.not_found(dir));
            }
            Ok(Response {
                action: Action::Get,
                node: Node {
                    key: dir.to_string(),
                    dir: true,
                    nodes,
                    ..Default::default()
                },
                prev_node: None,
                index: inner.index,
            })
        })
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<Response> {
        Ok(self.with_inner(|inner| inner.write(Action::Set, key, value, ttl)))
    }

    async fn create(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<Response> {
        self.with_inner(|inner| {
            if inner.entries.contains_key(key) {
                return Err(TaskGraphError::NodeExists { key: key.to_string() });
            }
            Ok(inner.write(Action::Create, key, value, ttl))
        })
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        cond: &Precondition,
    ) -> Result<Response> {
        self.with_inner(|inner| {
            let entry = inner.entries.get(key).ok_or_else(|| inner.not_found(key))?;

            if let Some(prev) = &cond.prev_value {
                if &entry.value != prev {
                    return Err(TaskGraphError::CompareFailed {
                        key: key.to_string(),
                        cause: format!("[{} != {}]", prev, entry.value),
                    });
                }
            }
            if let Some(prev) = cond.prev_index {
                if entry.modified_index != prev {
                    return Err(TaskGraphError::CompareFailed {
                        key: key.to_string(),
                        cause: format!("[{} != {}]", prev, entry.modified_index),
                    });
                }
            }

            trace!("compareAndSwap {} -> {:?}", key, value);
            Ok(inner.write(Action::CompareAndSwap, key, value, ttl))
        })
    }

    async fn delete(&self, key: &str, recursive: bool) -> Result<Response> {
        self.with_inner(|inner| {
            let mut last = inner.remove(key);
            if recursive {
                let prefix = format!("{}/", key.trim_end_matches('/'));
                let below: Vec<String> = inner
                    .entries
                    .range(prefix.clone()..)
                    .take_while(|(k, _)| k.starts_with(&prefix))
                    .map(|(k, _)| k.clone())
                    .collect();
                for child in below {
                    last = inner.remove(&child).or(last);
                }
            }
            last.ok_or_else(|| inner.not_found(key))
        })
    }

    async fn wait(&self, key: &str, index: u64, recursive: bool) -> Result<Response> {
        let mut changes = self.index_tx.subscribe();
        let from = if index == 0 { self.index() + 1 } else { index };

        loop {
            changes.borrow_and_update();
            if let Some(resp) = self.with_inner(|inner| inner.scan(key, from, recursive))? {
                return Ok(resp);
            }
            if changes.changed().await.is_err() {
                return Err(TaskGraphError::ShutdownInProgress);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_compare_and_swap_claims_once() {
        let store = MemoryStore::new();
        store.set("/job/slots/0", "", None).await.unwrap();

        let claim = Precondition::value("");
        store
            .compare_and_swap("/job/slots/0", "10.0.0.1:7000", None, &claim)
            .await
            .unwrap();
        let second = store
            .compare_and_swap("/job/slots/0", "10.0.0.2:7000", None, &claim)
            .await;
        assert!(matches!(second, Err(TaskGraphError::CompareFailed { .. })));

        let resp = store.get("/job/slots/0").await.unwrap();
        assert_eq!(resp.node.value, "10.0.0.1:7000");
    }

    #[tokio::test]
    async fn test_missing_key_reports_index() {
        let store = MemoryStore::new();
        store.set("/job/epoch", "0", None).await.unwrap();

        match store.get("/job/meta/1/child").await {
            Err(TaskGraphError::KeyNotFound { index, .. }) => assert_eq!(index, 1),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_list_groups_subdirectories() {
        let store = MemoryStore::new();
        store.set("/job/slots/1", "", None).await.unwrap();
        store.set("/job/slots/0", "a", None).await.unwrap();
        store.set("/job/meta/0/child", "x", None).await.unwrap();
        store.set("/job/meta/0/parent", "y", None).await.unwrap();

        let slots = store.list("/job/slots").await.unwrap();
        let names: Vec<&str> = slots.node.nodes.iter().map(|n| n.name()).collect();
        assert_eq!(names, vec!["0", "1"]);

        let meta = store.list("/job/meta").await.unwrap();
        assert_eq!(meta.node.nodes.len(), 1);
        assert!(meta.node.nodes[0].dir);

        assert!(store.list("/job/healthy").await.unwrap_err().is_key_not_found());
    }

    #[tokio::test]
    async fn test_wait_replays_history() {
        let store = MemoryStore::new();
        let first = store.set("/job/epoch", "0", None).await.unwrap();
        store.set("/job/epoch", "1", None).await.unwrap();

        let resp = store.wait("/job/epoch", first.index + 1, false).await.unwrap();
        assert_eq!(resp.node.value, "1");
        assert_eq!(resp.action, Action::Set);
    }

    #[tokio::test]
    async fn test_wait_blocks_until_write() {
        let store = MemoryStore::new();
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.wait("/job/healthy", 0, true).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.set("/job/healthy/3", "addr", None).await.unwrap();

        let resp = waiter.await.unwrap().unwrap();
        assert_eq!(resp.node.key, "/job/healthy/3");
    }

    #[tokio::test]
    async fn test_ttl_expiry_emits_event() {
        let store = MemoryStore::new();
        let resp = store
            .set("/job/healthy/0", "addr", Some(Duration::from_millis(50)))
            .await
            .unwrap();

        let event = tokio::time::timeout(
            Duration::from_secs(2),
            store.wait("/job/healthy", resp.index + 1, true),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(event.action, Action::Expire);
        assert_eq!(event.prev_node.unwrap().value, "addr");
        assert!(store.get("/job/healthy/0").await.unwrap_err().is_key_not_found());
    }

    #[tokio::test]
    async fn test_evicted_history_is_reported() {
        let store = MemoryStore::new();
        for i in 0..(HISTORY_LIMIT + 10) {
            store.set("/job/epoch", &i.to_string(), None).await.unwrap();
        }
        let err = store.wait("/job/epoch", 1, false).await.unwrap_err();
        assert!(matches!(err, TaskGraphError::EventIndexCleared { .. }));
    }

    #[tokio::test]
    async fn test_recursive_delete() {
        let store = MemoryStore::new();
        store.set("/job/slots/0", "", None).await.unwrap();
        store.set("/job/epoch", "0", None).await.unwrap();

        store.delete("/job", true).await.unwrap();
        assert!(store.get("/job/epoch").await.unwrap_err().is_key_not_found());
        assert!(store.delete("/job", true).await.unwrap_err().is_key_not_found());
    }
}
