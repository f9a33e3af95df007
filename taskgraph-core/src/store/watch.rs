//! Resumable watches
//!
//! Every watcher in the framework (epoch, neighbor meta, liveness, standby)
//! follows the same pattern: read a baseline, then subscribe from the index
//! right after it so no write between the read and the subscription is
//! missed and the baseline itself is not delivered twice. This module is
//! the only place that bookkeeping lives.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{CoordinationStore, Response};
use crate::error::{Result, TaskGraphError};
use crate::runtime::{ShutdownListener, ShutdownSignal};

/// Longest pause between retries of a failing watch
const MAX_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Baseline read followed by an index-continued subscription
pub struct ResumableWatch {
    store: Arc<dyn CoordinationStore>,
    key: String,
    recursive: bool,
    next_index: u64,
}

impl ResumableWatch {
    /// Read the current value of `key` (a directory listing when
    /// `recursive`) and position the watch just past it.
    ///
    /// A missing key is not an error: the baseline is `None` and the watch
    /// starts right after the index the store reported with the miss, or at
    /// index 1 when the store did not report one.
    pub async fn open(
        store: Arc<dyn CoordinationStore>,
        key: impl Into<String>,
        recursive: bool,
    ) -> Result<(Self, Option<Response>)> {
        let key = key.into();
        let (baseline, next_index) = Self::read_baseline(store.as_ref(), &key, recursive).await?;
        debug!(
            "Watch on {} opened at index {} (baseline: {})",
            key,
            next_index,
            baseline.is_some()
        );
        Ok((
            Self {
                store,
                key,
                recursive,
                next_index,
            },
            baseline,
        ))
    }

    async fn read_baseline(
        store: &dyn CoordinationStore,
        key: &str,
        recursive: bool,
    ) -> Result<(Option<Response>, u64)> {
        let read = if recursive {
            store.list(key).await
        } else {
            store.get(key).await
        };
        match read {
            Ok(resp) => {
                let next = resp.index.max(resp.node.modified_index) + 1;
                Ok((Some(resp), next))
            }
            Err(TaskGraphError::KeyNotFound { index, .. }) => Ok((None, index + 1)),
            Err(e) => Err(e),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Index the next wait starts from
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Wait for the next change.
    ///
    /// If the store dropped the history this watch needed, the key is read
    /// again and the fresh value is returned as a `get` response; consumers
    /// must tolerate seeing a value they already handled.
    pub async fn next(&mut self) -> Result<Response> {
        loop {
            match self.store.wait(&self.key, self.next_index, self.recursive).await {
                Ok(resp) => {
                    self.next_index = resp.node.modified_index + 1;
                    return Ok(resp);
                }
                Err(TaskGraphError::EventIndexCleared { index, .. }) => {
                    warn!("Watch on {} lost history at index {}, resyncing", self.key, index);
                    let (baseline, next) =
                        Self::read_baseline(self.store.as_ref(), &self.key, self.recursive).await?;
                    self.next_index = next;
                    if let Some(resp) = baseline {
                        return Ok(resp);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Wait for the next change, retrying store failures with backoff.
    /// Returns `None` once `stop` fires.
    pub async fn next_until(&mut self, stop: &mut ShutdownListener) -> Option<Response> {
        let mut attempt = 0u32;
        loop {
            let failure = tokio::select! {
                _ = stop.recv() => return None,
                res = self.next() => match res {
                    Ok(resp) => return Some(resp),
                    Err(e) => e,
                },
            };

            attempt += 1;
            let delay = Duration::from_millis(100 * 2u64.pow(attempt.min(6))).min(MAX_RETRY_DELAY);
            warn!(
                "Watch on {} failed (attempt {}): {}; retrying in {:?}",
                self.key, attempt, failure, delay
            );
            tokio::select! {
                _ = stop.recv() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// A background forwarding task paired with its dedicated stop signal
pub struct WatchGuard {
    name: String,
    stop: ShutdownSignal,
    handle: JoinHandle<()>,
}

impl WatchGuard {
    /// Spawn `make(listener)` as a forwarding task. The listener is
    /// subscribed before the task starts, so a cancel can never be missed.
    pub fn spawn<F, Fut>(name: impl Into<String>, make: F) -> Self
    where
        F: FnOnce(ShutdownListener) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let stop = ShutdownSignal::new();
        let handle = tokio::spawn(make(stop.subscribe()));
        Self {
            name: name.into(),
            stop,
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Close the stop signal; the forwarding task exits at its next await
    pub fn cancel(&self) {
        self.stop.shutdown();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel and wait for the forwarding task to exit
    pub async fn stop(self) {
        self.stop.shutdown();
        if let Err(e) = self.handle.await {
            if !e.is_cancelled() {
                warn!("Watch task {} ended abnormally: {}", self.name, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Action, MemoryStore};

    #[tokio::test]
    async fn test_missing_key_watches_first_write() {
        let store = MemoryStore::new();
        store.set("/job/epoch", "0", None).await.unwrap();

        let (mut watch, baseline) = ResumableWatch::open(store.clone(), "/job/meta/1/child", false)
            .await
            .unwrap();
        assert!(baseline.is_none());
        assert_eq!(watch.next_index(), 2);

        store.set("/job/meta/1/child", "ready", None).await.unwrap();
        let resp = watch.next().await.unwrap();
        assert_eq!(resp.action, Action::Set);
        assert_eq!(resp.node.value, "ready");
    }

    #[tokio::test]
    async fn test_baseline_not_redelivered() {
        let store = MemoryStore::new();
        store.set("/job/meta/1/child", "a", None).await.unwrap();

        let (mut watch, baseline) = ResumableWatch::open(store.clone(), "/job/meta/1/child", false)
            .await
            .unwrap();
        assert_eq!(baseline.unwrap().node.value, "a");

        store.set("/job/meta/1/child", "b", None).await.unwrap();
        assert_eq!(watch.next().await.unwrap().node.value, "b");
    }

    #[tokio::test]
    async fn test_resync_after_history_loss() {
        let store = MemoryStore::new();
        store.set("/job/epoch", "0", None).await.unwrap();
        let (mut watch, _) = ResumableWatch::open(store.clone(), "/job/epoch", false)
            .await
            .unwrap();

        for i in 1..=(crate::store::memory::HISTORY_LIMIT as u64 + 5) {
            store.set("/job/epoch", &i.to_string(), None).await.unwrap();
        }

        let resp = watch.next().await.unwrap();
        assert_eq!(resp.action, Action::Get);
        assert_eq!(resp.node.value, (crate::store::memory::HISTORY_LIMIT + 5).to_string());
    }

    #[tokio::test]
    async fn test_guard_stop_unblocks_wait() {
        let store = MemoryStore::new();
        let (mut watch, _) = ResumableWatch::open(store.clone(), "/job/epoch", false)
            .await
            .unwrap();

        let guard = WatchGuard::spawn("epoch", move |mut stop| async move {
            while watch.next_until(&mut stop).await.is_some() {}
        });

        tokio::time::timeout(Duration::from_secs(1), guard.stop())
            .await
            .expect("stopping a blocked watch should not hang");
    }
}
