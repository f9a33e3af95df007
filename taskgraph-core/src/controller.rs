//! Job controller
//!
//! Lays out a job in the coordination store before nodes start, drives
//! the global epoch and tears the layout down afterwards.

use std::sync::Arc;
use tracing::info;

use crate::coordinator::parse_epoch;
use crate::error::{Result, TaskGraphError};
use crate::store::{CoordinationStore, KeyLayout, Precondition};

pub struct JobController {
    store: Arc<dyn CoordinationStore>,
    keys: KeyLayout,
    num_tasks: u64,
}

impl JobController {
    pub fn new(store: Arc<dyn CoordinationStore>, job: impl Into<String>, num_tasks: u64) -> Self {
        Self {
            store,
            keys: KeyLayout::new(job),
            num_tasks,
        }
    }

    pub fn keys(&self) -> &KeyLayout {
        &self.keys
    }

    /// Create `num_tasks` free slots and set the epoch to 0.
    /// Fails with `NodeExists` if the job is already laid out.
    pub async fn init_layout(&self) -> Result<()> {
        for task_id in 0..self.num_tasks {
            self.store.create(&self.keys.slot(task_id), "", None).await?;
        }
        self.store.create(&self.keys.epoch(), "0", None).await?;
        info!("Laid out job {} with {} tasks", self.keys.job(), self.num_tasks);
        Ok(())
    }

    /// Current epoch of the job
    pub async fn epoch(&self) -> Result<u64> {
        let resp = self.store.get(&self.keys.epoch()).await?;
        parse_epoch(&resp.node)
    }

    /// Move the job to the next epoch and return it
    pub async fn advance_epoch(&self) -> Result<u64> {
        loop {
            let current = self.epoch().await?;
            let next = current + 1;
            match self
                .store
                .compare_and_swap(
                    &self.keys.epoch(),
                    &next.to_string(),
                    None,
                    &Precondition::value(current.to_string()),
                )
                .await
            {
                Ok(_) => {
                    info!("Job {} advanced to epoch {}", self.keys.job(), next);
                    return Ok(next);
                }
                // A task advanced it concurrently; read again
                Err(TaskGraphError::CompareFailed { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Remove everything under the job's root
    pub async fn destroy_layout(&self) -> Result<()> {
        match self.store.delete(&self.keys.root(), true).await {
            Ok(_) => {}
            Err(e) if e.is_key_not_found() => {}
            Err(e) => return Err(e),
        }
        info!("Destroyed layout of job {}", self.keys.job());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_layout_lifecycle() {
        let store = MemoryStore::new();
        let controller = JobController::new(store.clone(), "wordcount", 3);
        controller.init_layout().await.unwrap();

        let slots = store.list("/wordcount/slots").await.unwrap();
        assert_eq!(slots.node.nodes.len(), 3);
        assert!(slots.node.nodes.iter().all(|n| n.value.is_empty()));
        assert_eq!(controller.epoch().await.unwrap(), 0);

        assert!(matches!(
            controller.init_layout().await,
            Err(TaskGraphError::NodeExists { .. })
        ));

        assert_eq!(controller.advance_epoch().await.unwrap(), 1);
        assert_eq!(controller.advance_epoch().await.unwrap(), 2);

        controller.destroy_layout().await.unwrap();
        assert!(store.get("/wordcount/epoch").await.unwrap_err().is_key_not_found());
        controller.destroy_layout().await.unwrap();
    }
}
