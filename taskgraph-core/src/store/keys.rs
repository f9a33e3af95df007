//! Key layout of a job inside the coordination store
//!
//! ```text
//! /{job}/epoch                 global epoch counter
//! /{job}/slots/{id}            claiming node's address, empty when free
//! /{job}/healthy/{id}          expiring liveness marker of the occupant
//! /{job}/meta/{id}/parent      meta task {id} publishes for its parents
//! /{job}/meta/{id}/child       meta task {id} publishes for its children
//! ```

/// Builds store keys for one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLayout {
    job: String,
}

impl KeyLayout {
    pub fn new(job: impl Into<String>) -> Self {
        Self { job: job.into() }
    }

    pub fn job(&self) -> &str {
        &self.job
    }

    pub fn root(&self) -> String {
        format!("/{}", self.job)
    }

    pub fn epoch(&self) -> String {
        format!("/{}/epoch", self.job)
    }

    pub fn slot_dir(&self) -> String {
        format!("/{}/slots", self.job)
    }

    pub fn slot(&self, task_id: u64) -> String {
        format!("/{}/slots/{}", self.job, task_id)
    }

    pub fn liveness_dir(&self) -> String {
        format!("/{}/healthy", self.job)
    }

    pub fn liveness(&self, task_id: u64) -> String {
        format!("/{}/healthy/{}", self.job, task_id)
    }

    /// Key a child writes for its parents to read
    pub fn parent_meta(&self, task_id: u64) -> String {
        format!("/{}/meta/{}/parent", self.job, task_id)
    }

    /// Key a parent writes for its children to read
    pub fn child_meta(&self, task_id: u64) -> String {
        format!("/{}/meta/{}/child", self.job, task_id)
    }

    /// Task ID encoded in the last segment of `key`, if numeric
    pub fn task_id_of(key: &str) -> Option<u64> {
        key.rsplit('/').next().and_then(|s| s.parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let keys = KeyLayout::new("wordcount");
        assert_eq!(keys.slot(3), "/wordcount/slots/3");
        assert_eq!(keys.liveness(3), "/wordcount/healthy/3");
        assert_eq!(keys.child_meta(0), "/wordcount/meta/0/child");
        assert_eq!(keys.parent_meta(0), "/wordcount/meta/0/parent");
        assert!(keys.slot(3).starts_with(&keys.slot_dir()));
    }

    #[test]
    fn test_task_id_of() {
        assert_eq!(KeyLayout::task_id_of("/job/healthy/12"), Some(12));
        assert_eq!(KeyLayout::task_id_of("/job/healthy/abc"), None);
        assert_eq!(KeyLayout::task_id_of(""), None);
    }
}
