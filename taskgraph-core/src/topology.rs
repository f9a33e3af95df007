//! Task graph topology
//!
//! Maps an epoch to the parent and child sets of the local task.

/// Relationship of a neighbor to the local task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// The neighbor is one of our parents
    Parent,
    /// The neighbor is one of our children
    Child,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Parent => write!(f, "parent"),
            Role::Child => write!(f, "child"),
        }
    }
}

/// Topology of the task graph as seen from one task
pub trait Topology: Send + Sync {
    /// Bind the topology to the local task. Called once, before any query.
    fn set_task_id(&mut self, task_id: u64);

    fn parents(&self, epoch: u64) -> Vec<u64>;

    fn children(&self, epoch: u64) -> Vec<u64>;

    /// How `task_id` relates to the local task at `epoch`, if at all.
    /// A task that is both parent and child resolves as a parent.
    fn role_of(&self, epoch: u64, task_id: u64) -> Option<Role> {
        if self.parents(epoch).contains(&task_id) {
            Some(Role::Parent)
        } else if self.children(epoch).contains(&task_id) {
            Some(Role::Child)
        } else {
            None
        }
    }
}

/// Static n-ary tree: task 0 is the root, task `i`'s children are
/// `i * fanout + 1 ..= i * fanout + fanout` (bounded by the task count).
#[derive(Debug, Clone)]
pub struct TreeTopology {
    fanout: u64,
    num_tasks: u64,
    task_id: u64,
}

impl TreeTopology {
    pub fn new(fanout: u64, num_tasks: u64) -> Self {
        Self {
            fanout: fanout.max(1),
            num_tasks,
            task_id: 0,
        }
    }
}

impl Topology for TreeTopology {
    fn set_task_id(&mut self, task_id: u64) {
        self.task_id = task_id;
    }

    fn parents(&self, _epoch: u64) -> Vec<u64> {
        if self.task_id == 0 {
            Vec::new()
        } else {
            vec![(self.task_id - 1) / self.fanout]
        }
    }

    fn children(&self, _epoch: u64) -> Vec<u64> {
        let first = self.task_id * self.fanout + 1;
        (first..first + self.fanout)
            .filter(|&id| id < self.num_tasks)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_tree() {
        let mut topo = TreeTopology::new(2, 6);
        topo.set_task_id(0);
        assert!(topo.parents(0).is_empty());
        assert_eq!(topo.children(0), vec![1, 2]);

        topo.set_task_id(2);
        assert_eq!(topo.parents(0), vec![0]);
        assert_eq!(topo.children(0), vec![5]);

        topo.set_task_id(4);
        assert_eq!(topo.parents(0), vec![1]);
        assert!(topo.children(0).is_empty());
    }

    #[test]
    fn test_role_of() {
        let mut topo = TreeTopology::new(2, 7);
        topo.set_task_id(1);
        assert_eq!(topo.role_of(0, 0), Some(Role::Parent));
        assert_eq!(topo.role_of(0, 3), Some(Role::Child));
        assert_eq!(topo.role_of(0, 5), None);
    }
}
