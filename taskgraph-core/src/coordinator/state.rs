//! Node lifecycle state machine
//!
//! `Unassigned → Acquiring → {Assigned | Standby} → Initializing → Running
//! → ShuttingDown → Released`. Standby loops back to `Acquiring` when a
//! slot frees up; any failure before `Running` ends in `Failed`.

use tokio::sync::watch;
use tracing::{debug, warn};

/// Lifecycle phase of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodePhase {
    /// Not started
    Unassigned,
    /// Racing for a slot
    Acquiring,
    /// Holding a slot
    Assigned(u64),
    /// Waiting for a slot to free up
    Standby,
    /// Running task init, epoch fetch, watches and server startup
    Initializing(u64),
    /// Delivering epochs and serving data
    Running(u64),
    /// Canceling watches and calling task exit
    ShuttingDown,
    /// Slot given back, nothing left running
    Released,
    /// Fatal error before or during running
    Failed,
}

impl NodePhase {
    /// Slot held in this phase, if any
    pub fn task_id(&self) -> Option<u64> {
        match self {
            NodePhase::Assigned(id) | NodePhase::Initializing(id) | NodePhase::Running(id) => {
                Some(*id)
            }
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, NodePhase::Released | NodePhase::Failed)
    }

    fn can_move_to(&self, next: &NodePhase) -> bool {
        use NodePhase::*;
        match (self, next) {
            (_, Failed) => !self.is_terminal(),
            (Unassigned, Acquiring) => true,
            (Acquiring, Assigned(_)) | (Acquiring, Standby) => true,
            (Standby, Acquiring) => true,
            (Assigned(a), Initializing(b)) | (Initializing(a), Running(b)) => a == b,
            (Initializing(_), ShuttingDown) | (Running(_), ShuttingDown) => true,
            (Standby, ShuttingDown) | (Acquiring, ShuttingDown) => true,
            (ShuttingDown, Released) => true,
            _ => false,
        }
    }
}

/// Publishes phase changes to any number of observers
pub struct PhaseTracker {
    tx: watch::Sender<NodePhase>,
}

impl PhaseTracker {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(NodePhase::Unassigned);
        Self { tx }
    }

    pub fn current(&self) -> NodePhase {
        *self.tx.borrow()
    }

    /// Subscribe to phase changes
    pub fn subscribe(&self) -> watch::Receiver<NodePhase> {
        self.tx.subscribe()
    }

    /// Move to `next`. Illegal transitions are logged and ignored.
    pub fn advance(&self, next: NodePhase) -> bool {
        let mut moved = false;
        self.tx.send_if_modified(|phase| {
            if phase.can_move_to(&next) {
                debug!("Node phase {:?} -> {:?}", phase, next);
                *phase = next;
                moved = true;
            } else {
                warn!("Ignoring phase change {:?} -> {:?}", phase, next);
            }
            moved
        });
        moved
    }
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standby_path() {
        let tracker = PhaseTracker::new();
        assert!(tracker.advance(NodePhase::Acquiring));
        assert!(tracker.advance(NodePhase::Standby));
        assert!(tracker.advance(NodePhase::Acquiring));
        assert!(tracker.advance(NodePhase::Assigned(3)));
        assert!(!tracker.advance(NodePhase::Running(3)));
        assert!(tracker.advance(NodePhase::Initializing(3)));
        assert!(tracker.advance(NodePhase::Running(3)));
        assert_eq!(tracker.current().task_id(), Some(3));
    }

    #[tokio::test]
    async fn test_observers_see_release() {
        let tracker = PhaseTracker::new();
        let mut rx = tracker.subscribe();
        for phase in [
            NodePhase::Acquiring,
            NodePhase::Assigned(0),
            NodePhase::Initializing(0),
            NodePhase::Running(0),
            NodePhase::ShuttingDown,
            NodePhase::Released,
        ] {
            tracker.advance(phase);
        }
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), NodePhase::Released);
        assert!(!tracker.advance(NodePhase::Failed));
    }
}
