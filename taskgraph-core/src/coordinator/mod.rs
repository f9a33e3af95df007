//! Node-side coordination
//!
//! Slot acquisition, epoch synchronization, neighbor meta watches,
//! liveness and the bootstrap tying them into one node lifecycle.

pub mod bootstrap;
pub mod epoch;
pub mod liveness;
pub mod neighbor;
pub mod slot;
pub mod state;

pub use bootstrap::Bootstrap;
pub use epoch::{parse_epoch, EpochCoordinator, EpochCursor, EpochSubscription};
pub use liveness::{LivenessMonitor, PeerFailure};
pub use neighbor::NeighborWatcher;
pub use slot::SlotAllocator;
pub use state::{NodePhase, PhaseTracker};
