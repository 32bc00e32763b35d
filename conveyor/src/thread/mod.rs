//! Pool-scheduled actors: the scheduler, worker actors and loop actors.

pub mod actor;
pub mod config;
pub mod error;
pub(crate) mod lifecycle;
pub mod loop_actor;
pub(crate) mod priority;
pub mod scheduler;

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// Re-export key types for easier usage
pub use actor::WorkerActor;
pub use config::{ActorConfig, SchedulerConfig};
pub use error::SchedulerError;
pub use loop_actor::{Gate, LoopActor, LoopBody};
pub use scheduler::Scheduler;
pub use scheduler::pool::{PoolMetrics, PoolStatus};

/// Unique identity of an actor, used as the broker's registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActorId(Uuid);

impl ActorId {
    pub fn new() -> Self {
        ActorId(Uuid::new_v4())
    }
}

impl Default for ActorId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
