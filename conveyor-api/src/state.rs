use serde::{Deserialize, Serialize};

/// Lifecycle state of a pool-scheduled actor.
///
/// ```text
/// Inactive --schedule--> Scheduled --task starts--> Running
///    ^                       |                        |
///    |                  deactivate               deactivate / self-stop
///    |                       v                        v
///    +----- run ends ---- Deactivating <--------------+
///                            |
///                    latched schedule --> Scheduled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActorState {
    /// Idle. The body is parked with the broker.
    Inactive = 0,
    /// A pool task has been submitted but has not started running the body.
    Scheduled = 1,
    /// A pool thread owns the body and executes its event loop.
    Running = 2,
    /// A stop was requested; the current run winds down.
    Deactivating = 3,
}

impl ActorState {
    /// Whether `self -> next` is an edge of the lifecycle graph.
    pub fn can_transition_to(self, next: ActorState) -> bool {
        use ActorState::*;
        matches!(
            (self, next),
            (Inactive, Scheduled)
                | (Scheduled, Running)
                | (Scheduled, Deactivating)
                | (Running, Inactive)
                | (Running, Deactivating)
                | (Deactivating, Inactive)
                | (Deactivating, Scheduled)
        )
    }

    /// Scheduled or Running.
    pub fn is_active(self) -> bool {
        matches!(self, ActorState::Scheduled | ActorState::Running)
    }
}

impl Default for ActorState {
    fn default() -> Self {
        ActorState::Inactive
    }
}

/// What happens to queued calls when an actor is deactivated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DeactivatingMode {
    /// Discard every queued call.
    #[default]
    FlushPending,
    /// Stop after the current call and leave the queue intact for the next run.
    KeepPending,
    /// Finish every call queued at the time of the request, then stop.
    PhaseOut,
}
