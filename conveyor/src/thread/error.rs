use thiserror::Error;

use crate::thread::ActorId;

/// Errors raised by the pool, the broker and actor registration.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Thread setup error: {0}")]
    ThreadSetup(String),
    #[error("Scheduler is shutting down")]
    ShuttingDown,
    #[error("Broker thread is not available")]
    BrokerUnavailable,
    #[error("Actor {0} is not parked with the broker")]
    UnknownActor(ActorId),
    #[error("Failed during shutdown: {0}")]
    Shutdown(String),
    #[error("Internal scheduler error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<std::io::Error> for SchedulerError {
    fn from(err: std::io::Error) -> Self {
        SchedulerError::ThreadSetup(err.to_string())
    }
}
