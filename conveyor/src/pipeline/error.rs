use thiserror::Error;

use crate::thread::SchedulerError;

/// Errors raised while building a pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Pipeline `{0}` has no stages")]
    Empty(String),
    #[error("Could not create stage actor: {0}")]
    Scheduler(#[from] SchedulerError),
}
