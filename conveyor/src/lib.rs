// Conveyor runtime
//
// This crate runs the contracts of `conveyor-api` on a shared thread pool:
// worker and loop actors parked by a broker thread between runs, fan-out
// groups and the pipeline orchestrator chaining them.

pub mod logging;
pub mod pipeline;
pub mod thread;

// Re-export commonly used types
pub use conveyor_api::*;
pub use pipeline::{FanOut, FlowSnapshot, LoopStage, Pipeline, PipelineConfig, PipelineError, StageHandle};
pub use thread::{
    ActorConfig, ActorId, Gate, LoopActor, LoopBody, Scheduler, SchedulerConfig, SchedulerError,
    WorkerActor,
};
