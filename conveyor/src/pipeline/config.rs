use conveyor_api::Priority;
use serde::{Deserialize, Serialize};

/// Packages allowed in the pipeline before new ones are delayed.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 50;

/// Widest fan-out group the pipeline builds.
pub const DEFAULT_PARALLEL_CAP: usize = 3;

/// Configuration for a [`Pipeline`](crate::pipeline::Pipeline).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Name used in logs and as a prefix for stage names.
    pub name: String,

    /// Admission bound; packages beyond it wait in the delayed queue.
    pub max_in_flight: usize,

    /// Upper bound for `plug_parallel` widths.
    pub parallel_cap: usize,

    /// Priority applied to every stage at construction.
    pub priority: Priority,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            name: "pipeline".to_string(),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            parallel_cap: DEFAULT_PARALLEL_CAP,
            priority: Priority::Low,
        }
    }
}

impl PipelineConfig {
    pub fn named(name: impl Into<String>) -> Self {
        PipelineConfig {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Width of a fan-out group asked to run `requested` members, bounded by
    /// the parallel cap and the number of logical CPUs.
    pub fn parallel_width(&self, requested: usize) -> usize {
        requested
            .min(self.parallel_cap)
            .min(num_cpus::get())
            .max(1)
    }
}
