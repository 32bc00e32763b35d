use std::time::Duration;

use conveyor_api::Priority;
use serde::{Deserialize, Serialize};

// --- Scheduler Configuration ---

/// Configuration for a [`Scheduler`](crate::thread::scheduler::Scheduler).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of pool threads kept alive regardless of how many actors exist.
    pub pool_size: usize,

    /// How long a surplus pool thread waits for work before it exits.
    pub idle_timeout: Duration,

    /// Prefix for the names of pool threads. The thread index is appended.
    pub thread_name_prefix: String,

    /// Name of the broker thread that parks actor bodies between runs.
    pub broker_thread_name: String,

    /// Priority given to actors that do not specify one.
    pub default_priority: Priority,

    /// Upper bound on the items a loop actor drains per iteration.
    pub default_max_batch: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            pool_size: num_cpus::get(),
            idle_timeout: Duration::from_secs(30),
            thread_name_prefix: "conveyor-pool-".to_string(),
            broker_thread_name: "conveyor-broker".to_string(),
            default_priority: Priority::Normal,
            default_max_batch: usize::MAX,
        }
    }
}

impl SchedulerConfig {
    /// Fills every unset field of `actor_config` from the scheduler defaults.
    ///
    /// The name is left alone; actors fall back to their stage's name.
    pub fn merge_with_actor_config(&self, actor_config: &ActorConfig) -> ActorConfig {
        ActorConfig {
            name: actor_config.name.clone(),
            priority: actor_config.priority.or(Some(self.default_priority)),
            max_batch: actor_config.max_batch.or(Some(self.default_max_batch)),
        }
    }
}

// --- Actor Configuration ---

/// Per-actor settings overriding the scheduler defaults.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ActorConfig {
    /// Name used in logs.
    pub name: Option<String>,

    /// Initial priority of the actor.
    pub priority: Option<Priority>,

    /// Items drained per loop iteration. Only used by loop actors.
    pub max_batch: Option<usize>,
}

impl ActorConfig {
    pub fn named(name: impl Into<String>) -> Self {
        ActorConfig {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = Some(max_batch);
        self
    }
}
