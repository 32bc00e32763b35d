//! Thread priorities for actors and pipelines
//!
//! A [`Priority`] is recorded on an actor and applied to whichever pool thread
//! executes it. On Linux the levels map onto nice values.
//!
//! # Usage
//!
//! ```rust
//! use conveyor_api::Priority;
//!
//! let background = Priority::Low;
//! assert!(background < Priority::Normal);
//! assert_eq!(background.nice(), 10);
//! ```

use serde::{Deserialize, Serialize};

/// Scheduling priority, ordered from least to most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum Priority {
    Idle,
    Lowest,
    Low,
    #[default]
    Normal,
    High,
    Highest,
    TimeCritical,
}

impl Priority {
    pub const ALL: [Priority; 7] = [
        Priority::Idle,
        Priority::Lowest,
        Priority::Low,
        Priority::Normal,
        Priority::High,
        Priority::Highest,
        Priority::TimeCritical,
    ];

    /// Nice value used for the executing thread.
    pub fn nice(self) -> i32 {
        match self {
            Priority::Idle => 19,
            Priority::Lowest => 15,
            Priority::Low => 10,
            Priority::Normal => 0,
            Priority::High => -5,
            Priority::Highest => -10,
            Priority::TimeCritical => -15,
        }
    }
}
