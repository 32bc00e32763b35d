use serde::{Deserialize, Serialize};

use crate::package::{PackageId, ProcessFlags, WorkPackage};

/// Notification published by a pipeline.
#[derive(Debug)]
pub enum PipelineEvent<'a, I, T> {
    /// Stages are about to be scheduled.
    Scheduled,
    /// Stages have been scheduled.
    Started,
    /// A package entered the pipeline (or left the delayed queue).
    Processing(&'a WorkPackage<T>),
    /// A package went through the last stage or was abandoned.
    Processed(&'a WorkPackage<T>),
    /// Items the filter decided not to process.
    Skipped(&'a [I]),
    /// Fraction of the packages added since the last drain still in the pipeline.
    Progress(f32),
    /// No package is in flight and nothing waits for filtering.
    Finished,
}

/// Receives [`PipelineEvent`]s.
///
/// Called on whichever thread produced the event, never under a pipeline
/// lock. Events borrow the package, so observers copy what they need.
pub trait Observer<I, T>: Send + Sync + 'static {
    fn on_event(&self, event: &PipelineEvent<'_, I, T>);
}

impl<I, T, F> Observer<I, T> for F
where
    F: Fn(&PipelineEvent<'_, I, T>) + Send + Sync + 'static,
{
    fn on_event(&self, event: &PipelineEvent<'_, I, T>) {
        self(event)
    }
}

/// Owned summary of a [`PipelineEvent`], delivered over channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineSignal {
    Scheduled,
    Started,
    Processing { package: PackageId },
    Processed { package: PackageId, flags: ProcessFlags },
    Skipped { count: usize },
    Progress { fraction: f32 },
    Finished,
}

impl<I, T> From<&PipelineEvent<'_, I, T>> for PipelineSignal {
    fn from(event: &PipelineEvent<'_, I, T>) -> Self {
        match event {
            PipelineEvent::Scheduled => PipelineSignal::Scheduled,
            PipelineEvent::Started => PipelineSignal::Started,
            PipelineEvent::Processing(package) => PipelineSignal::Processing {
                package: package.id(),
            },
            PipelineEvent::Processed(package) => PipelineSignal::Processed {
                package: package.id(),
                flags: package.flags(),
            },
            PipelineEvent::Skipped(items) => PipelineSignal::Skipped { count: items.len() },
            PipelineEvent::Progress(fraction) => PipelineSignal::Progress { fraction: *fraction },
            PipelineEvent::Finished => PipelineSignal::Finished,
        }
    }
}
