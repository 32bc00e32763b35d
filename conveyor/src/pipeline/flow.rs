//! Admission bookkeeping of a pipeline.
//!
//! [`FlowState`] holds every counter the orchestrator mutates under its flow
//! lock. It performs no I/O and calls no stage, which keeps the admission
//! rules testable without threads.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use conveyor_api::{PackageId, Priority, WorkPackage};
use serde::{Deserialize, Serialize};

/// Read-only copy of the flow counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowSnapshot {
    pub in_flight: usize,
    pub max_in_flight: usize,
    pub delayed: usize,
    pub total_added: usize,
    pub pending_filter: usize,
    pub started: bool,
}

pub(crate) struct FlowState<T> {
    in_flight: usize,
    max_in_flight: usize,
    delayed: VecDeque<WorkPackage<T>>,
    /// Turned away by `offer` and not yet handed to `delay`.
    announcing: usize,
    total_added: usize,
    pending_filter: usize,
    pub(crate) started: bool,
    pub(crate) priority: Priority,
    /// Whether something entered the pipeline since the last `Finished`.
    episode_open: bool,
    /// Bumped by `cancel`; intake from older generations is ignored.
    generation: u64,
    /// Packages with an id below this belong to a cancelled generation.
    floor: PackageId,
    /// `in_flight`, readable without the flow lock.
    gauge: Arc<AtomicUsize>,
}

impl<T> FlowState<T> {
    pub(crate) fn new(max_in_flight: usize, priority: Priority) -> Self {
        FlowState {
            in_flight: 0,
            max_in_flight: max_in_flight.max(1),
            delayed: VecDeque::new(),
            announcing: 0,
            total_added: 0,
            pending_filter: 0,
            started: false,
            priority,
            episode_open: false,
            generation: 0,
            floor: PackageId(0),
            gauge: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn gauge(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.gauge)
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn is_stale(&self, package: PackageId) -> bool {
        package < self.floor
    }

    fn set_in_flight(&mut self, in_flight: usize) {
        self.in_flight = in_flight;
        self.gauge.store(in_flight, Ordering::SeqCst);
    }

    /// Items handed to the filter loop.
    pub(crate) fn queue_for_filter(&mut self, count: usize) {
        self.pending_filter += count;
        self.episode_open = true;
    }

    /// The filter resolved `count` items (sent or skipped).
    pub(crate) fn resolve_filtered(&mut self, count: usize) {
        self.pending_filter = self.pending_filter.saturating_sub(count);
    }

    /// Sender-side flow control for a new package. `Ok` means it may enter
    /// the first stage now. `Err` hands it back counted as delayed; it must be
    /// passed to [`FlowState::delay`] once announced.
    pub(crate) fn offer(&mut self, package: WorkPackage<T>) -> Result<WorkPackage<T>, WorkPackage<T>> {
        self.total_added += 1;
        self.episode_open = true;
        if self.in_flight >= self.max_in_flight {
            self.announcing += 1;
            return Err(package);
        }
        self.set_in_flight(self.in_flight + 1);
        Ok(package)
    }

    /// Queues packages turned away by `offer`. Completions may have freed
    /// room in the meantime, so whatever fits now is admitted and returned.
    pub(crate) fn delay(&mut self, packages: Vec<WorkPackage<T>>) -> Vec<WorkPackage<T>> {
        self.announcing = self.announcing.saturating_sub(packages.len());
        self.delayed.extend(packages);
        std::iter::from_fn(|| self.readmit()).collect()
    }

    /// One package left the pipeline. Returns the progress to publish.
    pub(crate) fn complete(&mut self) -> f32 {
        self.set_in_flight(self.in_flight.saturating_sub(1));
        self.progress()
    }

    /// Receiver-side flow control: admits the oldest delayed package if there
    /// is room again. At most one per completion.
    pub(crate) fn readmit(&mut self) -> Option<WorkPackage<T>> {
        if self.in_flight >= self.max_in_flight {
            return None;
        }
        let package = self.delayed.pop_front()?;
        self.set_in_flight(self.in_flight + 1);
        Some(package)
    }

    pub(crate) fn has_finished(&self) -> bool {
        self.in_flight == 0 && self.pending_filter == 0
    }

    /// Whether `Finished` is due now. Closes the drain episode and resets
    /// `total_added` when it is.
    pub(crate) fn take_finished(&mut self) -> bool {
        if !self.episode_open || !self.has_finished() || self.waiting() > 0 {
            return false;
        }
        self.episode_open = false;
        self.total_added = 0;
        true
    }

    /// Fraction of the packages added this episode that are not done yet.
    pub(crate) fn progress(&self) -> f32 {
        if self.total_added == 0 {
            return 0.0;
        }
        (self.in_flight + self.waiting()) as f32 / self.total_added as f32
    }

    fn waiting(&self) -> usize {
        self.delayed.len() + self.announcing
    }

    /// Starts a new generation: every counter is cleared and packages built
    /// before `next_package` are treated as stale.
    pub(crate) fn cancel(&mut self, next_package: PackageId) -> usize {
        let dropped = self.waiting();
        self.delayed.clear();
        self.announcing = 0;
        self.set_in_flight(0);
        self.total_added = 0;
        self.pending_filter = 0;
        self.episode_open = false;
        self.started = false;
        self.generation += 1;
        self.floor = next_package;
        dropped
    }

    pub(crate) fn snapshot(&self) -> FlowSnapshot {
        FlowSnapshot {
            in_flight: self.in_flight,
            max_in_flight: self.max_in_flight,
            delayed: self.waiting(),
            total_added: self.total_added,
            pending_filter: self.pending_filter,
            started: self.started,
        }
    }
}
