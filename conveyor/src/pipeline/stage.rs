//! The closed set of stage kinds a pipeline chains together.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use conveyor_api::{DeactivatingMode, Interrupt, Outlet, Priority, Stage, WorkPackage};

use crate::thread::{ActorConfig, LoopActor, LoopBody, Scheduler, SchedulerError, WorkerActor};

/// Uniform surface of a pipeline stage: a single worker, a loop-driven stage
/// or a fan-out group.
pub trait StageHandle<T>: Send + Sync {
    fn name(&self) -> &str;

    /// Queues `package` on the stage.
    fn process(&self, package: WorkPackage<T>);

    /// Where the stage reports completed packages.
    fn outlet(&self) -> &Outlet<T>;

    fn schedule(&self);

    /// Moves the stage towards Inactive without calling into stage code.
    /// Returns the interrupters the caller must fire afterwards.
    fn stop(&self, mode: DeactivatingMode) -> Vec<Arc<dyn Interrupt>>;

    /// [`StageHandle::stop`] followed by the interrupters.
    fn deactivate(&self, mode: DeactivatingMode) {
        for interrupter in self.stop(mode) {
            interrupter.about_to_deactivate();
        }
    }

    fn wait(&self);

    fn set_priority(&self, priority: Priority);

    /// Gives throttled stages a chance to resume after downstream progress.
    fn check_restart(&self) {}
}

impl<S: Stage> StageHandle<S::Payload> for WorkerActor<S> {
    fn name(&self) -> &str {
        WorkerActor::name(self)
    }

    fn process(&self, package: WorkPackage<S::Payload>) {
        WorkerActor::process(self, package)
    }

    fn outlet(&self) -> &Outlet<S::Payload> {
        WorkerActor::outlet(self)
    }

    fn schedule(&self) {
        WorkerActor::schedule(self)
    }

    fn stop(&self, mode: DeactivatingMode) -> Vec<Arc<dyn Interrupt>> {
        self.request_deactivate(mode).into_iter().collect()
    }

    fn wait(&self) {
        WorkerActor::wait(self)
    }

    fn set_priority(&self, priority: Priority) {
        WorkerActor::set_priority(self, priority)
    }
}

/// Runs a [`Stage`] over the todo list of a loop actor.
pub(crate) struct StageLoop<S: Stage> {
    stage: S,
    outlet: Outlet<S::Payload>,
}

impl<S: Stage> LoopBody for StageLoop<S> {
    type Item = WorkPackage<S::Payload>;

    fn run_batch(&mut self, batch: Vec<Self::Item>) {
        for package in batch {
            self.stage.process(package, &self.outlet);
        }
    }

    fn interrupter(&self) -> Option<Arc<dyn Interrupt>> {
        self.stage.interrupter()
    }

    fn name(&self) -> &str {
        self.stage.name()
    }
}

/// A stage executed by a loop actor, optionally throttled so it never runs
/// more than `sent_out_limit` packages ahead of the rest of the pipeline.
pub struct LoopStage<S: Stage> {
    actor: LoopActor<StageLoop<S>>,
    outlet: Outlet<S::Payload>,
}

impl<S: Stage> LoopStage<S> {
    pub fn new(stage: S, scheduler: &Scheduler, config: ActorConfig) -> Result<Self, SchedulerError> {
        let outlet = Outlet::new();
        let body = StageLoop {
            stage,
            outlet: outlet.clone(),
        };
        Ok(LoopStage {
            actor: LoopActor::with_config(body, scheduler, config)?,
            outlet,
        })
    }

    /// The loop pauses while more than `limit` packages sit in later stages,
    /// as read from `in_flight` (the pipeline's in-flight gauge).
    pub fn throttle(&self, in_flight: Arc<AtomicUsize>, limit: usize) {
        self.actor.set_gate(Arc::new(move |queued| {
            in_flight.load(Ordering::SeqCst).saturating_sub(queued) <= limit
        }));
    }

    pub fn pending(&self) -> usize {
        self.actor.pending()
    }
}

impl<S: Stage> StageHandle<S::Payload> for LoopStage<S> {
    fn name(&self) -> &str {
        self.actor.name()
    }

    fn process(&self, package: WorkPackage<S::Payload>) {
        self.actor.push(package);
    }

    fn outlet(&self) -> &Outlet<S::Payload> {
        &self.outlet
    }

    fn schedule(&self) {
        self.actor.schedule();
    }

    fn stop(&self, mode: DeactivatingMode) -> Vec<Arc<dyn Interrupt>> {
        if mode == DeactivatingMode::FlushPending {
            let dropped = self.actor.clear_pending().len();
            if dropped > 0 {
                tracing::debug!(stage = self.actor.name(), dropped, "flushed loop stage");
            }
        }
        self.actor.request_deactivate(mode).into_iter().collect()
    }

    fn wait(&self) {
        self.actor.wait();
    }

    fn set_priority(&self, priority: Priority) {
        self.actor.set_priority(priority);
    }

    fn check_restart(&self) {
        self.actor.check_restart();
    }
}
