//! One-shot pool tasks and the run protocol they execute.

use std::fmt;
use std::sync::Arc;

use super::Scheduler;
use crate::thread::ActorId;

/// Actor side of the run protocol.
///
/// Implemented by the shared core of each actor type. Every method except
/// [`ActorRun::execute`] takes the actor's control lock internally.
pub(crate) trait ActorRun: Send + Sync + 'static {
    /// Type of the body parked with the broker.
    type Body: Send + 'static;

    /// Short actor kind used in logs.
    const KIND: &'static str;

    fn id(&self) -> ActorId;

    fn name(&self) -> &str;

    /// Scheduled -> Running. `false` if the actor was deactivated first.
    fn begin(&self) -> bool;

    /// Event loop over the body. Returns once the actor stops itself or is
    /// deactivated.
    fn execute(&self, body: &mut Self::Body);

    /// Releases the task's reference after the body was parked again.
    /// Returns `true` if a latched schedule needs another task.
    fn finish(&self) -> bool;

    /// Releases the reference of a task that never got to run.
    fn abort(&self);
}

/// Disposable unit of work executed by a pool thread.
pub(crate) struct PoolTask {
    label: String,
    job: Box<dyn FnOnce() + Send>,
}

impl fmt::Debug for PoolTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolTask").field("label", &self.label).finish()
    }
}

impl PoolTask {
    pub(crate) fn from_fn(label: impl Into<String>, job: impl FnOnce() + Send + 'static) -> Self {
        PoolTask {
            label: label.into(),
            job: Box::new(job),
        }
    }

    /// Task running `actor` once.
    pub(crate) fn for_actor<A: ActorRun>(actor: Arc<A>, scheduler: Scheduler) -> Self {
        let label = actor.name().to_string();
        PoolTask::from_fn(label, move || run_actor(actor, scheduler))
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn run(self) {
        (self.job)()
    }
}

/// Submits a task for `actor`, releasing its reference if the pool refuses.
pub(crate) fn submit_actor<A: ActorRun>(actor: &Arc<A>, scheduler: &Scheduler) {
    let task = PoolTask::for_actor(Arc::clone(actor), scheduler.clone());
    if let Err(err) = scheduler.pool().submit(task) {
        tracing::error!(actor = actor.name(), error = %err, "could not schedule actor");
        actor.abort();
    }
}

/// 1. take the body from the broker
/// 2. run it (Scheduled -> Running -> event loop)
/// 3. park it again
/// 4. release the task reference, submitting the next task if latched
fn run_actor<A: ActorRun>(actor: Arc<A>, scheduler: Scheduler) {
    let _span = crate::actor_span!(A::KIND, actor.id(), name = actor.name()).entered();
    let body = match scheduler.broker().acquire(actor.id()) {
        Ok(body) => body,
        Err(err) => {
            tracing::error!(actor = actor.name(), error = %err, "could not acquire actor body");
            actor.abort();
            return;
        }
    };
    let mut body = match body.downcast::<A::Body>() {
        Ok(body) => body,
        Err(_) => panic!("broker handed `{}` a body of the wrong type", actor.name()),
    };

    if actor.begin() {
        actor.execute(&mut body);
    }

    if let Err(err) = scheduler.broker().park(actor.id(), body) {
        tracing::error!(actor = actor.name(), error = %err, "could not park actor body");
    }

    if actor.finish() {
        submit_actor(&actor, &scheduler);
    }
}
