//! # Worker Actor
//!
//! A [`WorkerActor`] runs a [`Stage`] body on whichever pool thread picks up
//! its task, one call at a time. Calls are queued in a mailbox from any
//! thread; the actor only drains the mailbox while it is scheduled.
//!
//! ## Key Responsibilities
//! - Mailbox of package calls and arbitrary invocations, in FIFO order
//! - Lifecycle (`schedule` / `deactivate` / `wait`) under one control lock
//! - Thread priority of the executing pool thread
//! - Synchronous deactivation hook for stages blocked in external calls

use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;

use conveyor_api::{ActorState, DeactivatingMode, Interrupt, Outlet, Priority, Stage, WorkPackage};

use super::ActorId;
use super::config::ActorConfig;
use super::error::SchedulerError;
use super::lifecycle::Lifecycle;
use super::priority::OsThread;
use super::scheduler::Scheduler;
use super::scheduler::pool::panic_message;
use super::scheduler::task::{ActorRun, submit_actor};
use crate::log_lifecycle;

/// A queued call.
enum Call<S: Stage> {
    Process(WorkPackage<S::Payload>),
    Invoke(Box<dyn FnOnce(&mut S) + Send>),
}

struct Control<S: Stage> {
    life: Lifecycle,
    mode: DeactivatingMode,
    /// Calls still allowed to run during a phase-out.
    phase_out_remaining: usize,
    mailbox: VecDeque<Call<S>>,
}

pub(crate) struct WorkerCore<S: Stage> {
    id: ActorId,
    name: String,
    scheduler: Scheduler,
    control: Mutex<Control<S>>,
    /// Signalled when a call is queued or a stop is requested.
    incoming: Condvar,
    /// Signalled when the actor becomes idle.
    idle: Condvar,
    outlet: Outlet<S::Payload>,
    interrupter: Option<Arc<dyn Interrupt>>,
}

/// Handle owning one stage body scheduled on the pool.
///
/// Dropping the handle while the actor is not idle is a programming error and
/// panics; call [`WorkerActor::deactivate`] and [`WorkerActor::wait`] first.
pub struct WorkerActor<S: Stage> {
    core: Arc<WorkerCore<S>>,
}

impl<S: Stage> fmt::Debug for WorkerActor<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerActor")
            .field("id", &self.core.id)
            .field("name", &self.core.name)
            .field("state", &self.state())
            .field("pending", &self.pending())
            .finish()
    }
}

impl<S: Stage> WorkerActor<S> {
    /// Creates an inactive actor whose body starts out parked with the broker.
    pub fn new(stage: S, scheduler: &Scheduler) -> Result<Self, SchedulerError> {
        Self::with_config(stage, scheduler, ActorConfig::default())
    }

    pub fn with_config(
        stage: S,
        scheduler: &Scheduler,
        config: ActorConfig,
    ) -> Result<Self, SchedulerError> {
        let config = scheduler.config().merge_with_actor_config(&config);
        let name = config.name.unwrap_or_else(|| stage.name().to_string());
        let priority = config.priority.unwrap_or_default();
        let interrupter = stage.interrupter();
        let id = ActorId::new();
        scheduler.register(id, Box::new(stage))?;
        log_lifecycle!("worker", id, "created", name = %name);

        Ok(WorkerActor {
            core: Arc::new(WorkerCore {
                id,
                name,
                scheduler: scheduler.clone(),
                control: Mutex::new(Control {
                    life: Lifecycle::new(priority),
                    mode: DeactivatingMode::default(),
                    phase_out_remaining: 0,
                    mailbox: VecDeque::new(),
                }),
                incoming: Condvar::new(),
                idle: Condvar::new(),
                outlet: Outlet::new(),
                interrupter,
            }),
        })
    }

    pub fn id(&self) -> ActorId {
        self.core.id
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn state(&self) -> ActorState {
        self.core.lock().life.state()
    }

    /// Number of queued calls.
    pub fn pending(&self) -> usize {
        self.core.lock().mailbox.len()
    }

    /// Where the stage reports finished packages.
    pub fn outlet(&self) -> &Outlet<S::Payload> {
        &self.core.outlet
    }

    /// Queues `package` for the stage.
    pub fn process(&self, package: WorkPackage<S::Payload>) {
        self.core.push(Call::Process(package));
    }

    /// Queues `call` to run on the actor's thread with exclusive access to the body.
    pub fn invoke<F>(&self, call: F)
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.core.push(Call::Invoke(Box::new(call)));
    }

    /// Requests the actor to run. Idempotent; latched while Deactivating.
    pub fn schedule(&self) {
        let submit = self.core.lock().life.request_schedule();
        if submit {
            submit_actor(&self.core, &self.core.scheduler);
        }
    }

    /// Requests the actor to stop. See [`DeactivatingMode`] for what happens
    /// to queued calls. The stage's interrupter runs on the calling thread.
    pub fn deactivate(&self, mode: DeactivatingMode) {
        if let Some(interrupter) = self.request_deactivate(mode) {
            interrupter.about_to_deactivate();
        }
    }

    /// State side of [`WorkerActor::deactivate`]. Returns the interrupter to
    /// fire when the actor started deactivating, leaving the call to the
    /// caller.
    pub(crate) fn request_deactivate(&self, mode: DeactivatingMode) -> Option<Arc<dyn Interrupt>> {
        let stopping = {
            let mut control = self.core.lock();
            if mode == DeactivatingMode::FlushPending && !control.mailbox.is_empty() {
                tracing::debug!(actor = %self.core.name, dropped = control.mailbox.len(), "flushing queued calls");
                control.mailbox.clear();
            }
            let stopping = control.life.request_deactivate();
            if stopping || control.life.state() == ActorState::Deactivating {
                control.mode = mode;
                control.phase_out_remaining = match mode {
                    DeactivatingMode::PhaseOut => control.mailbox.len(),
                    _ => 0,
                };
            }
            stopping
        };
        self.core.incoming.notify_all();
        if !stopping {
            return None;
        }
        log_lifecycle!("worker", self.core.id, "deactivating", mode = ?mode);
        self.core.interrupter.clone()
    }

    /// Blocks until the actor is Inactive and no pool task holds it.
    pub fn wait(&self) {
        let mut control = self.core.lock();
        while !control.life.is_idle() {
            control = self
                .core
                .idle
                .wait(control)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn set_priority(&self, priority: Priority) {
        self.core.lock().life.set_priority(priority);
    }

    pub fn priority(&self) -> Priority {
        self.core.lock().life.priority()
    }
}

impl<S: Stage> Drop for WorkerActor<S> {
    fn drop(&mut self) {
        let idle = self.core.lock().life.is_idle();
        if !idle && !thread::panicking() {
            panic!(
                "worker actor `{}` dropped while still active; deactivate() and wait() first",
                self.core.name
            );
        }
        self.core.scheduler.unregister(self.core.id);
        log_lifecycle!("worker", self.core.id, "destroyed");
    }
}

impl<S: Stage> WorkerCore<S> {
    fn lock(&self) -> MutexGuard<'_, Control<S>> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, call: Call<S>) {
        self.lock().mailbox.push_back(call);
        self.incoming.notify_one();
    }

    /// Next call to run, or `None` when the run must end.
    fn next_call(&self) -> Option<Call<S>> {
        let mut control = self.lock();
        loop {
            if control.life.state() == ActorState::Deactivating {
                if control.mode != DeactivatingMode::PhaseOut || control.phase_out_remaining == 0 {
                    return None;
                }
                control.phase_out_remaining -= 1;
                return control.mailbox.pop_front();
            }
            if let Some(call) = control.mailbox.pop_front() {
                return Some(call);
            }
            control = self
                .incoming
                .wait(control)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn dispatch(&self, stage: &mut S, call: Call<S>) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| match call {
            Call::Process(package) => stage.process(package, &self.outlet),
            Call::Invoke(call) => call(stage),
        }));
        if let Err(panic) = result {
            tracing::error!(
                actor = %self.name,
                error = panic_message(&*panic),
                "stage panicked while handling a call"
            );
        }
    }
}

impl<S: Stage> ActorRun for WorkerCore<S> {
    type Body = S;

    const KIND: &'static str = "worker";

    fn id(&self) -> ActorId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn begin(&self) -> bool {
        let mut control = self.lock();
        let thread = OsThread::current();
        if control.life.begin_run(thread) {
            return true;
        }
        // Phased out before this task got to run.
        control.mode == DeactivatingMode::PhaseOut
            && control.phase_out_remaining > 0
            && control.life.begin_drain(thread)
    }

    fn execute(&self, stage: &mut S) {
        log_lifecycle!("worker", self.id, "running");
        while let Some(call) = self.next_call() {
            self.dispatch(stage, call);
        }
    }

    fn finish(&self) -> bool {
        let mut control = self.lock();
        let resubmit = control.life.finish_run();
        if resubmit {
            control.mode = DeactivatingMode::default();
            control.phase_out_remaining = 0;
        }
        if control.life.is_idle() {
            self.idle.notify_all();
        }
        resubmit
    }

    fn abort(&self) {
        let mut control = self.lock();
        control.life.abandon_task();
        self.idle.notify_all();
    }
}
