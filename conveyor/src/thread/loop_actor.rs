//! # Self-Driven Loop Actor
//!
//! A [`LoopActor`] owns a todo list instead of a mailbox. While running it
//! repeatedly takes a batch of items off the list and hands it to its
//! [`LoopBody`]; once the list is empty it stops itself. Adding items
//! schedules the actor again, so producers never have to track whether the
//! loop is running.

use std::collections::VecDeque;
use std::fmt;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread;

use conveyor_api::{ActorState, DeactivatingMode, Interrupt, Priority};

use super::ActorId;
use super::config::ActorConfig;
use super::error::SchedulerError;
use super::lifecycle::Lifecycle;
use super::priority::OsThread;
use super::scheduler::Scheduler;
use super::scheduler::pool::panic_message;
use super::scheduler::task::{ActorRun, submit_actor};
use crate::log_lifecycle;

/// Body of a loop actor.
pub trait LoopBody: Send + 'static {
    type Item: Send + 'static;

    /// Handles one batch taken from the todo list. Runs without any lock held.
    fn run_batch(&mut self, batch: Vec<Self::Item>);

    /// See [`conveyor_api::Stage::interrupter`].
    fn interrupter(&self) -> Option<Arc<dyn Interrupt>> {
        None
    }

    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Decides whether the loop may take another batch. Receives the number of
/// queued items and must not block or take locks shared with the loop.
pub type Gate = Arc<dyn Fn(usize) -> bool + Send + Sync>;

struct Control<Item> {
    life: Lifecycle,
    todo: VecDeque<Item>,
}

pub(crate) struct LoopCore<L: LoopBody> {
    id: ActorId,
    name: String,
    scheduler: Scheduler,
    control: Mutex<Control<L::Item>>,
    idle: Condvar,
    gate: RwLock<Option<Gate>>,
    /// Mirror of the todo length readable without the control lock.
    queued: AtomicUsize,
    max_batch: usize,
    interrupter: Option<Arc<dyn Interrupt>>,
    _body: PhantomData<fn() -> L>,
}

/// Handle owning one loop body scheduled on the pool.
pub struct LoopActor<L: LoopBody> {
    core: Arc<LoopCore<L>>,
}

impl<L: LoopBody> fmt::Debug for LoopActor<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopActor")
            .field("id", &self.core.id)
            .field("name", &self.core.name)
            .field("state", &self.state())
            .field("pending", &self.pending())
            .finish()
    }
}

impl<L: LoopBody> LoopActor<L> {
    pub fn new(body: L, scheduler: &Scheduler) -> Result<Self, SchedulerError> {
        Self::with_config(body, scheduler, ActorConfig::default())
    }

    pub fn with_config(body: L, scheduler: &Scheduler, config: ActorConfig) -> Result<Self, SchedulerError> {
        let config = scheduler.config().merge_with_actor_config(&config);
        let name = config.name.unwrap_or_else(|| body.name().to_string());
        let interrupter = body.interrupter();
        let id = ActorId::new();
        scheduler.register(id, Box::new(body))?;
        log_lifecycle!("loop", id, "created", name = %name);

        Ok(LoopActor {
            core: Arc::new(LoopCore {
                id,
                name,
                scheduler: scheduler.clone(),
                control: Mutex::new(Control {
                    life: Lifecycle::new(config.priority.unwrap_or_default()),
                    todo: VecDeque::new(),
                }),
                idle: Condvar::new(),
                gate: RwLock::new(None),
                queued: AtomicUsize::new(0),
                max_batch: config.max_batch.unwrap_or(usize::MAX).max(1),
                interrupter,
                _body: PhantomData,
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

    pub fn pending(&self) -> usize {
        self.core.lock().todo.len()
    }

    /// Installs a gate consulted before every batch.
    pub fn set_gate(&self, gate: Gate) {
        *self.core.gate.write().unwrap_or_else(PoisonError::into_inner) = Some(gate);
    }

    pub fn push(&self, item: L::Item) {
        self.append(std::iter::once(item));
    }

    /// Adds items to the todo list and schedules the loop.
    pub fn append(&self, items: impl IntoIterator<Item = L::Item>) {
        let submit = {
            let mut control = self.core.lock();
            control.todo.extend(items);
            self.core.queued.store(control.todo.len(), Ordering::SeqCst);
            control.life.request_schedule()
        };
        if submit {
            submit_actor(&self.core, &self.core.scheduler);
        }
    }

    /// Removes and returns every queued item.
    pub fn clear_pending(&self) -> Vec<L::Item> {
        let mut control = self.core.lock();
        self.core.queued.store(0, Ordering::SeqCst);
        control.todo.drain(..).collect()
    }

    pub fn schedule(&self) {
        let submit = self.core.lock().life.request_schedule();
        if submit {
            submit_actor(&self.core, &self.core.scheduler);
        }
    }

    /// Schedules the loop if items are waiting and the gate is open.
    pub fn check_restart(&self) {
        let submit = {
            let mut control = self.core.lock();
            !control.todo.is_empty()
                && self.core.gate_open(control.todo.len())
                && control.life.request_schedule()
        };
        if submit {
            submit_actor(&self.core, &self.core.scheduler);
        }
    }

    /// Stops the loop between two batches. The todo list is kept, whatever
    /// the mode; use [`LoopActor::clear_pending`] to drop it.
    pub fn deactivate(&self, mode: DeactivatingMode) {
        if let Some(interrupter) = self.request_deactivate(mode) {
            interrupter.about_to_deactivate();
        }
    }

    /// State side of [`LoopActor::deactivate`]; the interrupter is returned
    /// instead of called.
    pub(crate) fn request_deactivate(&self, mode: DeactivatingMode) -> Option<Arc<dyn Interrupt>> {
        let stopping = self.core.lock().life.request_deactivate();
        if !stopping {
            return None;
        }
        log_lifecycle!("loop", self.core.id, "deactivating", mode = ?mode);
        self.core.interrupter.clone()
    }

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

impl<L: LoopBody> Drop for LoopActor<L> {
    fn drop(&mut self) {
        let idle = self.core.lock().life.is_idle();
        if !idle && !thread::panicking() {
            panic!(
                "loop actor `{}` dropped while still active; deactivate() and wait() first",
                self.core.name
            );
        }
        self.core.scheduler.unregister(self.core.id);
        log_lifecycle!("loop", self.core.id, "destroyed");
    }
}

impl<L: LoopBody> LoopCore<L> {
    fn lock(&self) -> MutexGuard<'_, Control<L::Item>> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn gate_open(&self, queued: usize) -> bool {
        match self.gate.read().unwrap_or_else(PoisonError::into_inner).as_ref() {
            Some(gate) => gate(queued),
            None => true,
        }
    }

    /// Next batch, or `None` once the loop stopped itself or was deactivated.
    fn next_batch(&self) -> Option<Vec<L::Item>> {
        let mut control = self.lock();
        if control.life.state() == ActorState::Deactivating {
            return None;
        }
        if control.todo.is_empty() || !self.gate_open(control.todo.len()) {
            // Self-stop. An append racing with the shutdown latches a new run.
            control.life.request_deactivate();
            return None;
        }
        let take = control.todo.len().min(self.max_batch);
        let batch: Vec<_> = control.todo.drain(..take).collect();
        self.queued.store(control.todo.len(), Ordering::SeqCst);
        Some(batch)
    }
}

impl<L: LoopBody> ActorRun for LoopCore<L> {
    type Body = L;

    const KIND: &'static str = "loop";

    fn id(&self) -> ActorId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn begin(&self) -> bool {
        self.lock().life.begin_run(OsThread::current())
    }

    fn execute(&self, body: &mut L) {
        while let Some(batch) = self.next_batch() {
            let size = batch.len();
            let result = panic::catch_unwind(AssertUnwindSafe(|| body.run_batch(batch)));
            if let Err(panic) = result {
                tracing::error!(
                    actor = %self.name,
                    batch = size,
                    error = panic_message(&*panic),
                    "loop body panicked"
                );
            }
        }
    }

    fn finish(&self) -> bool {
        let mut control = self.lock();
        let resubmit = control.life.finish_run();
        if control.life.is_idle() {
            self.idle.notify_all();
        }
        resubmit
    }

    fn abort(&self) {
        self.lock().life.abandon_task();
        self.idle.notify_all();
    }
}
