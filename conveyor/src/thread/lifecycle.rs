//! State bookkeeping shared by worker and loop actors.
//!
//! A [`Lifecycle`] always lives inside the actor's single control mutex, so
//! every method here runs with that lock held. It owns the state machine, the
//! latched schedule request, the count of pool tasks referencing the actor
//! and the priority of the thread currently running it.

use conveyor_api::{ActorState, Priority};

use super::priority::OsThread;

#[derive(Debug)]
pub(crate) struct Lifecycle {
    state: ActorState,
    /// `schedule()` arrived while Deactivating.
    latched: bool,
    /// Pool tasks submitted for this actor that have not finished. At most one.
    tasks: usize,
    priority: Priority,
    /// Thread executing the body, and whether its nice value was changed.
    thread: Option<(OsThread, bool)>,
    #[cfg(test)]
    history: Vec<ActorState>,
}

impl Lifecycle {
    pub(crate) fn new(priority: Priority) -> Self {
        Lifecycle {
            state: ActorState::Inactive,
            latched: false,
            tasks: 0,
            priority,
            thread: None,
            #[cfg(test)]
            history: vec![ActorState::Inactive],
        }
    }

    pub(crate) fn state(&self) -> ActorState {
        self.state
    }

    pub(crate) fn priority(&self) -> Priority {
        self.priority
    }

    #[cfg(test)]
    pub(crate) fn tasks(&self) -> usize {
        self.tasks
    }

    /// Inactive with no pool task left holding the actor.
    pub(crate) fn is_idle(&self) -> bool {
        self.state == ActorState::Inactive && self.tasks == 0
    }

    fn enter(&mut self, next: ActorState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid actor transition {:?} -> {:?}",
            self.state,
            next
        );
        tracing::trace!(from = ?self.state, to = ?next, "actor state transition");
        self.state = next;
        #[cfg(test)]
        self.history.push(next);
    }

    /// Returns `true` when the caller must submit a new pool task.
    pub(crate) fn request_schedule(&mut self) -> bool {
        match self.state {
            ActorState::Inactive => {
                self.enter(ActorState::Scheduled);
                self.tasks += 1;
                true
            }
            ActorState::Deactivating => {
                self.latched = true;
                false
            }
            ActorState::Scheduled | ActorState::Running => false,
        }
    }

    /// Returns `true` if the actor was active and is now Deactivating.
    ///
    /// A latched schedule is dropped: the most recent request wins.
    pub(crate) fn request_deactivate(&mut self) -> bool {
        self.latched = false;
        if self.state.is_active() {
            self.enter(ActorState::Deactivating);
            true
        } else {
            false
        }
    }

    /// Called by the pool task once it holds the body. Returns `false` when
    /// the actor was deactivated before the task got to run it.
    pub(crate) fn begin_run(&mut self, thread: OsThread) -> bool {
        if self.state != ActorState::Scheduled {
            return false;
        }
        self.enter(ActorState::Running);
        self.attach(thread);
        true
    }

    /// Lets a task that was overtaken by `deactivate()` run the body anyway,
    /// staying Deactivating, so the calls owed to a phase-out still execute.
    pub(crate) fn begin_drain(&mut self, thread: OsThread) -> bool {
        if self.state != ActorState::Deactivating || self.tasks == 0 {
            return false;
        }
        self.attach(thread);
        true
    }

    fn attach(&mut self, thread: OsThread) {
        let touched = self.priority != Priority::Normal;
        if touched {
            thread.apply(self.priority);
        }
        self.thread = Some((thread, touched));
    }

    /// Called by the pool task after the body went back to the broker.
    ///
    /// Returns `true` when a latched schedule turned into a new run; the task
    /// reference is then handed over to the next pool task.
    pub(crate) fn finish_run(&mut self) -> bool {
        if let Some((thread, touched)) = self.thread.take() {
            if touched && !thread.restore() {
                tracing::debug!("pool thread could not be restored to its previous priority");
            }
        }
        if self.latched {
            self.latched = false;
            self.enter(ActorState::Scheduled);
            return true;
        }
        if self.state != ActorState::Inactive {
            self.enter(ActorState::Inactive);
        }
        self.tasks = self.tasks.saturating_sub(1);
        false
    }

    /// A submitted task never ran (the pool refused it or the broker is gone).
    pub(crate) fn abandon_task(&mut self) {
        tracing::error!(state = ?self.state, "pool task for actor was abandoned");
        self.latched = false;
        self.thread = None;
        if self.state.is_active() {
            self.enter(ActorState::Deactivating);
        }
        if self.state != ActorState::Inactive {
            self.enter(ActorState::Inactive);
        }
        self.tasks = self.tasks.saturating_sub(1);
    }

    pub(crate) fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
        if let Some((thread, touched)) = self.thread.as_mut() {
            thread.apply(priority);
            *touched = true;
        }
    }

    #[cfg(test)]
    pub(crate) fn history(&self) -> &[ActorState] {
        &self.history
    }
}
