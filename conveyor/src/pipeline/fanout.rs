//! # Parallel Fan-Out Group
//!
//! N identical worker actors behind one stage. Packages are dealt out
//! round-robin and every member reports into the group's merged outlet, so
//! the next stage sees one completion stream. Ordering holds per member only.

use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicUsize, Ordering};

use conveyor_api::{DeactivatingMode, Interrupt, Outlet, Priority, Stage, WorkPackage};

use super::stage::StageHandle;
use crate::thread::WorkerActor;

pub struct FanOut<S: Stage> {
    name: String,
    members: Vec<WorkerActor<S>>,
    next: AtomicUsize,
    outlet: Outlet<S::Payload>,
    priority: Mutex<Option<Priority>>,
}

impl<S: Stage> FanOut<S> {
    pub fn new(name: impl Into<String>) -> Self {
        FanOut {
            name: name.into(),
            members: Vec::new(),
            next: AtomicUsize::new(0),
            outlet: Outlet::new(),
            priority: Mutex::new(None),
        }
    }

    /// Adds a member. Its completions are merged into the group outlet and it
    /// inherits the priority last set on the group.
    pub fn add(&mut self, worker: WorkerActor<S>) {
        let processed = self.outlet.clone();
        let abandoned = self.outlet.clone();
        worker.outlet().connect(
            Arc::new(move |package| processed.emit(package)),
            Arc::new(move |package| abandoned.abandon(package)),
        );
        let priority = *self.priority.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(priority) = priority {
            worker.set_priority(priority);
        }
        self.members.push(worker);
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn members(&self) -> &[WorkerActor<S>] {
        &self.members
    }

    /// Queues `call` on every member.
    pub fn invoke_all<F>(&self, call: F)
    where
        F: Fn(&mut S) + Clone + Send + 'static,
    {
        for member in &self.members {
            member.invoke(call.clone());
        }
    }
}

impl<S: Stage> StageHandle<S::Payload> for FanOut<S> {
    fn name(&self) -> &str {
        &self.name
    }

    /// # Panics
    /// If the group has no members.
    fn process(&self, package: WorkPackage<S::Payload>) {
        assert!(!self.members.is_empty(), "fan-out group `{}` has no members", self.name);
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.members.len();
        self.members[index].process(package);
    }

    fn outlet(&self) -> &Outlet<S::Payload> {
        &self.outlet
    }

    fn schedule(&self) {
        self.members.iter().for_each(WorkerActor::schedule);
    }

    fn stop(&self, mode: DeactivatingMode) -> Vec<Arc<dyn Interrupt>> {
        self.members
            .iter()
            .filter_map(|member| member.request_deactivate(mode))
            .collect()
    }

    fn wait(&self) {
        self.members.iter().for_each(WorkerActor::wait);
    }

    fn set_priority(&self, priority: Priority) {
        *self.priority.lock().unwrap_or_else(PoisonError::into_inner) = Some(priority);
        for member in &self.members {
            member.set_priority(priority);
        }
    }
}
