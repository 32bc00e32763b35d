//! # Pipeline Orchestrator
//!
//! A [`Pipeline`] chains stages so that the outlet of stage *n* feeds stage
//! *n + 1* and the last stage reports back to the pipeline. On top of the
//! chain it keeps the flow counters: how many packages are in flight, which
//! ones wait because the admission bound was hit, and whether the pipeline
//! has drained.
//!
//! ## Key Responsibilities
//! - Admission control with a delayed queue, one re-admission per completion
//! - Optional filter loop in front of the first stage
//! - Lazy start of all stages and a single `Finished` per drain episode
//! - Priority propagation, cancellation and synchronous `wait()`
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use conveyor::pipeline::{Pipeline, PipelineConfig};
//! use conveyor::thread::Scheduler;
//! use conveyor_api::{Outlet, Stage, WorkPackage};
//!
//! struct Double;
//!
//! impl Stage for Double {
//!     type Payload = u64;
//!
//!     fn process(&mut self, mut package: WorkPackage<u64>, outlet: &Outlet<u64>) {
//!         *package.payload_mut() *= 2;
//!         outlet.emit(package);
//!     }
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let scheduler = Scheduler::global()?;
//! let mut pipeline = Pipeline::new(&scheduler, |n: &u64| Some(*n), PipelineConfig::named("double"));
//! pipeline.plug(Double)?;
//! pipeline.construct()?;
//!
//! let signals = pipeline.subscribe();
//! pipeline.process_batch(vec![1, 2, 3]);
//! # drop(signals);
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod events;
mod fanout;
mod filter;
mod flow;
mod stage;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use conveyor_api::{
    DeactivatingMode, Filter, Interrupt, Observer, PackageFactory, PackageId, PipelineEvent,
    PipelineSignal, Priority, ProcessFlags, Route, Stage, WorkPackage,
};

pub use config::{DEFAULT_MAX_IN_FLIGHT, DEFAULT_PARALLEL_CAP, PipelineConfig};
pub use error::PipelineError;
pub use fanout::FanOut;
pub use flow::FlowSnapshot;
pub use stage::{LoopStage, StageHandle};

use events::EventHub;
use filter::{FilterBody, Queued};
use flow::FlowState;

use crate::log_flow;
use crate::thread::{ActorConfig, LoopActor, Scheduler, WorkerActor};

/// Where a batch of packages comes from.
enum Intake<I> {
    /// Handed in by the caller.
    Direct,
    /// Resolved by the filter loop; `skipped` were turned down.
    Filtered { generation: u64, skipped: Vec<I> },
}

pub(crate) struct PipelineInner<I: Send + 'static, T: Send + 'static> {
    name: String,
    scheduler: Scheduler,
    factory: Arc<dyn PackageFactory<I, T>>,
    flow: Mutex<FlowState<T>>,
    stages: OnceLock<Vec<Arc<dyn StageHandle<T>>>>,
    filter: OnceLock<LoopActor<FilterBody<I, T>>>,
    events: EventHub<I, T>,
    next_package: AtomicU64,
}

/// A chain of stages with admission control.
///
/// Configure with the `plug*` methods, then call [`Pipeline::construct`]
/// once before processing anything. Dropping the pipeline cancels it and
/// waits for every stage.
pub struct Pipeline<I: Send + 'static, T: Send + 'static> {
    inner: Arc<PipelineInner<I, T>>,
    config: PipelineConfig,
    plugged: Vec<Arc<dyn StageHandle<T>>>,
    filter: Option<Arc<dyn Filter<I>>>,
    constructed: bool,
}

impl<I: Send + 'static, T: Send + 'static> Pipeline<I, T> {
    pub fn new<F>(scheduler: &Scheduler, factory: F, config: PipelineConfig) -> Self
    where
        F: PackageFactory<I, T>,
    {
        let inner = PipelineInner {
            name: config.name.clone(),
            scheduler: scheduler.clone(),
            factory: Arc::new(factory),
            flow: Mutex::new(FlowState::new(config.max_in_flight, config.priority)),
            stages: OnceLock::new(),
            filter: OnceLock::new(),
            events: EventHub::new(&config.name),
            next_package: AtomicU64::new(1),
        };
        Pipeline {
            inner: Arc::new(inner),
            config,
            plugged: Vec::new(),
            filter: None,
            constructed: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    // --- Configuration ---

    /// Appends a stage run by a single worker actor.
    pub fn plug<S>(&mut self, stage: S) -> Result<(), PipelineError>
    where
        S: Stage<Payload = T>,
    {
        let config = self.stage_config(self.next_index());
        let worker = WorkerActor::with_config(stage, &self.inner.scheduler, config)?;
        self.push_stage(Arc::new(worker));
        Ok(())
    }

    /// Appends a fan-out group of `count` workers built by `make`, bounded
    /// by [`PipelineConfig::parallel_width`]. A width of one plugs a single
    /// worker.
    pub fn plug_parallel<S, F>(&mut self, count: usize, mut make: F) -> Result<(), PipelineError>
    where
        S: Stage<Payload = T>,
        F: FnMut(usize) -> S,
    {
        let width = self.config.parallel_width(count);
        if width == 1 {
            return self.plug(make(0));
        }

        let index = self.next_index();
        let base = self.stage_config(index);
        let group_name = base.name.clone().unwrap_or_default();
        let mut group = FanOut::new(group_name.clone());
        for member in 0..width {
            let config = ActorConfig {
                name: Some(format!("{}.{}", group_name, member)),
                ..base.clone()
            };
            group.add(WorkerActor::with_config(make(member), &self.inner.scheduler, config)?);
        }
        log_flow!(self.inner.name, "fan_out_plugged", stage = index, width);
        self.push_stage(Arc::new(group));
        Ok(())
    }

    /// Appends a stage run by a loop actor. With `sent_out_limit` the loop
    /// takes one package at a time and pauses while more than the limit sit
    /// in later stages.
    pub fn plug_loop<S>(&mut self, stage: S, sent_out_limit: Option<usize>) -> Result<(), PipelineError>
    where
        S: Stage<Payload = T>,
    {
        let mut config = self.stage_config(self.next_index());
        if sent_out_limit.is_some() {
            config = config.with_max_batch(1);
        }
        let loop_stage = LoopStage::new(stage, &self.inner.scheduler, config)?;
        if let Some(limit) = sent_out_limit {
            loop_stage.throttle(self.inner.lock_flow().gauge(), limit);
        }
        self.push_stage(Arc::new(loop_stage));
        Ok(())
    }

    /// Puts `filter` in front of the pipeline. Items then pass through a loop
    /// actor that drops the rejected ones before packages are built.
    ///
    /// # Panics
    /// If the pipeline has been constructed.
    pub fn plug_filter<F>(&mut self, filter: F)
    where
        F: Filter<I>,
    {
        self.assert_configurable("plug_filter");
        if self.filter.is_some() {
            tracing::warn!(pipeline = %self.inner.name, "replacing previously plugged filter");
        }
        self.filter = Some(Arc::new(filter));
    }

    /// Wires the plugged stages together and applies the pipeline priority.
    ///
    /// # Panics
    /// If called twice.
    pub fn construct(&mut self) -> Result<(), PipelineError> {
        assert!(!self.constructed, "pipeline `{}` constructed twice", self.inner.name);
        if self.plugged.is_empty() {
            tracing::warn!(pipeline = %self.inner.name, "Nothing plugged in. It's a noop.");
            return Err(PipelineError::Empty(self.inner.name.clone()));
        }

        let priority = self.inner.lock_flow().priority;

        if let Some(filter) = &self.filter {
            let body = FilterBody {
                filter: Arc::clone(filter),
                factory: Arc::clone(&self.inner.factory),
                pipeline: Arc::downgrade(&self.inner),
            };
            let config = ActorConfig::named(format!("{}-filter", self.inner.name)).with_priority(priority);
            let actor = LoopActor::with_config(body, &self.inner.scheduler, config)?;
            // `construct` runs once, so the cell is empty.
            let _ = self.inner.filter.set(actor);
        }

        let stages = std::mem::take(&mut self.plugged);
        self.wire(&stages);
        for stage in &stages {
            stage.set_priority(priority);
        }
        log_flow!(self.inner.name, "constructed", stages = stages.len(), priority = ?priority);
        let _ = self.inner.stages.set(stages);
        self.constructed = true;
        Ok(())
    }

    // --- Processing ---

    /// Submits one item. Returns `false` if a plugged filter rejects it or
    /// no package could be built from it. The filter runs on the calling
    /// thread here.
    ///
    /// # Panics
    /// If the pipeline has not been constructed.
    pub fn process(&self, item: I) -> bool {
        self.assert_constructed();
        if let Some(filter) = &self.filter {
            if !filter.admit(&item) {
                tracing::debug!(pipeline = %self.inner.name, "item rejected by filter");
                return false;
            }
        }
        self.build_and_admit(std::slice::from_ref(&item)) == 1
    }

    /// Submits many items and returns how many were accepted. With a filter
    /// plugged the items are queued for the filter loop and all count as
    /// accepted; the rejected ones are reported as `Skipped`.
    ///
    /// # Panics
    /// If the pipeline has not been constructed.
    pub fn process_batch(&self, items: Vec<I>) -> usize {
        self.assert_constructed();
        if items.is_empty() {
            return 0;
        }
        if self.inner.filter.get().is_some() {
            let accepted = items.len();
            self.inner.queue_for_filter(items);
            return accepted;
        }
        self.build_and_admit(&items)
    }

    fn build_and_admit(&self, items: &[I]) -> usize {
        let mut packages = Vec::with_capacity(items.len());
        for item in items {
            match self.inner.factory.build(item) {
                Some(payload) => packages.push(self.inner.package(payload)),
                None => tracing::warn!(
                    pipeline = %self.inner.name,
                    "item lacks the data needed to build a package; not processed"
                ),
            }
        }
        let accepted = packages.len();
        if accepted > 0 {
            self.inner.admit(packages, Intake::Direct);
        }
        accepted
    }

    // --- Control ---

    /// Changes the priority of every stage. No-op if unchanged.
    pub fn set_priority(&self, priority: Priority) {
        let mut flow = self.inner.lock_flow();
        if flow.priority == priority {
            return;
        }
        flow.priority = priority;
        for stage in self.inner.stages() {
            stage.set_priority(priority);
        }
        if let Some(filter) = self.inner.filter.get() {
            filter.set_priority(priority);
        }
        log_flow!(self.inner.name, "priority_changed", priority = ?priority);
    }

    pub fn priority(&self) -> Priority {
        self.inner.lock_flow().priority
    }

    /// Drops every queued and delayed package and stops all stages.
    /// Completions of packages admitted before the call are ignored.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Blocks until every stage and the filter are idle.
    pub fn wait(&self) {
        for stage in self.inner.stages().iter().chain(self.plugged.iter()) {
            stage.wait();
        }
        if let Some(filter) = self.inner.filter.get() {
            filter.wait();
        }
    }

    /// Whether nothing is in flight and nothing waits for the filter.
    pub fn has_finished(&self) -> bool {
        self.inner.lock_flow().has_finished()
    }

    // --- Observation ---

    /// Channel receiving an owned copy of every event from now on.
    pub fn subscribe(&self) -> flume::Receiver<PipelineSignal> {
        self.inner.events.subscribe()
    }

    pub fn add_observer<O>(&self, observer: O)
    where
        O: Observer<I, T>,
    {
        self.inner.events.observe(Arc::new(observer));
    }

    pub fn flow_snapshot(&self) -> FlowSnapshot {
        self.inner.lock_flow().snapshot()
    }

    pub fn stage_count(&self) -> usize {
        self.inner.stages().len() + self.plugged.len()
    }

    // --- Helpers ---

    fn next_index(&self) -> usize {
        self.assert_configurable("plug");
        let index = self.plugged.len();
        assert!(
            index < ProcessFlags::MAX_STAGES,
            "pipeline `{}` supports at most {} stages",
            self.inner.name,
            ProcessFlags::MAX_STAGES
        );
        index
    }

    fn assert_constructed(&self) {
        assert!(
            self.constructed,
            "pipeline `{}` used before construct()",
            self.inner.name
        );
    }

    fn assert_configurable(&self, operation: &str) {
        assert!(
            !self.constructed,
            "{}() called on pipeline `{}` after construct()",
            operation,
            self.inner.name
        );
    }

    fn stage_config(&self, index: usize) -> ActorConfig {
        ActorConfig::named(format!("{}-stage-{}", self.inner.name, index)).with_priority(self.config.priority)
    }

    fn push_stage(&mut self, stage: Arc<dyn StageHandle<T>>) {
        tracing::debug!(pipeline = %self.inner.name, stage = stage.name(), "stage plugged");
        self.plugged.push(stage);
    }

    /// Stage *n* feeds stage *n + 1*; the last one and every abandoned
    /// package go back to the pipeline.
    fn wire(&self, stages: &[Arc<dyn StageHandle<T>>]) {
        for (index, stage) in stages.iter().enumerate() {
            let flag = ProcessFlags::stage(index);
            let processed: Route<T> = match stages.get(index + 1) {
                Some(next) => {
                    let next = Arc::clone(next);
                    let pipeline = Arc::downgrade(&self.inner);
                    Arc::new(move |mut package: WorkPackage<T>| {
                        package.mark(flag);
                        if let Some(pipeline) = pipeline.upgrade() {
                            pipeline.forward(&*next, package);
                        }
                    })
                }
                None => {
                    let pipeline = Arc::downgrade(&self.inner);
                    Arc::new(move |mut package: WorkPackage<T>| {
                        package.mark(flag);
                        if let Some(pipeline) = pipeline.upgrade() {
                            pipeline.finish_process(package);
                        }
                    })
                }
            };
            let pipeline = Arc::downgrade(&self.inner);
            let abandoned: Route<T> = Arc::new(move |package: WorkPackage<T>| {
                if let Some(pipeline) = pipeline.upgrade() {
                    pipeline.finish_process(package);
                }
            });
            stage.outlet().connect(processed, abandoned);
        }
    }
}

impl<I: Send + 'static, T: Send + 'static> Drop for Pipeline<I, T> {
    fn drop(&mut self) {
        if self.constructed {
            self.inner.cancel();
        }
        self.wait();
    }
}

impl<I: Send + 'static, T: Send + 'static> PipelineInner<I, T> {
    fn lock_flow(&self) -> MutexGuard<'_, FlowState<T>> {
        self.flow.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stages(&self) -> &[Arc<dyn StageHandle<T>>] {
        self.stages.get().map(Vec::as_slice).unwrap_or(&[])
    }

    fn package(&self, payload: T) -> WorkPackage<T> {
        WorkPackage::new(PackageId(self.next_package.fetch_add(1, Ordering::SeqCst)), payload)
    }

    /// Schedules every stage unless they already run. Called under the flow
    /// lock so a concurrent drain cannot interleave.
    fn ensure_started(&self, flow: &mut FlowState<T>) -> bool {
        if flow.started {
            return false;
        }
        flow.started = true;
        for stage in self.stages() {
            stage.schedule();
        }
        log_flow!(self.name, "started");
        true
    }

    /// Deactivates every stage. The interrupters are returned so they can
    /// run once the flow lock is released.
    #[must_use]
    fn stop_locked(&self, flow: &mut FlowState<T>, mode: DeactivatingMode) -> Vec<Arc<dyn Interrupt>> {
        flow.started = false;
        self.stages()
            .iter()
            .flat_map(|stage| stage.stop(mode))
            .collect()
    }

    fn fire(interrupters: Vec<Arc<dyn Interrupt>>) {
        for interrupter in interrupters {
            interrupter.about_to_deactivate();
        }
    }

    fn queue_for_filter(&self, items: Vec<I>) {
        let Some(filter) = self.filter.get() else {
            return;
        };
        let generation = {
            let mut flow = self.lock_flow();
            flow.queue_for_filter(items.len());
            flow.generation()
        };
        filter.append(items.into_iter().map(|item| Queued { generation, item }));
    }

    /// Results of one filter batch, all from the same generation.
    pub(crate) fn dispatch_filtered(&self, generation: u64, payloads: Vec<T>, skipped: Vec<I>) {
        let packages = payloads.into_iter().map(|payload| self.package(payload)).collect();
        self.admit(packages, Intake::Filtered { generation, skipped });
    }

    /// Hands a package from one stage to the next unless it belongs to a
    /// cancelled generation. The hand-over happens under the flow lock so a
    /// concurrent `cancel` cannot miss it.
    fn forward(&self, next: &dyn StageHandle<T>, package: WorkPackage<T>) {
        let stale = {
            let flow = self.lock_flow();
            if !flow.is_stale(package.id()) {
                next.process(package);
                return;
            }
            package
        };
        tracing::trace!(pipeline = %self.name, package = %stale.id(), "dropping package of a cancelled run");
    }

    /// Sender side of the flow: start the stages, account for the packages,
    /// announce them and hand the admitted ones to the first stage.
    ///
    /// Every package is accounted for in one critical section, so a later
    /// `cancel` treats them like any other package in flight.
    fn admit(&self, packages: Vec<WorkPackage<T>>, intake: Intake<I>) {
        let (generation, skipped) = match intake {
            Intake::Filtered { generation, skipped } => (Some(generation), skipped),
            Intake::Direct => (None, Vec::new()),
        };

        // Admitted or turned away, in submission order.
        let mut offered = Vec::with_capacity(packages.len());
        let (current, started, finished, interrupters) = {
            let mut flow = self.lock_flow();
            if let Some(generation) = generation {
                if generation != flow.generation() {
                    log_flow!(self.name, "stale_filter_results", dropped = packages.len() + skipped.len());
                    return;
                }
                flow.resolve_filtered(packages.len() + skipped.len());
            }

            let mut started = false;
            for package in packages {
                if flow.is_stale(package.id()) {
                    continue;
                }
                started |= self.ensure_started(&mut flow);
                offered.push(flow.offer(package));
            }

            let finished = flow.take_finished();
            let interrupters = if finished {
                self.stop_locked(&mut flow, DeactivatingMode::KeepPending)
            } else {
                Vec::new()
            };
            (flow.generation(), started, finished, interrupters)
        };
        Self::fire(interrupters);

        if started {
            self.events.emit(PipelineEvent::Scheduled);
            self.events.emit(PipelineEvent::Started);
        }
        if !skipped.is_empty() {
            self.events.emit(PipelineEvent::Skipped(&skipped));
        }

        let mut waiting = Vec::new();
        for offer in offered {
            match offer {
                Ok(package) => {
                    self.events.emit(PipelineEvent::Processing(&package));
                    self.send_to_first(package);
                }
                Err(package) => {
                    self.events.emit(PipelineEvent::Processing(&package));
                    tracing::trace!(pipeline = %self.name, package = %package.id(), "package delayed");
                    waiting.push(package);
                }
            }
        }

        if !waiting.is_empty() {
            let readmitted = {
                let mut flow = self.lock_flow();
                if flow.generation() != current {
                    Vec::new()
                } else {
                    flow.delay(waiting)
                }
            };
            for package in readmitted {
                self.events.emit(PipelineEvent::Processing(&package));
                self.send_to_first(package);
            }
        }

        if finished {
            log_flow!(self.name, "finished");
            self.events.emit(PipelineEvent::Finished);
        }
    }

    fn send_to_first(&self, package: WorkPackage<T>) {
        if let Some(first) = self.stages().first() {
            self.forward(&**first, package);
        }
    }

    /// Receiver side of the flow, called once a package leaves the last
    /// stage or is abandoned.
    fn finish_process(&self, package: WorkPackage<T>) {
        let (progress, readmitted, finished, interrupters) = {
            let mut flow = self.lock_flow();
            if flow.is_stale(package.id()) {
                tracing::trace!(pipeline = %self.name, package = %package.id(), "dropping package of a cancelled run");
                return;
            }
            let progress = flow.complete();
            let readmitted = flow.readmit();
            let finished = flow.take_finished();
            let interrupters = if finished {
                self.stop_locked(&mut flow, DeactivatingMode::KeepPending)
            } else {
                Vec::new()
            };
            (progress, readmitted, finished, interrupters)
        };
        Self::fire(interrupters);

        self.events.emit(PipelineEvent::Processed(&package));
        self.events.emit(PipelineEvent::Progress(progress));
        drop(package);

        if let Some(package) = readmitted {
            self.events.emit(PipelineEvent::Processing(&package));
            self.send_to_first(package);
        }

        for stage in self.stages() {
            stage.check_restart();
        }

        if finished {
            log_flow!(self.name, "finished");
            self.events.emit(PipelineEvent::Finished);
        }
    }

    fn cancel(&self) {
        let next = PackageId(self.next_package.load(Ordering::SeqCst));
        let (dropped, interrupters) = {
            let mut flow = self.lock_flow();
            let dropped = flow.cancel(next);
            let mut interrupters = self.stop_locked(&mut flow, DeactivatingMode::FlushPending);
            if let Some(filter) = self.filter.get() {
                filter.clear_pending();
                interrupters.extend(filter.request_deactivate(DeactivatingMode::FlushPending));
            }
            (dropped, interrupters)
        };
        Self::fire(interrupters);
        log_flow!(self.name, "cancelled", delayed_dropped = dropped);
    }
}
