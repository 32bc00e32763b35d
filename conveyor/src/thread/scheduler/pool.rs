use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender};

use super::task::PoolTask;
use crate::log_scheduler;
use crate::thread::config::SchedulerConfig;
use crate::thread::priority;
use crate::thread::error::SchedulerError;

/// Status codes for the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolStatus {
    /// Pool is running normally
    Running = 0,

    /// Pool is refusing new tasks and stopping its threads
    ShuttingDown = 1,

    /// Every pool thread has been joined
    Shutdown = 2,
}

/// Point-in-time view of the pool
#[derive(Debug, Clone)]
pub struct PoolMetrics {
    /// Threads kept regardless of demand
    pub pool_size: usize,

    /// Slots reserved by live actors
    pub reserved: usize,

    /// Threads the pool currently allows, `max(pool_size, reserved)`
    pub capacity: usize,

    /// Threads currently alive
    pub live_threads: usize,

    /// Tasks waiting for a free thread
    pub queued_tasks: usize,

    /// Current status
    pub status: PoolStatus,
}

enum Job {
    Run(PoolTask),
    Exit,
}

/// Bounded pool of OS threads executing [`PoolTask`]s.
///
/// Every live actor reserves one slot, so a running actor that occupies a
/// thread for a long time never starves the actors queued behind it.
/// Threads above capacity retire after sitting idle for
/// [`SchedulerConfig::idle_timeout`].
///
/// # Worker Thread Behavior
/// 1. Waits for a job on the shared `flume` channel
/// 2. Runs the task, catching panics
/// 3. On idle timeout, exits if the pool is above capacity
#[derive(Clone)]
pub struct ThreadPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    pool_size: usize,
    idle_timeout: Duration,
    thread_name_prefix: String,
    jobs: Sender<Job>,
    queue: Receiver<Job>,
    reserved: AtomicUsize,
    live: AtomicUsize,
    spawned: AtomicUsize,
    is_shutting_down: AtomicBool,
    status: AtomicUsize,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("metrics", &self.metrics())
            .finish()
    }
}

impl ThreadPool {
    /// Creates the pool and starts its base threads.
    pub(crate) fn new(config: &SchedulerConfig) -> Result<Self, SchedulerError> {
        let (jobs, queue) = flume::unbounded();
        let pool = ThreadPool {
            inner: Arc::new(PoolInner {
                pool_size: config.pool_size.max(1),
                idle_timeout: config.idle_timeout,
                thread_name_prefix: config.thread_name_prefix.clone(),
                jobs,
                queue,
                reserved: AtomicUsize::new(0),
                live: AtomicUsize::new(0),
                spawned: AtomicUsize::new(0),
                is_shutting_down: AtomicBool::new(false),
                status: AtomicUsize::new(PoolStatus::Running as usize),
                threads: Mutex::new(Vec::new()),
            }),
        };
        pool.inner.ensure_capacity()?;
        log_scheduler!("pool", "started", threads = pool.inner.pool_size);
        Ok(pool)
    }

    /// Reserves a slot for one more actor, growing the pool if needed.
    pub(crate) fn reserve(&self) -> Result<(), SchedulerError> {
        if self.is_shutting_down() {
            return Err(SchedulerError::ShuttingDown);
        }
        self.inner.reserved.fetch_add(1, Ordering::SeqCst);
        if let Err(err) = self.inner.ensure_capacity() {
            self.release();
            return Err(err);
        }
        Ok(())
    }

    /// Gives a slot back. Surplus threads retire once idle.
    pub(crate) fn release(&self) {
        let _ = self
            .inner
            .reserved
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub(crate) fn submit(&self, task: PoolTask) -> Result<(), SchedulerError> {
        if self.is_shutting_down() {
            return Err(SchedulerError::ShuttingDown);
        }
        self.inner
            .jobs
            .send(Job::Run(task))
            .map_err(|_| SchedulerError::ShuttingDown)
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.is_shutting_down.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> PoolStatus {
        match self.inner.status.load(Ordering::Relaxed) {
            0 => PoolStatus::Running,
            1 => PoolStatus::ShuttingDown,
            _ => PoolStatus::Shutdown,
        }
    }

    pub fn metrics(&self) -> PoolMetrics {
        PoolMetrics {
            pool_size: self.inner.pool_size,
            reserved: self.inner.reserved.load(Ordering::Relaxed),
            capacity: self.capacity(),
            live_threads: self.inner.live.load(Ordering::Relaxed),
            queued_tasks: self.inner.queue.len(),
            status: self.status(),
        }
    }

    /// Asks every thread to exit without waiting for them.
    pub(crate) fn signal_shutdown(&self) {
        if self.inner.is_shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner
            .status
            .store(PoolStatus::ShuttingDown as usize, Ordering::SeqCst);
        for _ in 0..self.inner.live.load(Ordering::SeqCst) {
            let _ = self.inner.jobs.send(Job::Exit);
        }
    }

    /// Stops accepting tasks and joins every pool thread.
    ///
    /// Threads finish the task they are running first, so running actors
    /// should be deactivated before the pool is shut down.
    pub(crate) fn shutdown(&self) -> Result<(), SchedulerError> {
        self.signal_shutdown();
        let threads = std::mem::take(
            &mut *self
                .inner
                .threads
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        let mut panicked = 0;
        for thread in threads {
            if thread.join().is_err() {
                panicked += 1;
            }
        }
        self.inner
            .status
            .store(PoolStatus::Shutdown as usize, Ordering::SeqCst);
        log_scheduler!("pool", "stopped");
        if panicked > 0 {
            return Err(SchedulerError::Shutdown(format!(
                "{panicked} pool threads panicked"
            )));
        }
        Ok(())
    }
}

impl PoolInner {
    fn ensure_capacity(self: &Arc<Self>) -> Result<(), SchedulerError> {
        loop {
            let live = self.live.load(Ordering::SeqCst);
            if live >= self.capacity() {
                return Ok(());
            }
            if self
                .live
                .compare_exchange(live, live + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                continue;
            }
            if let Err(err) = self.spawn_thread() {
                self.live.fetch_sub(1, Ordering::SeqCst);
                return Err(err);
            }
        }
    }

    fn spawn_thread(self: &Arc<Self>) -> Result<(), SchedulerError> {
        let index = self.spawned.fetch_add(1, Ordering::SeqCst);
        let name = format!("{}{}", self.thread_name_prefix, index);
        let inner = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || inner.worker_loop())
            .map_err(|e| SchedulerError::ThreadSetup(format!("{name}: {e}")))?;
        let mut threads = self
            .threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        threads.retain(|thread| !thread.is_finished());
        threads.push(handle);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.pool_size.max(self.reserved.load(Ordering::SeqCst))
    }

    fn worker_loop(self: Arc<Self>) {
        loop {
            match self.queue.recv_timeout(self.idle_timeout) {
                Ok(Job::Run(task)) => {
                    let label = task.label().to_string();
                    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| task.run())) {
                        tracing::error!(
                            task = %label,
                            error = panic_message(&*panic),
                            "pool task panicked"
                        );
                    }
                    if priority::take_altered() {
                        tracing::debug!(task = %label, "replacing pool thread left at a lowered priority");
                        self.live.fetch_sub(1, Ordering::SeqCst);
                        if !self.is_shutting_down.load(Ordering::SeqCst) {
                            if let Err(err) = self.ensure_capacity() {
                                tracing::error!(error = %err, "could not replace pool thread");
                            }
                        }
                        return;
                    }
                }
                Ok(Job::Exit) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    if self.is_shutting_down.load(Ordering::SeqCst) {
                        break;
                    }
                    if self.try_retire() {
                        tracing::debug!("surplus pool thread retired");
                        return;
                    }
                }
            }
        }
        self.live.fetch_sub(1, Ordering::SeqCst);
    }

    fn try_retire(&self) -> bool {
        self.live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
                (live > self.capacity()).then(|| live - 1)
            })
            .is_ok()
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic payload"
    }
}
