//! # Scheduler
//!
//! A [`Scheduler`] bundles the thread pool that runs actors and the broker
//! thread that owns their bodies between runs. Actors are created against a
//! scheduler handle; several independent schedulers may coexist, and
//! [`Scheduler::global`] offers a lazily created process-wide one.
//!
//! ## Key Responsibilities
//! - Register actor bodies with the broker and reserve their pool slots
//! - Submit pool tasks
//! - Explicit, joinable shutdown

pub(crate) mod broker;
pub mod pool;
pub(crate) mod task;

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use lazy_static::lazy_static;

use self::broker::{Broker, BrokerHandle, ParkedBody};
use self::pool::{PoolMetrics, ThreadPool};
use crate::log_scheduler;
use crate::thread::ActorId;
use crate::thread::config::SchedulerConfig;
use crate::thread::error::SchedulerError;

lazy_static! {
    static ref GLOBAL: Mutex<Option<Scheduler>> = Mutex::new(None);
}

/// Cloneable handle to a pool and its broker.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    config: SchedulerConfig,
    pool: ThreadPool,
    broker: Broker,
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        self.pool.signal_shutdown();
        self.broker.signal_shutdown();
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.inner.config)
            .field("pool", &self.inner.pool)
            .finish()
    }
}

impl Scheduler {
    /// Starts the broker thread and the base pool threads.
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        let broker = Broker::spawn(&config.broker_thread_name)?;
        let pool = match ThreadPool::new(&config) {
            Ok(pool) => pool,
            Err(err) => {
                broker.shutdown()?;
                return Err(err);
            }
        };
        Ok(Scheduler {
            inner: Arc::new(SchedulerInner {
                config,
                pool,
                broker,
            }),
        })
    }

    /// Process-wide scheduler, created with default settings on first use.
    pub fn global() -> Result<Scheduler, SchedulerError> {
        let mut global = GLOBAL.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(scheduler) = global.as_ref() {
            return Ok(scheduler.clone());
        }
        let scheduler = Scheduler::new(SchedulerConfig::default())?;
        *global = Some(scheduler.clone());
        Ok(scheduler)
    }

    /// Shuts the process-wide scheduler down. The next call to
    /// [`Scheduler::global`] creates a fresh one.
    pub fn shutdown_global() -> Result<(), SchedulerError> {
        let scheduler = GLOBAL
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match scheduler {
            Some(scheduler) => scheduler.shutdown(),
            None => Ok(()),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> PoolMetrics {
        self.inner.pool.metrics()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.pool.is_shutting_down()
    }

    /// Stops the pool and the broker and joins their threads.
    ///
    /// Actors must be deactivated and waited for beforehand; a pool thread
    /// still running an actor is joined only once that actor stops.
    pub fn shutdown(&self) -> Result<(), SchedulerError> {
        log_scheduler!("scheduler", "shutdown_requested");
        let pool = self.inner.pool.shutdown();
        let broker = self.inner.broker.shutdown();
        pool.and(broker)
    }

    pub(crate) fn pool(&self) -> &ThreadPool {
        &self.inner.pool
    }

    pub(crate) fn broker(&self) -> BrokerHandle {
        self.inner.broker.handle()
    }

    /// Parks a new actor body and reserves its pool slot.
    pub(crate) fn register(&self, actor: ActorId, body: ParkedBody) -> Result<(), SchedulerError> {
        self.inner.pool.reserve()?;
        if let Err(err) = self.inner.broker.handle().park(actor, body) {
            self.inner.pool.release();
            return Err(err);
        }
        log_scheduler!("scheduler", "actor_registered", actor = %actor);
        Ok(())
    }

    /// Forgets a destroyed actor and releases its pool slot.
    pub(crate) fn unregister(&self, actor: ActorId) {
        self.inner.broker.handle().forget(actor);
        self.inner.pool.release();
        log_scheduler!("scheduler", "actor_unregistered", actor = %actor);
    }
}
