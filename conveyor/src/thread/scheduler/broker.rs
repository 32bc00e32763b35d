//! # Broker Thread
//!
//! The broker is a service running on one dedicated thread that owns every
//! actor body while it is not running. Pool tasks `acquire` a body before a
//! run and `park` it again afterwards, so a body always passes through the
//! broker between two pool threads and is never reachable from two threads
//! at once.
//!
//! ## Key Responsibilities
//! - Keep the registry of parked bodies
//! - Answer `acquire` requests, immediately or as soon as the body is parked
//! - Drop bodies of actors that were destroyed
//!
//! All registry state is owned by the broker thread; callers talk to it
//! through a [`BrokerHandle`] over a `flume` command channel.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use downcast_rs::{Downcast, impl_downcast};
use flume::{Receiver, Sender};

use crate::log_scheduler;
use crate::thread::ActorId;
use crate::thread::error::SchedulerError;

/// Anything that can be parked with the broker.
pub trait Parked: Downcast + Send {}
impl<T: Send + 'static> Parked for T {}
impl_downcast!(Parked);

pub(crate) type ParkedBody = Box<dyn Parked>;

enum BrokerCommand {
    Park { actor: ActorId, body: ParkedBody },
    Acquire { actor: ActorId, reply: Sender<ParkedBody> },
    Forget { actor: ActorId },
    Shutdown,
}

/// Cloneable client side of the broker.
#[derive(Clone)]
pub struct BrokerHandle {
    commands: Sender<BrokerCommand>,
}

impl fmt::Debug for BrokerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerHandle")
            .field("disconnected", &self.commands.is_disconnected())
            .finish()
    }
}

impl BrokerHandle {
    /// Hands `body` to the broker. A pending `acquire` for the same actor is
    /// answered right away.
    pub(crate) fn park(&self, actor: ActorId, body: ParkedBody) -> Result<(), SchedulerError> {
        self.commands
            .send(BrokerCommand::Park { actor, body })
            .map_err(|_| SchedulerError::BrokerUnavailable)
    }

    /// Blocks until the body of `actor` is parked, then moves it to the
    /// calling thread.
    pub(crate) fn acquire(&self, actor: ActorId) -> Result<ParkedBody, SchedulerError> {
        let (reply, response) = flume::bounded(1);
        self.commands
            .send(BrokerCommand::Acquire { actor, reply })
            .map_err(|_| SchedulerError::BrokerUnavailable)?;
        response.recv().map_err(|_| SchedulerError::UnknownActor(actor))
    }

    /// Drops the parked body of a destroyed actor.
    pub(crate) fn forget(&self, actor: ActorId) {
        if self.commands.send(BrokerCommand::Forget { actor }).is_err() {
            tracing::debug!(%actor, "broker already stopped, nothing to forget");
        }
    }
}

/// Owner of the broker thread.
pub(crate) struct Broker {
    handle: BrokerHandle,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Broker {
    pub(crate) fn spawn(name: &str) -> Result<Self, SchedulerError> {
        let (commands, inbox) = flume::unbounded();
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(inbox))?;
        log_scheduler!("broker", "started", thread = name);
        Ok(Broker {
            handle: BrokerHandle { commands },
            thread: Mutex::new(Some(thread)),
        })
    }

    pub(crate) fn handle(&self) -> BrokerHandle {
        self.handle.clone()
    }

    /// Stops the broker thread without waiting for it.
    pub(crate) fn signal_shutdown(&self) {
        let _ = self.handle.commands.send(BrokerCommand::Shutdown);
    }

    /// Stops the broker thread and joins it. Bodies still parked are dropped.
    pub(crate) fn shutdown(&self) -> Result<(), SchedulerError> {
        self.signal_shutdown();
        let thread = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(thread) = thread {
            thread
                .join()
                .map_err(|_| anyhow::anyhow!("broker thread panicked"))?;
            log_scheduler!("broker", "stopped");
        }
        Ok(())
    }
}

#[derive(Default)]
struct Registry {
    parked: HashMap<ActorId, ParkedBody>,
    waiting: HashMap<ActorId, Sender<ParkedBody>>,
}

impl Registry {
    fn park(&mut self, actor: ActorId, body: ParkedBody) {
        let body = match self.waiting.remove(&actor) {
            Some(reply) => match reply.send(body) {
                Ok(()) => return,
                // The acquiring task is gone; keep the body.
                Err(flume::SendError(body)) => body,
            },
            None => body,
        };
        if self.parked.insert(actor, body).is_some() {
            tracing::error!(%actor, "actor body parked twice, dropping the older one");
        }
    }

    fn acquire(&mut self, actor: ActorId, reply: Sender<ParkedBody>) {
        match self.parked.remove(&actor) {
            Some(body) => {
                if let Err(flume::SendError(body)) = reply.send(body) {
                    self.parked.insert(actor, body);
                }
            }
            None => {
                if self.waiting.insert(actor, reply).is_some() {
                    tracing::error!(%actor, "two pool tasks acquired the same actor");
                }
            }
        }
    }

    fn forget(&mut self, actor: ActorId) {
        self.waiting.remove(&actor);
        if self.parked.remove(&actor).is_none() {
            tracing::debug!(%actor, "forgot an actor that was not parked");
        }
    }
}

fn run(inbox: Receiver<BrokerCommand>) {
    let mut registry = Registry::default();
    // Blocks on the channel while no handoff is pending.
    while let Ok(command) = inbox.recv() {
        match command {
            BrokerCommand::Park { actor, body } => registry.park(actor, body),
            BrokerCommand::Acquire { actor, reply } => registry.acquire(actor, reply),
            BrokerCommand::Forget { actor } => registry.forget(actor),
            BrokerCommand::Shutdown => break,
        }
    }
    tracing::debug!(parked = registry.parked.len(), "broker loop exited");
}
