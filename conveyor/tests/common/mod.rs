// Shared helpers for the conveyor integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use conveyor::thread::{Scheduler, SchedulerConfig};
use conveyor_api::{Outlet, PackageId, PipelineSignal, Stage, WorkPackage};
use flume::{Receiver, Sender};

/// Upper bound for anything a test waits on
pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Creates a dedicated scheduler so tests do not share pool threads
pub fn test_scheduler(pool_size: usize) -> Scheduler {
    conveyor::logging::init_test();
    let config = SchedulerConfig {
        pool_size,
        idle_timeout: Duration::from_millis(200),
        ..Default::default()
    };
    Scheduler::new(config).expect("failed to start test scheduler")
}

/// Polls `condition` until it holds or the timeout expires
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}

pub fn package(id: u64) -> WorkPackage<u64> {
    WorkPackage::new(PackageId(id), id)
}

/// Connects `outlet` to a channel receiving every completed or abandoned package
pub fn collect(outlet: &Outlet<u64>) -> Receiver<WorkPackage<u64>> {
    let (tx, rx) = flume::unbounded();
    let abandoned = tx.clone();
    outlet.connect(
        Arc::new(move |package| {
            let _ = tx.send(package);
        }),
        Arc::new(move |package| {
            let _ = abandoned.send(package);
        }),
    );
    rx
}

/// Emits every package unchanged
pub struct Forward;

impl Stage for Forward {
    type Payload = u64;

    fn process(&mut self, package: WorkPackage<u64>, outlet: &Outlet<u64>) {
        outlet.emit(package);
    }
}

/// Adds a constant to the payload
pub struct Add(pub u64);

impl Stage for Add {
    type Payload = u64;

    fn process(&mut self, mut package: WorkPackage<u64>, outlet: &Outlet<u64>) {
        *package.payload_mut() += self.0;
        outlet.emit(package);
    }
}

/// Announces each package on `entered`, then blocks until a token arrives
pub struct Gated {
    pub entered: Sender<PackageId>,
    pub tokens: Receiver<()>,
}

impl Stage for Gated {
    type Payload = u64;

    fn process(&mut self, package: WorkPackage<u64>, outlet: &Outlet<u64>) {
        let _ = self.entered.send(package.id());
        let _ = self.tokens.recv_timeout(TIMEOUT);
        outlet.emit(package);
    }
}

/// Returns a gated stage plus the channels driving it
pub fn gated() -> (Gated, Receiver<PackageId>, Sender<()>) {
    let (entered_tx, entered_rx) = flume::unbounded();
    let (token_tx, token_rx) = flume::unbounded();
    let stage = Gated {
        entered: entered_tx,
        tokens: token_rx,
    };
    (stage, entered_rx, token_tx)
}

/// Hands every package, with a clone of the outlet, to the test thread
pub struct Hold {
    pub held: Sender<(WorkPackage<u64>, Outlet<u64>)>,
}

impl Stage for Hold {
    type Payload = u64;

    fn process(&mut self, package: WorkPackage<u64>, outlet: &Outlet<u64>) {
        let _ = self.held.send((package, outlet.clone()));
    }
}

pub fn hold() -> (Hold, Receiver<(WorkPackage<u64>, Outlet<u64>)>) {
    let (tx, rx) = flume::unbounded();
    (Hold { held: tx }, rx)
}

/// Receives signals until `Finished` arrives. Returns everything received.
pub fn signals_until_finished(signals: &Receiver<PipelineSignal>) -> Vec<PipelineSignal> {
    let deadline = Instant::now() + TIMEOUT;
    let mut received = Vec::new();
    while let Ok(signal) = signals.recv_deadline(deadline) {
        let finished = signal == PipelineSignal::Finished;
        received.push(signal);
        if finished {
            break;
        }
    }
    received
}

pub fn count_finished(signals: &[PipelineSignal]) -> usize {
    signals
        .iter()
        .filter(|signal| **signal == PipelineSignal::Finished)
        .count()
}
