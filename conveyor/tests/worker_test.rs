// Integration tests for conveyor::thread::WorkerActor

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use common::*;
use conveyor::thread::{ActorConfig, WorkerActor};
use conveyor_api::{ActorState, DeactivatingMode, Interrupt, Outlet, PackageId, Priority, Stage, WorkPackage};

fn ids(received: &flume::Receiver<WorkPackage<u64>>) -> Vec<u64> {
    received.try_iter().map(|package| package.id().0).collect()
}

/// Starts `worker`, queues package 0 and blocks until the stage is inside it.
fn block_on_first(
    worker: &WorkerActor<Gated>,
    entered: &flume::Receiver<PackageId>,
) {
    worker.schedule();
    worker.process(package(0));
    assert_eq!(entered.recv_timeout(TIMEOUT).unwrap(), PackageId(0));
}

#[test]
fn test_processes_packages_in_submission_order() {
    let scheduler = test_scheduler(2);
    let worker = WorkerActor::new(Add(100), &scheduler).unwrap();
    let done = collect(worker.outlet());

    worker.schedule();
    for id in 1..=20 {
        worker.process(package(id));
    }

    let mut payloads = Vec::new();
    for _ in 1..=20 {
        let package = done.recv_timeout(TIMEOUT).unwrap();
        payloads.push((package.id().0, *package.payload()));
    }
    let expected: Vec<_> = (1..=20).map(|id| (id, id + 100)).collect();
    assert_eq!(payloads, expected);

    worker.deactivate(DeactivatingMode::FlushPending);
    worker.wait();
    assert_eq!(worker.state(), ActorState::Inactive);
}

#[test]
fn test_calls_queue_while_inactive() {
    let scheduler = test_scheduler(1);
    let worker = WorkerActor::new(Forward, &scheduler).unwrap();
    let done = collect(worker.outlet());

    worker.process(package(1));
    worker.process(package(2));
    assert_eq!(worker.pending(), 2);
    assert_eq!(worker.state(), ActorState::Inactive);
    assert!(done.try_recv().is_err());

    worker.schedule();
    assert_eq!(done.recv_timeout(TIMEOUT).unwrap().id(), PackageId(1));
    assert_eq!(done.recv_timeout(TIMEOUT).unwrap().id(), PackageId(2));

    worker.deactivate(DeactivatingMode::FlushPending);
    worker.wait();
}

#[test]
fn test_flush_pending_discards_queued_calls() {
    let scheduler = test_scheduler(2);
    let (stage, entered, tokens) = gated();
    let worker = WorkerActor::new(stage, &scheduler).unwrap();
    let done = collect(worker.outlet());

    block_on_first(&worker, &entered);
    for id in 1..=5 {
        worker.process(package(id));
    }
    worker.deactivate(DeactivatingMode::FlushPending);
    assert_eq!(worker.pending(), 0);

    tokens.send(()).unwrap();
    worker.wait();

    assert_eq!(ids(&done), vec![0]);
    assert_eq!(worker.state(), ActorState::Inactive);
}

#[test]
fn test_phase_out_runs_calls_queued_before_the_request() {
    let scheduler = test_scheduler(2);
    let (stage, entered, tokens) = gated();
    let worker = WorkerActor::new(stage, &scheduler).unwrap();
    let done = collect(worker.outlet());

    block_on_first(&worker, &entered);
    for id in 1..=5 {
        worker.process(package(id));
    }
    worker.deactivate(DeactivatingMode::PhaseOut);
    // Queued after the request; stays for the next run.
    worker.process(package(6));

    for _ in 0..6 {
        tokens.send(()).unwrap();
    }
    worker.wait();

    assert_eq!(ids(&done), vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(worker.pending(), 1);
}

#[test]
fn test_phase_out_right_after_schedule_runs_queued_calls() {
    let scheduler = test_scheduler(1);
    for _ in 0..20 {
        let worker = WorkerActor::new(Add(0), &scheduler).unwrap();
        let done = collect(worker.outlet());
        for id in 1..=5 {
            worker.process(package(id));
        }

        // Usually lands before the pool task starts running the body.
        worker.schedule();
        worker.deactivate(DeactivatingMode::PhaseOut);
        worker.wait();

        assert_eq!(ids(&done), vec![1, 2, 3, 4, 5]);
        assert_eq!(worker.pending(), 0);
        assert_eq!(worker.state(), ActorState::Inactive);
    }
}

#[test]
fn test_keep_pending_resumes_on_next_schedule() {
    let scheduler = test_scheduler(2);
    let (stage, entered, tokens) = gated();
    let worker = WorkerActor::new(stage, &scheduler).unwrap();
    let done = collect(worker.outlet());

    block_on_first(&worker, &entered);
    for id in 1..=3 {
        worker.process(package(id));
    }
    worker.deactivate(DeactivatingMode::KeepPending);
    tokens.send(()).unwrap();
    worker.wait();

    assert_eq!(ids(&done), vec![0]);
    assert_eq!(worker.pending(), 3);

    for _ in 0..3 {
        tokens.send(()).unwrap();
    }
    worker.schedule();
    assert!(wait_until(|| worker.pending() == 0 && done.len() == 3));
    assert_eq!(ids(&done), vec![1, 2, 3]);

    worker.deactivate(DeactivatingMode::FlushPending);
    worker.wait();
}

#[test]
fn test_schedule_while_deactivating_is_latched() {
    let scheduler = test_scheduler(2);
    let (stage, entered, tokens) = gated();
    let worker = WorkerActor::new(stage, &scheduler).unwrap();
    let done = collect(worker.outlet());

    block_on_first(&worker, &entered);
    worker.deactivate(DeactivatingMode::KeepPending);
    assert_eq!(worker.state(), ActorState::Deactivating);
    worker.schedule();
    tokens.send(()).unwrap();

    // The latched request starts a new run without another schedule().
    worker.process(package(1));
    assert_eq!(entered.recv_timeout(TIMEOUT).unwrap(), PackageId(1));
    tokens.send(()).unwrap();
    assert!(wait_until(|| done.len() == 2));
    assert!(worker.state().is_active());

    worker.deactivate(DeactivatingMode::FlushPending);
    worker.wait();
}

#[test]
fn test_deactivate_drops_latched_schedule() {
    let scheduler = test_scheduler(2);
    let (stage, entered, tokens) = gated();
    let worker = WorkerActor::new(stage, &scheduler).unwrap();

    block_on_first(&worker, &entered);
    worker.deactivate(DeactivatingMode::KeepPending);
    worker.schedule();
    worker.deactivate(DeactivatingMode::KeepPending);
    tokens.send(()).unwrap();
    worker.wait();

    assert_eq!(worker.state(), ActorState::Inactive);
}

#[test]
fn test_invoke_runs_in_order_with_packages() {
    struct Log(Arc<Mutex<Vec<String>>>);

    impl Stage for Log {
        type Payload = u64;

        fn process(&mut self, package: WorkPackage<u64>, outlet: &Outlet<u64>) {
            self.0.lock().unwrap().push(format!("pkg {}", package.id().0));
            outlet.emit(package);
        }
    }

    let scheduler = test_scheduler(1);
    let log = Arc::new(Mutex::new(Vec::new()));
    let worker = WorkerActor::new(Log(log.clone()), &scheduler).unwrap();
    let done = collect(worker.outlet());

    worker.process(package(1));
    worker.invoke(|stage: &mut Log| stage.0.lock().unwrap().push("reset".to_string()));
    worker.process(package(2));
    worker.schedule();

    assert_eq!(done.recv_timeout(TIMEOUT).unwrap().id(), PackageId(1));
    assert_eq!(done.recv_timeout(TIMEOUT).unwrap().id(), PackageId(2));
    assert_eq!(*log.lock().unwrap(), vec!["pkg 1", "reset", "pkg 2"]);

    worker.deactivate(DeactivatingMode::FlushPending);
    worker.wait();
}

#[test]
fn test_panicking_call_does_not_stop_the_worker() {
    struct Fragile;

    impl Stage for Fragile {
        type Payload = u64;

        fn process(&mut self, package: WorkPackage<u64>, outlet: &Outlet<u64>) {
            if package.id().0 == 2 {
                panic!("cannot handle package 2");
            }
            outlet.emit(package);
        }
    }

    let scheduler = test_scheduler(1);
    let worker = WorkerActor::new(Fragile, &scheduler).unwrap();
    let done = collect(worker.outlet());

    worker.schedule();
    for id in 1..=3 {
        worker.process(package(id));
    }
    assert_eq!(done.recv_timeout(TIMEOUT).unwrap().id(), PackageId(1));
    assert_eq!(done.recv_timeout(TIMEOUT).unwrap().id(), PackageId(3));

    worker.deactivate(DeactivatingMode::FlushPending);
    worker.wait();
}

#[test]
fn test_interrupter_called_when_active_actor_is_deactivated() {
    struct Interruptible(Arc<AtomicBool>);

    impl Stage for Interruptible {
        type Payload = u64;

        fn process(&mut self, package: WorkPackage<u64>, outlet: &Outlet<u64>) {
            outlet.emit(package);
        }

        fn interrupter(&self) -> Option<Arc<dyn Interrupt>> {
            let flag = self.0.clone();
            Some(Arc::new(move || flag.store(true, Ordering::SeqCst)))
        }
    }

    let scheduler = test_scheduler(1);
    let interrupted = Arc::new(AtomicBool::new(false));
    let worker = WorkerActor::new(Interruptible(interrupted.clone()), &scheduler).unwrap();

    // Not active yet: nothing to interrupt.
    worker.deactivate(DeactivatingMode::FlushPending);
    assert!(!interrupted.load(Ordering::SeqCst));

    worker.schedule();
    worker.deactivate(DeactivatingMode::FlushPending);
    assert!(interrupted.load(Ordering::SeqCst));
    worker.wait();
}

#[test]
fn test_wait_returns_immediately_for_idle_actor() {
    let scheduler = test_scheduler(1);
    let worker = WorkerActor::new(Forward, &scheduler).unwrap();
    worker.wait();
    assert_eq!(worker.state(), ActorState::Inactive);
}

#[test]
fn test_priority_and_name_from_config() {
    let scheduler = test_scheduler(1);
    let config = ActorConfig::named("writer").with_priority(Priority::High);
    let worker = WorkerActor::with_config(Forward, &scheduler, config).unwrap();

    assert_eq!(worker.name(), "writer");
    assert_eq!(worker.priority(), Priority::High);
    worker.set_priority(Priority::Idle);
    assert_eq!(worker.priority(), Priority::Idle);
}

#[test]
fn test_pool_grows_to_one_thread_per_actor() {
    let scheduler = test_scheduler(1);
    let workers: Vec<_> = (0..4)
        .map(|_| WorkerActor::new(Forward, &scheduler).unwrap())
        .collect();
    let outputs: Vec<_> = workers.iter().map(|worker| collect(worker.outlet())).collect();

    // Every running worker holds a pool thread while it waits for calls.
    for worker in &workers {
        worker.schedule();
    }
    for (index, worker) in workers.iter().enumerate() {
        worker.process(package(index as u64));
    }
    for (index, output) in outputs.iter().enumerate() {
        assert_eq!(output.recv_timeout(TIMEOUT).unwrap().id(), PackageId(index as u64));
    }
    assert!(scheduler.metrics().capacity >= 4);

    for worker in &workers {
        worker.deactivate(DeactivatingMode::FlushPending);
    }
    workers.iter().for_each(WorkerActor::wait);
}

#[test]
#[should_panic(expected = "dropped while still active")]
fn test_dropping_active_worker_panics() {
    let scheduler = test_scheduler(1);
    let worker = WorkerActor::new(Forward, &scheduler).unwrap();
    worker.schedule();
    drop(worker);
}
