// Integration tests for conveyor::pipeline::Pipeline

mod common;

use std::sync::{Arc, Mutex, OnceLock, Weak};

use common::*;
use conveyor::pipeline::{Pipeline, PipelineConfig, PipelineError};
use conveyor::thread::Scheduler;
use conveyor_api::{
    Interrupt, Outlet, PackageId, PipelineEvent, PipelineSignal, Priority, ProcessFlags, Stage,
    WorkPackage,
};

fn identity(item: &u64) -> Option<u64> {
    Some(*item)
}

fn pipeline(scheduler: &Scheduler, max_in_flight: usize) -> Pipeline<u64, u64> {
    let config = PipelineConfig {
        max_in_flight,
        ..PipelineConfig::named("test")
    };
    Pipeline::new(scheduler, identity, config)
}

fn position(signals: &[PipelineSignal], wanted: &PipelineSignal) -> Option<usize> {
    signals.iter().position(|signal| signal == wanted)
}

fn last_position(signals: &[PipelineSignal], wanted: &PipelineSignal) -> Option<usize> {
    signals.iter().rposition(|signal| signal == wanted)
}

fn processed(signals: &[PipelineSignal]) -> Vec<(PackageId, ProcessFlags)> {
    signals
        .iter()
        .filter_map(|signal| match signal {
            PipelineSignal::Processed { package, flags } => Some((*package, *flags)),
            _ => None,
        })
        .collect()
}

#[test]
fn test_admission_bound_delays_and_readmits() {
    let scheduler = test_scheduler(2);
    let mut pipeline = pipeline(&scheduler, 2);
    let (stage, held) = hold();
    pipeline.plug(stage).unwrap();
    pipeline.construct().unwrap();
    let signals = pipeline.subscribe();

    assert_eq!(pipeline.process_batch(vec![1, 2, 3]), 3);

    let (p1, outlet) = held.recv_timeout(TIMEOUT).unwrap();
    let (p2, _) = held.recv_timeout(TIMEOUT).unwrap();
    assert_eq!((p1.id(), p2.id()), (PackageId(1), PackageId(2)));
    let snapshot = pipeline.flow_snapshot();
    assert_eq!(snapshot.in_flight, 2);
    assert_eq!(snapshot.delayed, 1);
    assert_eq!(snapshot.total_added, 3);

    outlet.emit(p1);
    let (p3, _) = held.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(p3.id(), PackageId(3));
    assert_eq!(pipeline.flow_snapshot().in_flight, 2);
    assert_eq!(pipeline.flow_snapshot().delayed, 0);

    outlet.emit(p2);
    outlet.emit(p3);
    let received = signals_until_finished(&signals);

    let done_p1 = position(&received, &PipelineSignal::Processed {
        package: PackageId(1),
        flags: ProcessFlags::stage(0),
    })
    .unwrap();
    let readmitted_p3 = last_position(&received, &PipelineSignal::Processing { package: PackageId(3) }).unwrap();
    assert!(done_p1 < readmitted_p3);
    assert_eq!(received.first(), Some(&PipelineSignal::Scheduled));
    assert_eq!(received.get(1), Some(&PipelineSignal::Started));
    assert_eq!(count_finished(&received), 1);
    assert!(pipeline.has_finished());
    assert_eq!(pipeline.flow_snapshot().total_added, 0);
}

#[test]
fn test_progress_counts_down_to_zero() {
    let scheduler = test_scheduler(2);
    let mut pipeline = pipeline(&scheduler, 10);
    pipeline.plug(Forward).unwrap();
    pipeline.construct().unwrap();
    let signals = pipeline.subscribe();

    pipeline.process_batch(vec![1, 2, 3, 4]);
    let received = signals_until_finished(&signals);

    let progress: Vec<f32> = received
        .iter()
        .filter_map(|signal| match signal {
            PipelineSignal::Progress { fraction } => Some(*fraction),
            _ => None,
        })
        .collect();
    assert_eq!(progress.len(), 4);
    assert!(progress.windows(2).all(|pair| pair[0] > pair[1]));
    assert_eq!(progress.last().copied(), Some(0.0));
}

#[test]
fn test_stage_bits_accumulate_across_stages() {
    let scheduler = test_scheduler(3);
    let mut pipeline = pipeline(&scheduler, 50);
    pipeline.plug(Add(1)).unwrap();
    pipeline.plug(Add(10)).unwrap();
    pipeline.plug(Add(100)).unwrap();
    pipeline.construct().unwrap();
    assert_eq!(pipeline.stage_count(), 3);

    let payloads = Arc::new(Mutex::new(Vec::new()));
    let sink = payloads.clone();
    pipeline.add_observer(move |event: &PipelineEvent<'_, u64, u64>| {
        if let PipelineEvent::Processed(package) = event {
            sink.lock().unwrap().push(*package.payload());
        }
    });
    let signals = pipeline.subscribe();

    pipeline.process_batch((1..=5).collect());
    let received = signals_until_finished(&signals);

    let all_stages = ProcessFlags::stage(0) | ProcessFlags::stage(1) | ProcessFlags::stage(2);
    let done = processed(&received);
    assert_eq!(done.len(), 5);
    assert!(done.iter().all(|(_, flags)| *flags == all_stages));

    let mut payloads = payloads.lock().unwrap().clone();
    payloads.sort_unstable();
    assert_eq!(payloads, vec![112, 113, 114, 115, 116]);
}

#[test]
fn test_abandoned_package_skips_later_stages() {
    struct RejectOdd;

    impl Stage for RejectOdd {
        type Payload = u64;

        fn process(&mut self, package: WorkPackage<u64>, outlet: &Outlet<u64>) {
            if package.payload() % 2 == 1 {
                outlet.abandon(package);
            } else {
                outlet.emit(package);
            }
        }
    }

    let scheduler = test_scheduler(2);
    let mut pipeline = pipeline(&scheduler, 50);
    pipeline.plug(RejectOdd).unwrap();
    pipeline.plug(Forward).unwrap();
    pipeline.construct().unwrap();
    let signals = pipeline.subscribe();

    pipeline.process_batch(vec![1, 2, 3, 4]);
    let received = signals_until_finished(&signals);

    let mut done = processed(&received);
    done.sort_by_key(|(id, _)| *id);
    let both = ProcessFlags::stage(0) | ProcessFlags::stage(1);
    assert_eq!(
        done,
        vec![
            (PackageId(1), ProcessFlags::UNPROCESSED),
            (PackageId(2), both),
            (PackageId(3), ProcessFlags::UNPROCESSED),
            (PackageId(4), both),
        ]
    );
    assert_eq!(count_finished(&received), 1);
}

#[test]
fn test_items_without_package_are_refused() {
    let scheduler = test_scheduler(1);
    let mut pipeline: Pipeline<u64, u64> = Pipeline::new(
        &scheduler,
        |item: &u64| (*item != 0).then_some(*item),
        PipelineConfig::named("refusing"),
    );
    pipeline.plug(Forward).unwrap();
    pipeline.construct().unwrap();
    let signals = pipeline.subscribe();

    assert!(!pipeline.process(0));
    assert!(pipeline.has_finished());
    assert!(signals.try_recv().is_err());

    assert_eq!(pipeline.process_batch(vec![0, 7, 0, 8]), 2);
    let received = signals_until_finished(&signals);
    assert_eq!(processed(&received).len(), 2);
}

#[test]
fn test_process_with_filter_reports_refusals() {
    let scheduler = test_scheduler(2);
    let mut pipeline: Pipeline<u64, u64> = Pipeline::new(
        &scheduler,
        |item: &u64| (*item != 0).then_some(*item),
        PipelineConfig::named("filtered"),
    );
    pipeline.plug_filter(|item: &u64| *item != 7);
    pipeline.plug(Forward).unwrap();
    pipeline.construct().unwrap();
    let signals = pipeline.subscribe();

    assert!(!pipeline.process(0));
    assert!(!pipeline.process(7));
    assert!(pipeline.has_finished());
    assert!(signals.try_recv().is_err());

    assert!(pipeline.process(8));
    let received = signals_until_finished(&signals);
    assert_eq!(processed(&received), vec![(PackageId(1), ProcessFlags::stage(0))]);
    assert_eq!(pipeline.flow_snapshot().pending_filter, 0);
}

#[test]
fn test_filter_reports_skipped_items() {
    let scheduler = test_scheduler(2);
    let mut pipeline = pipeline(&scheduler, 50);
    pipeline.plug_filter(|item: &u64| item % 2 == 0);
    pipeline.plug(Forward).unwrap();
    pipeline.construct().unwrap();
    let signals = pipeline.subscribe();

    assert_eq!(pipeline.process_batch((1..=6).collect()), 6);
    let received = signals_until_finished(&signals);

    let skipped: usize = received
        .iter()
        .filter_map(|signal| match signal {
            PipelineSignal::Skipped { count } => Some(*count),
            _ => None,
        })
        .sum();
    assert_eq!(skipped, 3);
    assert_eq!(processed(&received).len(), 3);
    assert_eq!(count_finished(&received), 1);

    let snapshot = pipeline.flow_snapshot();
    assert_eq!(snapshot.pending_filter, 0);
    assert_eq!(snapshot.in_flight, 0);
}

#[test]
fn test_filter_skipping_everything_still_finishes() {
    let scheduler = test_scheduler(2);
    let mut pipeline = pipeline(&scheduler, 50);
    pipeline.plug_filter(|_: &u64| false);
    pipeline.plug(Forward).unwrap();
    pipeline.construct().unwrap();
    let signals = pipeline.subscribe();

    pipeline.process_batch(vec![1, 2]);
    let received = signals_until_finished(&signals);

    assert_eq!(received.last(), Some(&PipelineSignal::Finished));
    assert!(processed(&received).is_empty());
}

#[test]
fn test_throttled_loop_stage_completes_everything() {
    let scheduler = test_scheduler(3);
    let mut pipeline = pipeline(&scheduler, 8);
    pipeline.plug_loop(Add(1), Some(2)).unwrap();
    pipeline.plug(Forward).unwrap();
    pipeline.construct().unwrap();
    let signals = pipeline.subscribe();

    pipeline.process_batch((1..=30).collect());
    let received = signals_until_finished(&signals);

    let mut ids: Vec<_> = processed(&received).into_iter().map(|(id, _)| id.0).collect();
    ids.sort_unstable();
    assert_eq!(ids, (1..=30).collect::<Vec<_>>());
    assert_eq!(count_finished(&received), 1);
}

#[test]
fn test_parallel_stage_completes_everything() {
    let scheduler = test_scheduler(4);
    let mut pipeline = pipeline(&scheduler, 50);
    pipeline.plug_parallel(3, |_| Add(1)).unwrap();
    pipeline.plug(Forward).unwrap();
    pipeline.construct().unwrap();
    let signals = pipeline.subscribe();

    pipeline.process_batch((1..=20).collect());
    let received = signals_until_finished(&signals);

    let done = processed(&received);
    assert_eq!(done.len(), 20);
    let both = ProcessFlags::stage(0) | ProcessFlags::stage(1);
    assert!(done.iter().all(|(_, flags)| *flags == both));
}

#[test]
fn test_pipeline_restarts_after_drain() {
    let scheduler = test_scheduler(2);
    let mut pipeline = pipeline(&scheduler, 50);
    pipeline.plug(Forward).unwrap();
    pipeline.construct().unwrap();
    let signals = pipeline.subscribe();

    pipeline.process(1);
    let first = signals_until_finished(&signals);
    pipeline.wait();
    assert!(!pipeline.flow_snapshot().started);

    pipeline.process(2);
    let second = signals_until_finished(&signals);

    assert_eq!(count_finished(&first), 1);
    assert_eq!(count_finished(&second), 1);
    assert_eq!(second.first(), Some(&PipelineSignal::Scheduled));
}

#[test]
fn test_cancel_ignores_completions_of_old_packages() {
    let scheduler = test_scheduler(2);
    let mut pipeline = pipeline(&scheduler, 1);
    let (stage, held) = hold();
    pipeline.plug(stage).unwrap();
    pipeline.construct().unwrap();
    let signals = pipeline.subscribe();

    pipeline.process_batch(vec![1, 2, 3]);
    let (stale, outlet) = held.recv_timeout(TIMEOUT).unwrap();
    pipeline.cancel();
    pipeline.wait();

    let snapshot = pipeline.flow_snapshot();
    assert_eq!((snapshot.in_flight, snapshot.delayed), (0, 0));
    let before: Vec<_> = signals.try_iter().collect();

    outlet.emit(stale);
    assert!(signals.try_recv().is_err());
    assert!(processed(&before).is_empty());

    pipeline.process(4);
    let (fresh, outlet) = held.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(fresh.id(), PackageId(4));
    outlet.emit(fresh);
    let received = signals_until_finished(&signals);
    assert_eq!(processed(&received), vec![(PackageId(4), ProcessFlags::stage(0))]);
}

#[test]
fn test_cancel_drops_packages_between_stages() {
    let scheduler = test_scheduler(2);
    let mut pipeline = pipeline(&scheduler, 10);
    let (first, held_first) = hold();
    let (second, held_second) = hold();
    pipeline.plug(first).unwrap();
    pipeline.plug(second).unwrap();
    pipeline.construct().unwrap();

    assert!(pipeline.process(1));
    let (stale, outlet) = held_first.recv_timeout(TIMEOUT).unwrap();
    pipeline.cancel();
    pipeline.wait();
    // Completes stage 0 after the cancel.
    outlet.emit(stale);

    let signals = pipeline.subscribe();
    assert!(pipeline.process(2));
    let (fresh, outlet) = held_first.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(fresh.id(), PackageId(2));
    outlet.emit(fresh);

    let (reached, outlet) = held_second.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(reached.id(), PackageId(2));
    assert!(held_second.try_recv().is_err());
    outlet.emit(reached);

    let received = signals_until_finished(&signals);
    assert_eq!(
        processed(&received),
        vec![(PackageId(2), ProcessFlags::stage(0) | ProcessFlags::stage(1))]
    );
}

/// Forwards every package and hands out `hook` as its interrupter.
struct Interrupted(Arc<dyn Interrupt>);

impl Stage for Interrupted {
    type Payload = u64;

    fn process(&mut self, package: WorkPackage<u64>, outlet: &Outlet<u64>) {
        outlet.emit(package);
    }

    fn interrupter(&self) -> Option<Arc<dyn Interrupt>> {
        Some(self.0.clone())
    }
}

#[test]
fn test_interrupter_may_call_back_into_the_pipeline() {
    let scheduler = test_scheduler(2);
    let slot: Arc<OnceLock<Weak<Pipeline<u64, u64>>>> = Arc::new(OnceLock::new());
    let (tx, observed) = flume::unbounded();
    let hook_slot = slot.clone();
    let hook: Arc<dyn Interrupt> = Arc::new(move || {
        if let Some(pipeline) = hook_slot.get().and_then(Weak::upgrade) {
            let _ = tx.send((pipeline.has_finished(), pipeline.flow_snapshot().in_flight));
        }
    });

    let mut pipeline = pipeline(&scheduler, 10);
    pipeline.plug(Interrupted(hook)).unwrap();
    pipeline.construct().unwrap();
    let pipeline = Arc::new(pipeline);
    assert!(slot.set(Arc::downgrade(&pipeline)).is_ok());
    let signals = pipeline.subscribe();

    assert!(pipeline.process(1));
    let received = signals_until_finished(&signals);

    assert_eq!(count_finished(&received), 1);
    assert_eq!(observed.recv_timeout(TIMEOUT).unwrap(), (true, 0));
    assert!(pipeline.has_finished());
    pipeline.wait();
}

#[test]
fn test_priority_changes() {
    let scheduler = test_scheduler(1);
    let mut pipeline = pipeline(&scheduler, 10);
    pipeline.plug(Forward).unwrap();
    pipeline.construct().unwrap();

    assert_eq!(pipeline.priority(), Priority::Low);
    pipeline.set_priority(Priority::Low);
    pipeline.set_priority(Priority::High);
    assert_eq!(pipeline.priority(), Priority::High);
}

#[test]
fn test_construct_without_stages_fails() {
    let scheduler = test_scheduler(1);
    let mut pipeline = pipeline(&scheduler, 10);
    let err = pipeline.construct().unwrap_err();
    assert!(matches!(err, PipelineError::Empty(ref name) if name == "test"));
    assert_eq!(err.to_string(), "Pipeline `test` has no stages");
}

#[test]
#[should_panic(expected = "constructed twice")]
fn test_double_construct_panics() {
    let scheduler = test_scheduler(1);
    let mut pipeline = pipeline(&scheduler, 10);
    pipeline.plug(Forward).unwrap();
    pipeline.construct().unwrap();
    let _ = pipeline.construct();
}

#[test]
#[should_panic(expected = "after construct()")]
fn test_plug_after_construct_panics() {
    let scheduler = test_scheduler(1);
    let mut pipeline = pipeline(&scheduler, 10);
    pipeline.plug(Forward).unwrap();
    pipeline.construct().unwrap();
    let _ = pipeline.plug(Forward);
}

#[test]
#[should_panic(expected = "before construct()")]
fn test_process_before_construct_panics() {
    let scheduler = test_scheduler(1);
    let mut pipeline = pipeline(&scheduler, 10);
    pipeline.plug(Forward).unwrap();
    pipeline.process(1);
}

#[test]
#[should_panic(expected = "at most 31 stages")]
fn test_too_many_stages_panics() {
    let scheduler = test_scheduler(1);
    let mut pipeline = pipeline(&scheduler, 10);
    for _ in 0..=ProcessFlags::MAX_STAGES {
        pipeline.plug(Forward).unwrap();
    }
}
