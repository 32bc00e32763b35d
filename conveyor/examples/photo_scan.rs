// Photo scan demo
//
// Synthetic photo records flow through four stages:
//   filter   -> drops records that were already scanned
//   loader   -> loop stage, throttled so decoded images do not pile up
//   detector -> fan-out group finding "faces"
//   writer   -> stores the results
//
// Run with `RUST_LOG=conveyor=debug cargo run --example photo_scan`.

use std::error::Error;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use conveyor::logging;
use conveyor::pipeline::{Pipeline, PipelineConfig};
use conveyor::thread::{Scheduler, SchedulerConfig};
use conveyor_api::{Outlet, PipelineSignal, Priority, ProcessFlags, Stage, WorkPackage};

#[derive(Debug, Clone)]
struct PhotoRecord {
    id: Option<u32>,
    path: String,
    scanned: bool,
}

#[derive(Debug, Default)]
struct Scan {
    photo: u32,
    path: String,
    pixels: Vec<u8>,
    faces: Vec<(u32, u32)>,
}

struct Loader;

impl Stage for Loader {
    type Payload = Scan;

    fn process(&mut self, mut package: WorkPackage<Scan>, outlet: &Outlet<Scan>) {
        if package.payload().path.ends_with(".broken") {
            logging::warn!(path = %package.payload().path, "could not decode image");
            outlet.abandon(package);
            return;
        }
        thread::sleep(Duration::from_millis(5));
        let seed = package.payload().photo;
        package.payload_mut().pixels = (0..64).map(|i| ((i * 7 + seed) % 251) as u8).collect();
        outlet.emit(package);
    }

    fn name(&self) -> &str {
        "loader"
    }
}

struct Detector {
    threshold: u8,
}

impl Stage for Detector {
    type Payload = Scan;

    fn process(&mut self, mut package: WorkPackage<Scan>, outlet: &Outlet<Scan>) {
        thread::sleep(Duration::from_millis(15));
        let threshold = self.threshold;
        let scan = package.payload_mut();
        scan.faces = scan
            .pixels
            .iter()
            .enumerate()
            .filter(|(_, value)| **value > threshold)
            .map(|(index, _)| (index as u32 % 8, index as u32 / 8))
            .collect();
        scan.pixels.clear();
        outlet.emit(package);
    }

    fn name(&self) -> &str {
        "detector"
    }
}

struct Writer {
    stored: Arc<Mutex<Vec<(u32, usize)>>>,
}

impl Stage for Writer {
    type Payload = Scan;

    fn process(&mut self, package: WorkPackage<Scan>, outlet: &Outlet<Scan>) {
        let scan = package.payload();
        if let Ok(mut stored) = self.stored.lock() {
            stored.push((scan.photo, scan.faces.len()));
        }
        outlet.emit(package);
    }

    fn name(&self) -> &str {
        "writer"
    }
}

fn records() -> Vec<PhotoRecord> {
    (0..40)
        .map(|n| PhotoRecord {
            id: (n % 13 != 0).then_some(n),
            path: if n % 11 == 5 {
                format!("/photos/{n}.broken")
            } else {
                format!("/photos/{n}.jpg")
            },
            scanned: n % 4 == 0,
        })
        .collect()
}

fn main() -> Result<(), Box<dyn Error>> {
    logging::init_development();

    let scheduler = Scheduler::new(SchedulerConfig {
        pool_size: 4,
        ..Default::default()
    })?;
    let stored = Arc::new(Mutex::new(Vec::new()));

    let config = PipelineConfig {
        max_in_flight: 8,
        ..PipelineConfig::named("photo-scan")
    };
    let mut pipeline = Pipeline::new(
        &scheduler,
        |record: &PhotoRecord| {
            record.id.map(|photo| Scan {
                photo,
                path: record.path.clone(),
                ..Default::default()
            })
        },
        config,
    );
    pipeline.plug_filter(|record: &PhotoRecord| !record.scanned);
    pipeline.plug_loop(Loader, Some(3))?;
    pipeline.plug_parallel(3, |_| Detector { threshold: 200 })?;
    pipeline.plug(Writer {
        stored: stored.clone(),
    })?;
    pipeline.construct()?;
    pipeline.set_priority(Priority::Normal);

    let signals = pipeline.subscribe();
    let accepted = pipeline.process_batch(records());
    logging::info!(accepted, "records submitted");

    let mut failed = 0;
    let mut skipped = 0;
    for signal in signals.iter() {
        match signal {
            PipelineSignal::Processed { flags, .. } if flags.contains(ProcessFlags::UNPROCESSED) => failed += 1,
            PipelineSignal::Skipped { count } => skipped += count,
            PipelineSignal::Progress { fraction } => logging::debug!(remaining = fraction, "progress"),
            PipelineSignal::Finished => break,
            _ => {}
        }
    }

    pipeline.wait();
    let stored = stored.lock().map(|stored| stored.len()).unwrap_or_default();
    logging::info!(stored, failed, skipped, "scan finished");
    println!("stored {stored} scans, {failed} failed to load, {skipped} skipped");

    drop(pipeline);
    scheduler.shutdown()?;
    Ok(())
}
