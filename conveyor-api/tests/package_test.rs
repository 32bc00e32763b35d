// Integration tests for packages and outlets in conveyor_api

use std::sync::{Arc, Mutex};

use conveyor_api::{Outlet, PackageId, ProcessFlags, WorkPackage};

#[test]
fn test_package_flags() {
    let mut package = WorkPackage::new(PackageId(7), "cat.jpg".to_string());
    assert!(package.flags().is_empty());

    package.mark(ProcessFlags::stage(0));
    package.mark(ProcessFlags::stage(2));
    assert!(package.is_marked(ProcessFlags::stage(0)));
    assert!(!package.is_marked(ProcessFlags::stage(1)));
    assert_eq!(package.flags().stages_passed(), 2);
    assert_eq!(package.id().to_string(), "pkg-7");
}

#[test]
fn test_flag_set_operations() {
    let mut flags = ProcessFlags::stage(1) | ProcessFlags::UNPROCESSED;
    assert!(flags.contains(ProcessFlags::UNPROCESSED));
    assert_eq!(flags.stages_passed(), 1);

    flags.remove(ProcessFlags::UNPROCESSED);
    assert_eq!(flags, ProcessFlags::stage(1));
    flags |= ProcessFlags::stage(3);
    assert_eq!(flags.bits(), 0b1010);
    assert_eq!(ProcessFlags::from_bits(0b1010), flags);
}

#[test]
fn test_map_keeps_identity() {
    let mut package = WorkPackage::new(PackageId(3), 21u32);
    package.mark(ProcessFlags::stage(4));

    let doubled = package.map(|n| u64::from(n) * 2);
    assert_eq!(doubled.id(), PackageId(3));
    assert!(doubled.is_marked(ProcessFlags::stage(4)));
    assert_eq!(doubled.into_payload(), 42);
}

#[test]
fn test_package_ids_order_by_creation() {
    assert!(PackageId(1) < PackageId(2));
}

fn recording() -> (Outlet<u32>, Arc<Mutex<Vec<(&'static str, ProcessFlags)>>>) {
    let outlet = Outlet::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    let processed = log.clone();
    let abandoned = log.clone();
    outlet.connect(
        Arc::new(move |package: WorkPackage<u32>| processed.lock().unwrap().push(("processed", package.flags()))),
        Arc::new(move |package: WorkPackage<u32>| abandoned.lock().unwrap().push(("abandoned", package.flags()))),
    );
    (outlet, log)
}

#[test]
fn test_outlet_routes() {
    let (outlet, log) = recording();
    assert!(outlet.is_connected());

    outlet.emit(WorkPackage::new(PackageId(1), 1));
    outlet.abandon(WorkPackage::new(PackageId(2), 2));

    assert_eq!(
        *log.lock().unwrap(),
        vec![
            ("processed", ProcessFlags::NONE),
            ("abandoned", ProcessFlags::UNPROCESSED),
        ]
    );
}

#[test]
fn test_outlet_clones_share_routes() {
    let outlet = Outlet::new();
    let clone = outlet.clone();
    assert!(!clone.is_connected());

    let (tx, rx) = std::sync::mpsc::channel();
    let tx = Mutex::new(tx);
    outlet.connect(
        Arc::new(move |package: WorkPackage<u32>| tx.lock().unwrap().send(package.into_payload()).unwrap()),
        Arc::new(|_| {}),
    );

    clone.emit(WorkPackage::new(PackageId(1), 5));
    assert_eq!(rx.recv().unwrap(), 5);
}

#[test]
fn test_unconnected_outlet_drops_packages() {
    let outlet: Outlet<u32> = Outlet::new();
    outlet.emit(WorkPackage::new(PackageId(1), 1));
    outlet.abandon(WorkPackage::new(PackageId(2), 2));
    assert!(!outlet.is_connected());
}
