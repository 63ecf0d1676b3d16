mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::connected;
use hvppman::error::HvppError;
use hvppman::{Chip, FuseKind, MemoryKind, Request, Response, SessionWorker, WorkerEvent};

#[test]
fn runs_requests_in_order() {
    let harness = connected(Chip::Atmega328);
    let adapter = harness.adapter.clone();
    let worker = SessionWorker::spawn(harness.session);

    worker.submit(Request::WriteFuse(FuseKind::High, 0xDE)).unwrap();
    assert_eq!(worker.wait(|_, _| {}), Ok(Response::Done));
    assert!(!worker.is_busy());

    worker.submit(Request::ReadFuse(FuseKind::High)).unwrap();
    assert_eq!(worker.wait(|_, _| {}), Ok(Response::Byte(0xDE)));

    worker.submit(Request::VerifySignature).unwrap();
    assert_eq!(
        worker.wait(|_, _| {}),
        Ok(Response::Signature([0x1E, 0x95, 0x0F]))
    );

    assert_eq!(
        adapter.lock().unwrap().opcodes(),
        vec!["00", "04", "99", "00", "02", "99", "00", "01", "99"]
    );
}

#[test]
fn forwards_page_progress() {
    let harness = connected(Chip::Attiny2313);
    let worker = SessionWorker::spawn(harness.session);

    worker.submit(Request::ReadMemory(MemoryKind::Eeprom)).unwrap();
    let mut progress = Vec::new();
    let result = worker.wait(|done, total| progress.push((done, total)));

    match result {
        Ok(Response::Memory(data)) => assert_eq!(data.len(), 128),
        other => panic!("unexpected result {:?}", other),
    }
    assert_eq!(progress.len(), 33);
    assert_eq!(progress.last(), Some(&(32, 32)));
}

#[test]
fn second_submit_while_running_is_refused() {
    let harness = connected(Chip::Atmega328);
    let gate = harness.gate.clone();
    gate.store(false, Ordering::SeqCst);
    let worker = SessionWorker::spawn(harness.session);

    worker.submit(Request::ReadSignature).unwrap();
    assert!(worker.is_busy());
    assert_eq!(
        worker.submit(Request::ReadFuses),
        Err(HvppError::SessionBusy)
    );

    gate.store(true, Ordering::SeqCst);
    assert_eq!(
        worker.wait(|_, _| {}),
        Ok(Response::Signature([0x1E, 0x95, 0x0F]))
    );

    // The slot is free again once the result is out
    worker.submit(Request::ReadCalibration).unwrap();
    assert_eq!(worker.wait(|_, _| {}), Ok(Response::Byte(0xA5)));
}

#[test]
fn cancel_stops_running_read() {
    let harness = connected(Chip::Attiny2313);
    let adapter = harness.adapter.clone();
    let gate = harness.gate.clone();
    gate.store(false, Ordering::SeqCst);
    let worker = SessionWorker::spawn(harness.session);

    worker.submit(Request::ReadMemory(MemoryKind::Flash)).unwrap();
    worker.cancel();
    gate.store(true, Ordering::SeqCst);

    assert_eq!(worker.wait(|_, _| {}), Err(HvppError::Cancelled));
    let opcodes = adapter.lock().unwrap().opcodes().join(",");
    assert!(!opcodes.contains("09"), "pages were read: {}", opcodes);

    // A new request starts uncancelled
    worker.submit(Request::ReadSignature).unwrap();
    assert!(worker.wait(|_, _| {}).is_ok());
}

#[test]
fn events_can_be_polled() {
    let harness = connected(Chip::Atmega328);
    let worker = SessionWorker::spawn(harness.session);
    assert!(worker.try_recv().is_none());

    worker.submit(Request::ReadLog).unwrap();
    let event = worker.recv_timeout(Duration::from_secs(2));
    assert_eq!(
        event,
        Some(WorkerEvent::Finished(Ok(Response::Log(
            "pages written: 0".to_owned()
        ))))
    );
}

#[test]
fn shutdown_returns_the_session() {
    let harness = connected(Chip::Atmega328);
    let worker = SessionWorker::spawn(harness.session);

    worker.submit(Request::Erase).unwrap();
    assert_eq!(worker.wait(|_, _| {}), Ok(Response::Done));

    let session = worker.shutdown().unwrap();
    assert!(session.is_connected());
    assert_eq!(session.chip(), Some(Chip::Atmega328.profile()));
    assert!(!session.last_operation_failed());
}

#[test]
fn result_follows_idle_flag() {
    let harness = connected(Chip::Atmega328);
    let worker = SessionWorker::spawn(harness.session);

    worker.submit(Request::ReadCalibration).unwrap();
    while worker.is_busy() {
        std::thread::sleep(Duration::from_millis(1));
    }

    // Idle does not mean delivered; the result is still queued
    assert_eq!(
        worker.recv_timeout(Duration::from_secs(2)),
        Some(WorkerEvent::Finished(Ok(Response::Byte(0xA5))))
    );
    worker.submit(Request::ReadLog).unwrap();
    assert_eq!(
        worker.wait(|_, _| {}),
        Ok(Response::Log("pages written: 0".to_owned()))
    );
}
