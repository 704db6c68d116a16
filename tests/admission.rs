//! Admission controller properties under real thread contention.

use execbox::admission::{AdmissionController, AdmissionError, AdmissionLimits};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

fn controller(global: usize, per_caller: usize, queue: usize, timeout_ms: u64) -> AdmissionController {
    AdmissionController::new(AdmissionLimits {
        global_limit: global,
        per_caller_limit: per_caller,
        max_queue_depth: queue,
        timeout: Duration::from_millis(timeout_ms),
    })
}

/// Every thread holds its ticket until all threads have tried, so nobody
/// frees a slot early.
fn contend(ctl: &AdmissionController, callers: Vec<String>) -> Vec<Result<(), AdmissionError>> {
    let n = callers.len();
    let start = Arc::new(Barrier::new(n));
    let done = Arc::new(Barrier::new(n));
    let handles: Vec<_> = callers
        .into_iter()
        .map(|caller| {
            let ctl = ctl.clone();
            let start = Arc::clone(&start);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                start.wait();
                let outcome = ctl.admit(&caller, None);
                done.wait();
                outcome.map(drop)
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

#[test]
fn global_cap_plus_one_yields_overload() {
    let g = 3;
    let ctl = controller(g, g, 8, 100);
    let callers = (0..=g).map(|i| format!("caller-{}", i)).collect();

    let results = contend(&ctl, callers);
    let admitted = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(admitted, g);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(AdmissionError::Timeout { .. }))));

    let snap = ctl.snapshot();
    assert_eq!(snap.in_use, 0);
    assert_eq!(snap.issued, snap.released);
}

#[test]
fn per_caller_cap_throttles_only_that_caller() {
    let p = 2;
    let ctl = controller(8, p, 8, 100);
    let mut callers: Vec<String> = (0..=p).map(|_| "greedy".to_string()).collect();
    callers.push("polite".to_string());

    let results = contend(&ctl, callers);
    let greedy_ok = results[..=p].iter().filter(|r| r.is_ok()).count();
    assert_eq!(greedy_ok, p);
    assert!(results[p + 1].is_ok(), "other callers are unaffected");
}

#[test]
fn double_release_does_not_inflate_capacity() {
    let ctl = controller(1, 1, 0, 10);
    let ticket = ctl.admit("a", None).unwrap();
    assert!(ticket.release());
    assert!(!ticket.release());
    drop(ticket);

    let held = ctl.admit("a", None).unwrap();
    assert!(matches!(ctl.admit("b", None), Err(AdmissionError::QueueFull { .. })));
    drop(held);

    let snap = ctl.snapshot();
    assert_eq!(snap.in_use, 0);
    assert_eq!(snap.issued, 2);
    assert_eq!(snap.released, 2);
}

#[test]
fn queued_waiters_are_served_in_arrival_order() {
    let ctl = controller(1, 1, 4, 5_000);
    let held = ctl.admit("holder", None).unwrap();

    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for name in ["first", "second"] {
        let waiter = ctl.clone();
        let order = Arc::clone(&order);
        handles.push(thread::spawn(move || {
            let ticket = waiter.admit(name, None).unwrap();
            order.lock().unwrap().push(name);
            thread::sleep(Duration::from_millis(20));
            drop(ticket);
        }));
        // Let this waiter enqueue before the next one arrives
        while ctl.snapshot().queued < handles.len() {
            thread::sleep(Duration::from_millis(1));
        }
    }

    drop(held);
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
}
