//! End-to-end pipeline with a scripted phase runner: every ticket and every
//! sandbox handed out comes back, whatever the request did.

use execbox::config::service::ServiceConfig;
use execbox::core::types::{PhaseOutcome, StopReason};
use execbox::observability::{AuditEventKind, AuditTrail, MemorySink};
use execbox::safety::{IsolationBoundary, IsolationMode, PhaseSpec, SandboxHandle};
use execbox::service::{ExecutionService, Executor, Rejection};
use execbox::verdict::PhaseRunner;
use execbox::{ErrorKind, ExecError, ExecutionRequest, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Behaviour keyed off the stdin of the run phase
struct ScriptedRunner;

impl PhaseRunner for ScriptedRunner {
    fn run_phase(
        &self,
        handle: &mut SandboxHandle,
        spec: PhaseSpec,
        cancel: &AtomicBool,
    ) -> execbox::Result<PhaseOutcome> {
        assert!(!handle.is_released());
        let exit = |code| PhaseOutcome {
            exit: Some(ExitStatus::Code(code)),
            stdout: String::from_utf8_lossy(&spec.stdin).into_owned(),
            wall_time: Duration::from_millis(3),
            ..Default::default()
        };
        match spec.stdin.as_slice() {
            b"fail" => Ok(exit(1)),
            b"hang" => {
                while !cancel.load(Ordering::Acquire) {
                    thread::sleep(Duration::from_millis(2));
                }
                Ok(PhaseOutcome {
                    stopped: Some(StopReason::Cancelled),
                    exit: Some(ExitStatus::Signal(libc::SIGKILL)),
                    ..Default::default()
                })
            }
            b"fault" => Err(ExecError::Cgroup("controller vanished".into())),
            b"slow" => {
                thread::sleep(Duration::from_millis(20));
                Ok(exit(0))
            }
            _ => Ok(exit(0)),
        }
    }
}

fn service(tmp: &std::path::Path, global: usize, per_caller: usize) -> (ExecutionService<ScriptedRunner>, Arc<MemorySink>) {
    let config = Arc::new(ServiceConfig {
        global_limit: global,
        per_caller_limit: per_caller,
        admission_timeout_ms: 2_000,
        max_queue_depth: 64,
        max_source_bytes: 1024,
        max_stdin_bytes: 16,
        runtime_root: tmp.join("runtime"),
        allow_degraded: true,
        strict_mode: false,
        ..Default::default()
    });
    let boundary = IsolationBoundary::with_mode(IsolationMode::Degraded, &config).unwrap();
    let sink = Arc::new(MemorySink::new());
    let audit = AuditTrail::new().with_sink(sink.clone());
    (
        ExecutionService::with_parts(config, boundary, ScriptedRunner, audit).unwrap(),
        sink,
    )
}

fn request(stdin: &str, caller: &str) -> ExecutionRequest {
    ExecutionRequest::new("python", "print(1)", stdin, caller)
}

#[test]
fn concurrent_requests_leave_no_leaks() {
    let tmp = tempfile::tempdir().unwrap();
    let (svc, _) = service(tmp.path(), 4, 4);
    let svc = Arc::new(svc);

    let inputs = ["ok", "fail", "fault", "slow", "ok", "slow", "fail", "ok"];
    let handles: Vec<_> = inputs
        .iter()
        .enumerate()
        .map(|(i, input)| {
            let svc = Arc::clone(&svc);
            let input = input.to_string();
            thread::spawn(move || {
                let cancel = AtomicBool::new(false);
                svc.run(request(&input, &format!("caller-{}", i % 3)), None, &cancel)
            })
        })
        .collect();

    for h in handles {
        let result = h.join().unwrap().expect("admitted within timeout");
        assert!(result.error_kind != Some(ErrorKind::Timeout));
    }

    let health = svc.health();
    assert_eq!(health.sandboxes_created, inputs.len() as u64);
    assert_eq!(health.sandboxes_created, health.sandboxes_destroyed);
    assert_eq!(health.tickets_issued, health.tickets_released);
    assert_eq!(health.in_flight, 0);
    assert_eq!(svc.metrics().in_flight.get(), 0);

    let leftovers = std::fs::read_dir(tmp.path().join("runtime")).unwrap().count();
    assert_eq!(leftovers, 0, "scratch directories must be removed");
}

#[test]
fn outcomes_follow_the_result_table() {
    let tmp = tempfile::tempdir().unwrap();
    let (svc, sink) = service(tmp.path(), 2, 2);
    let cancel = AtomicBool::new(false);

    let ok = svc.run(request("ok", "a"), Some("student".into()), &cancel).unwrap();
    assert!(ok.success);
    assert_eq!(ok.error_kind, None);
    assert_eq!(ok.stdout, "ok");

    let failed = svc.run(request("fail", "a"), None, &cancel).unwrap();
    assert!(failed.success);
    assert_eq!(failed.error_kind, Some(ErrorKind::RuntimeError));

    let fault = svc.run(request("fault", "a"), None, &cancel).unwrap();
    assert!(!fault.success);
    assert_eq!(fault.error_kind, Some(ErrorKind::SandboxFault));
    assert!(!fault.stderr.contains("controller"), "internal detail must not leak");

    let kinds = sink.kinds();
    assert!(kinds.contains(&AuditEventKind::Admitted));
    assert!(kinds.contains(&AuditEventKind::RunStarted));
    assert!(kinds.contains(&AuditEventKind::SandboxFault));
    assert_eq!(kinds.iter().filter(|k| **k == AuditEventKind::Released).count(), 3);
    assert!(sink.events().iter().all(|e| e.context.source_sha256.len() == 64));
    assert_eq!(sink.events()[0].context.caller_role.as_deref(), Some("student"));
}

#[test]
fn rejections_allocate_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let (svc, sink) = service(tmp.path(), 2, 2);
    let cancel = AtomicBool::new(false);

    let unknown = svc.run(ExecutionRequest::new("cobol", "x", "", "a"), None, &cancel);
    assert_eq!(unknown.unwrap_err(), Rejection::UnsupportedLanguage("cobol".into()));

    let big_stdin = svc.run(request("way more than sixteen bytes", "a"), None, &cancel);
    assert!(matches!(big_stdin, Err(Rejection::InputTooLarge { what: "stdin", .. })));

    let big_source = svc.run(
        ExecutionRequest::new("python", vec![b'#'; 2048], "", "a"),
        None,
        &cancel,
    );
    assert!(matches!(big_source, Err(Rejection::InputTooLarge { what: "source", .. })));

    assert_eq!(svc.boundary().created(), 0);
    assert_eq!(svc.admission_snapshot().issued, 0);
    assert!(svc.request_body_limit() >= (1024 + 16) * 6, "body limit must admit escaped max-size input");
    assert_eq!(sink.kinds(), vec![AuditEventKind::Rejected; 3]);
}

#[test]
fn cancellation_releases_everything() {
    let tmp = tempfile::tempdir().unwrap();
    let (svc, _) = service(tmp.path(), 1, 1);
    let svc = Arc::new(svc);
    let cancel = Arc::new(AtomicBool::new(false));

    let worker = {
        let svc = Arc::clone(&svc);
        let cancel = Arc::clone(&cancel);
        thread::spawn(move || svc.run(request("hang", "a"), None, &cancel))
    };

    while svc.boundary().live() == 0 {
        thread::sleep(Duration::from_millis(1));
    }
    cancel.store(true, Ordering::Release);

    let result = worker.join().unwrap().unwrap();
    assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
    assert_eq!(svc.boundary().live(), 0);
    assert_eq!(svc.admission_snapshot().in_use, 0);
}

#[test]
fn saturated_service_reports_overload() {
    let tmp = tempfile::tempdir().unwrap();
    let config = ServiceConfig {
        global_limit: 1,
        per_caller_limit: 1,
        admission_timeout_ms: 50,
        max_queue_depth: 4,
        runtime_root: tmp.path().join("runtime"),
        allow_degraded: true,
        strict_mode: false,
        ..Default::default()
    };
    let config = Arc::new(config);
    let boundary = IsolationBoundary::with_mode(IsolationMode::Degraded, &config).unwrap();
    let svc = Arc::new(ExecutionService::with_parts(config, boundary, ScriptedRunner, AuditTrail::new()).unwrap());

    let hold = Arc::new(AtomicBool::new(false));
    let blocker = {
        let svc = Arc::clone(&svc);
        let hold = Arc::clone(&hold);
        thread::spawn(move || svc.run(request("hang", "first"), None, &hold))
    };
    while svc.admission_snapshot().in_use == 0 {
        thread::sleep(Duration::from_millis(1));
    }

    let second = svc.run(request("ok", "second"), None, &AtomicBool::new(false));
    assert_eq!(second.unwrap_err(), Rejection::Overloaded);
    assert_eq!(svc.metrics().admission_rejections.get(), 1);

    hold.store(true, Ordering::Release);
    blocker.join().unwrap().unwrap();
    assert_eq!(svc.admission_snapshot().in_use, 0);
}
