//! Real executions through the proxy binary.
//!
//! Tests that need root and cgroup v2 skip themselves elsewhere; degraded-mode
//! tests only need `/usr/bin/python3`.

use execbox::config::service::{LanguageOverride, ServiceConfig};
use execbox::core::supervisor::ProxyLauncher;
use execbox::kernel::capabilities::{check_no_new_privs, set_no_new_privs};
use execbox::kernel::cgroup::CgroupV2;
use execbox::kernel::credentials::transition_to_unprivileged;
use execbox::observability::AuditTrail;
use execbox::safety::{IsolationBoundary, IsolationMode};
use execbox::service::ExecutionService;
use execbox::{ErrorKind, ExecutionRequest};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn have_python() -> bool {
    Path::new("/usr/bin/python3").exists()
}

fn strict_host() -> bool {
    nix::unistd::geteuid().is_root() && CgroupV2::is_available() && have_python()
}

fn service(mode: IsolationMode, tmp: &Path) -> ExecutionService {
    let mut languages = HashMap::new();
    languages.insert(
        "python".to_string(),
        LanguageOverride {
            wall_time_ms: Some(1_000),
            max_output_bytes: Some(1024),
            ..Default::default()
        },
    );
    let config = Arc::new(ServiceConfig {
        runtime_root: tmp.join("runtime"),
        cgroup_root: format!("/sys/fs/cgroup/execbox-test-{}", std::process::id()).into(),
        allow_degraded: mode == IsolationMode::Degraded,
        strict_mode: mode == IsolationMode::Strict,
        languages,
        ..Default::default()
    });
    let boundary = IsolationBoundary::with_mode(mode, &config).unwrap();
    let launcher = ProxyLauncher::new(env!("CARGO_BIN_EXE_execbox"));
    ExecutionService::with_parts(config, boundary, launcher, AuditTrail::new()).unwrap()
}

fn python(svc: &ExecutionService, code: &str) -> execbox::ExecutionResult {
    let cancel = AtomicBool::new(false);
    svc.run(ExecutionRequest::new("python", code, "", "it"), None, &cancel)
        .unwrap()
}

#[test]
fn credential_transition_rejects_root_ids() {
    assert!(transition_to_unprivileged(0, 1000).is_err());
    assert!(transition_to_unprivileged(1000, 0).is_err());
}

#[test]
fn no_new_privs_is_sticky() {
    if set_no_new_privs().is_ok() {
        assert!(check_no_new_privs());
        assert!(set_no_new_privs().is_ok());
    }
}

#[test]
fn degraded_echo_and_exit_code() {
    if !have_python() {
        eprintln!("skipping: python3 not installed");
        return;
    }
    let tmp = tempfile::tempdir().unwrap();
    let svc = service(IsolationMode::Degraded, tmp.path());

    let cancel = AtomicBool::new(false);
    let ok = svc
        .run(
            ExecutionRequest::new("python", "print(input()[::-1])", "olleh\n", "it"),
            None,
            &cancel,
        )
        .unwrap();
    assert!(ok.success, "{:?}", ok);
    assert_eq!(ok.stdout, "hello\n");

    let failed = python(&svc, "import sys; sys.exit(4)");
    assert_eq!(failed.error_kind, Some(ErrorKind::RuntimeError));
    assert_eq!(failed.exit_status, Some(execbox::ExitStatus::Code(4)));
    assert_eq!(svc.boundary().live(), 0);
}

#[test]
fn degraded_infinite_loop_times_out() {
    if !have_python() {
        eprintln!("skipping: python3 not installed");
        return;
    }
    let tmp = tempfile::tempdir().unwrap();
    let svc = service(IsolationMode::Degraded, tmp.path());

    let pid_file = tmp.path().join("child.pid");
    let code = format!(
        "import os\nif os.fork() == 0:\n    open('{}', 'w').write(str(os.getpid()))\n    while True:\n        pass\nwhile True:\n    pass\n",
        pid_file.display()
    );

    let started = Instant::now();
    let result = python(&svc, &code);
    assert_eq!(result.error_kind.and_then(|k| k.error_type()), Some("timeout"));
    assert!(started.elapsed() < Duration::from_secs(4), "took {:?}", started.elapsed());
    assert_eq!(svc.boundary().live(), 0);

    let child: i32 = std::fs::read_to_string(&pid_file)
        .expect("forked child recorded its pid")
        .trim()
        .parse()
        .unwrap();
    assert_eq!(
        kill(Pid::from_raw(child), None),
        Err(Errno::ESRCH),
        "forked child {} outlived the timeout",
        child
    );
}

#[test]
fn degraded_output_is_capped() {
    if !have_python() {
        eprintln!("skipping: python3 not installed");
        return;
    }
    let tmp = tempfile::tempdir().unwrap();
    let svc = service(IsolationMode::Degraded, tmp.path());

    let result = python(&svc, "print('x' * 100000)");
    assert!(result.truncated);
    assert!(result.stdout.len() <= 1024);
    let wide = python(&svc, "print('x' + '\\u00e9' * 1000)");
    assert!(wide.truncated);
    assert!(wide.stdout.len() <= 1024, "{} bytes", wide.stdout.len());
    assert!(!wide.stdout.contains('\u{FFFD}'));
}

#[test]
fn strict_blocks_network_and_host_files() {
    if !strict_host() {
        eprintln!("skipping: needs root, cgroup v2 and python3");
        return;
    }
    let tmp = tempfile::tempdir().unwrap();
    let svc = service(IsolationMode::Strict, tmp.path());

    let net = python(
        &svc,
        "import socket\ns = socket.socket()\ns.settimeout(0.5)\ns.connect(('1.1.1.1', 80))\nprint('connected')",
    );
    assert!(!net.stdout.contains("connected"));

    let secret = tmp.path().join("host-secret");
    std::fs::write(&secret, "do not read").unwrap();
    let read = python(&svc, &format!("print(open('{}').read())", secret.display()));
    assert!(!read.stdout.contains("do not read"));

    let write = python(&svc, "open('/usr/pwned', 'w').write('x')\nprint('wrote')");
    assert!(!write.stdout.contains("wrote"));
    assert!(!Path::new("/usr/pwned").exists());
    assert_eq!(svc.boundary().live(), 0);
}

#[test]
fn strict_memory_hog_is_resource_limit() {
    if !strict_host() {
        eprintln!("skipping: needs root, cgroup v2 and python3");
        return;
    }
    let tmp = tempfile::tempdir().unwrap();
    let svc = service(IsolationMode::Strict, tmp.path());

    let result = python(&svc, "x = []\nwhile True:\n    x.append(bytearray(16 * 1024 * 1024))\n");
    assert!(!result.success);
    assert_eq!(result.error_kind, Some(ErrorKind::ResourceLimitExceeded));
}
