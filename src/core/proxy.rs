//! Proxy role: the service binary re-executed as a single-threaded helper.
//!
//! Reads one [`SandboxLaunchRequest`] as JSON on stdin, enters the PID/IPC/UTS/NET
//! namespaces, forks the payload (PID 1 of the new PID namespace), pumps its
//! stdio, reaps it and prints one [`ProxyStatus`] JSON document on stdout.
//! No logger is installed here: the proxy's stderr belongs to the supervisor.
use crate::config::types::{ExecError, OutputIntegrity, Result};
use crate::core::types::{ProxyStatus, SandboxLaunchRequest};
use crate::exec::preexec::{setup_parent_death_signal, FreshChild, Sandbox, SETUP_REPORT_FD};
use crate::kernel::mount::{default_bindings, FilesystemSecurity};
use crate::kernel::namespace::NamespaceIsolation;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{killpg, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{dup2, dup3, fork, pipe, pipe2, setpgid, ForkResult, Pid};
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::thread;
use std::time::{Duration, Instant};

const REAP_POLL: Duration = Duration::from_millis(5);
const REAP_GRACE: Duration = Duration::from_millis(250);

fn to_exec_error(prefix: &str, err: impl std::fmt::Display) -> ExecError {
    ExecError::Process(format!("{prefix}: {err}"))
}

/// Bounded reader: keeps the first `limit` bytes and drains the rest so the
/// writer never sees EPIPE because of the cap.
fn read_fd_async(fd: OwnedFd, limit: usize) -> thread::JoinHandle<(Vec<u8>, OutputIntegrity)> {
    thread::spawn(move || {
        let mut file = File::from(fd);
        let mut out = Vec::new();
        let mut buf = [0u8; 8192];
        let mut integrity = OutputIntegrity::Complete;

        loop {
            match file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let room = limit.saturating_sub(out.len());
                    if n > room {
                        out.extend_from_slice(&buf[..room]);
                        integrity = OutputIntegrity::TruncatedByLimit;
                    } else {
                        out.extend_from_slice(&buf[..n]);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => {
                    integrity = integrity.merge(OutputIntegrity::WriteError);
                    break;
                }
            }
        }

        (out, integrity)
    })
}

/// Decode captured bytes without letting the text outgrow `limit`.
///
/// A cap can split a multi-byte character; that partial tail is dropped rather
/// than turned into U+FFFD. Invalid bytes elsewhere still decode lossily, and
/// if the replacements push the text past `limit` it is cut at a char boundary.
fn decode_bounded(bytes: &[u8], limit: usize, integrity: OutputIntegrity) -> (String, OutputIntegrity) {
    let mut end = bytes.len();
    if integrity == OutputIntegrity::TruncatedByLimit {
        for i in (bytes.len().saturating_sub(3)..bytes.len()).rev() {
            let width = match bytes[i] {
                0x00..=0x7F => break,
                0x80..=0xBF => continue,
                0xC0..=0xDF => 2,
                0xE0..=0xEF => 3,
                _ => 4,
            };
            if i + width > bytes.len() {
                end = i;
            }
            break;
        }
    }

    let mut text = String::from_utf8_lossy(&bytes[..end]).into_owned();
    if text.len() <= limit {
        return (text, integrity);
    }
    let mut cut = limit;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    (text, integrity.merge(OutputIntegrity::TruncatedByLimit))
}

/// Feed stdin from its own thread so a payload that writes before reading cannot deadlock us.
fn write_stdin_async(fd: OwnedFd, data: Vec<u8>) -> thread::JoinHandle<OutputIntegrity> {
    thread::spawn(move || {
        let mut file = File::from(fd);
        match file.write_all(&data) {
            Ok(()) => OutputIntegrity::Complete,
            // The payload exited or closed stdin early; not a sandbox failure.
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                OutputIntegrity::TruncatedByProgramClose
            }
            Err(_) => OutputIntegrity::WriteError,
        }
    })
}

fn payload_setup(req: &SandboxLaunchRequest) -> Result<()> {
    let profile = &req.profile;
    let root = profile.new_root.as_ref().map(|new_root| {
        FilesystemSecurity::new(
            new_root.clone(),
            profile.host_workdir.clone(),
            default_bindings(),
            profile.tmp_size_bytes,
        )
    });

    let sandbox = Sandbox::<FreshChild>::new(req.instance_id.clone(), profile.strict_mode)
        .setup_namespaces(root.is_some())?
        .harden_mount_propagation()?
        .attach_to_cgroup(req.cgroup_attach_path.as_deref())?
        .setup_root(root.as_ref())?
        .apply_runtime_hygiene(profile)?
        .drop_credentials(profile.uid.zip(profile.gid))?
        .lock_privileges()?;

    let sandbox = if profile.enable_syscall_filtering {
        sandbox.enable_seccomp()?
    } else {
        sandbox.without_seccomp()
    };
    sandbox.exec_payload(&profile.command)
}

/// Runs in the forked child. Never returns.
fn payload_main(
    req: &SandboxLaunchRequest,
    stdin_r: OwnedFd,
    stdout_w: OwnedFd,
    stderr_w: OwnedFd,
    report_w: OwnedFd,
) -> ! {
    let wired = dup2(stdin_r.as_raw_fd(), libc::STDIN_FILENO)
        .and_then(|_| dup2(stdout_w.as_raw_fd(), libc::STDOUT_FILENO))
        .and_then(|_| dup2(stderr_w.as_raw_fd(), libc::STDERR_FILENO))
        .and_then(|_| {
            if report_w.as_raw_fd() == SETUP_REPORT_FD {
                Ok(SETUP_REPORT_FD)
            } else {
                dup3(report_w.as_raw_fd(), SETUP_REPORT_FD, OFlag::O_CLOEXEC)
            }
        });

    let message = match wired {
        Err(e) => format!("payload stdio wiring failed: {e}"),
        Ok(_) => match payload_setup(req) {
            Err(e) => e.to_string(),
            Ok(()) => "exec returned unexpectedly".to_string(),
        },
    };

    let bytes = message.as_bytes();
    unsafe {
        libc::write(SETUP_REPORT_FD, bytes.as_ptr() as *const libc::c_void, bytes.len());
        libc::_exit(127)
    }
}

/// Wait for the payload, killing its process group at `deadline`.
/// Returns (exit code, terminating signal, timed out).
fn wait_for_payload(payload: Pid, deadline: Instant) -> Result<(Option<i32>, Option<i32>, bool)> {
    let mut timed_out = false;
    loop {
        let flags = if timed_out { None } else { Some(WaitPidFlag::WNOHANG) };
        match waitpid(payload, flags) {
            Ok(WaitStatus::Exited(_, code)) => return Ok((Some(code), None, timed_out)),
            Ok(WaitStatus::Signaled(_, sig, _)) => return Ok((None, Some(sig as i32), timed_out)),
            Ok(WaitStatus::StillAlive) => {
                if Instant::now() >= deadline {
                    let _ = killpg(payload, Signal::SIGKILL);
                    let _ = nix::sys::signal::kill(payload, Signal::SIGKILL);
                    timed_out = true;
                } else {
                    thread::sleep(REAP_POLL);
                }
            }
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(e) => return Err(to_exec_error("waitpid(payload)", e)),
        }
    }
}

/// Collect every remaining child (the proxy is a subreaper). Children that
/// were just SIGKILLed get up to `grace` to exit so none outlive the report.
fn reap_descendants(grace: Duration) -> u32 {
    let give_up = Instant::now() + grace;
    let mut reaped = 0;
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) if Instant::now() < give_up => thread::sleep(REAP_POLL),
            Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => break,
            Err(Errno::EINTR) => continue,
            Err(_) => break,
            Ok(_) => reaped += 1,
        }
    }
    reaped
}

pub fn run_proxy(req: SandboxLaunchRequest) -> Result<ProxyStatus> {
    let start = Instant::now();
    let profile = &req.profile;

    let _ = setpgid(Pid::from_raw(0), Pid::from_raw(0));
    setup_parent_death_signal()?;
    // Orphaned payload descendants reparent to us so they can be reaped.
    unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1, 0, 0, 0) };

    if profile.strict_mode {
        NamespaceIsolation::strict().apply_isolation()?;
    }

    let (stdout_r, stdout_w) = pipe().map_err(|e| to_exec_error("pipe(stdout)", e))?;
    let (stderr_r, stderr_w) = pipe().map_err(|e| to_exec_error("pipe(stderr)", e))?;
    let (stdin_r, stdin_w) = pipe().map_err(|e| to_exec_error("pipe(stdin)", e))?;
    let (report_r, report_w) = pipe2(OFlag::O_CLOEXEC).map_err(|e| to_exec_error("pipe(report)", e))?;

    // SAFETY: the proxy has not started any threads yet.
    let payload = match unsafe { fork() }.map_err(|e| to_exec_error("fork(payload)", e))? {
        ForkResult::Child => {
            drop((stdout_r, stderr_r, stdin_w, report_r));
            payload_main(&req, stdin_r, stdout_w, stderr_w, report_w)
        }
        ForkResult::Parent { child } => child,
    };
    drop((stdin_r, stdout_w, stderr_w, report_w));

    let deadline = start + profile.limits.wall_time();
    let stdout_handle = read_fd_async(stdout_r, profile.max_output_bytes);
    let stderr_handle = read_fd_async(stderr_r, profile.max_output_bytes);
    let stdin_handle = write_stdin_async(stdin_w, req.stdin_data.clone());

    let mut setup_report = String::new();
    let _ = File::from(report_r).read_to_string(&mut setup_report);

    let (exit_code, term_signal, timed_out) = wait_for_payload(payload, deadline)?;
    // Stragglers outside a PID namespace share the payload's session/group.
    let _ = killpg(payload, Signal::SIGKILL);
    let reaped_descendants = reap_descendants(REAP_GRACE);

    let _ = stdin_handle.join();
    let (stdout_bytes, stdout_integrity) = stdout_handle
        .join()
        .unwrap_or_else(|_| (Vec::new(), OutputIntegrity::WriteError));
    let (stderr_bytes, stderr_integrity) = stderr_handle
        .join()
        .unwrap_or_else(|_| (Vec::new(), OutputIntegrity::WriteError));

    let limit = profile.max_output_bytes;
    let (stdout, stdout_integrity) = decode_bounded(&stdout_bytes, limit, stdout_integrity);
    let (stderr, stderr_integrity) = decode_bounded(&stderr_bytes, limit, stderr_integrity);

    let stdout_integrity = if term_signal.is_some() && stdout_integrity == OutputIntegrity::Complete && !stdout_bytes.is_empty() {
        OutputIntegrity::CrashMidWrite
    } else {
        stdout_integrity
    };

    Ok(ProxyStatus {
        payload_pid: Some(payload.as_raw()),
        exit_code,
        term_signal,
        wall_time_ms: start.elapsed().as_millis() as u64,
        timed_out,
        stdout,
        stderr,
        output_integrity: stdout_integrity.merge(stderr_integrity),
        stdout_integrity,
        stderr_integrity,
        internal_error: (!setup_report.is_empty()).then_some(setup_report),
        reaped_descendants,
    })
}

/// Entry point for `--internal-role proxy`. Returns the proxy's exit code.
pub fn run_proxy_role() -> i32 {
    let mut raw = Vec::new();
    let status = match std::io::stdin().read_to_end(&mut raw) {
        Err(e) => ProxyStatus {
            internal_error: Some(format!("failed to read launch request: {e}")),
            ..Default::default()
        },
        Ok(_) => match serde_json::from_slice::<SandboxLaunchRequest>(&raw) {
            Err(e) => ProxyStatus {
                internal_error: Some(format!("invalid launch request: {e}")),
                ..Default::default()
            },
            Ok(req) => run_proxy(req).unwrap_or_else(|e| ProxyStatus {
                internal_error: Some(e.to_string()),
                ..Default::default()
            }),
        },
    };

    let mut stdout = std::io::stdout().lock();
    let written = serde_json::to_writer(&mut stdout, &status)
        .map_err(std::io::Error::from)
        .and_then(|_| stdout.flush());
    match written {
        Ok(()) if status.internal_error.is_none() => 0,
        Ok(()) => 126,
        Err(_) => 125,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_reader_truncates_and_drains() {
        let (r, w) = pipe().unwrap();
        let handle = read_fd_async(r, 8);
        let mut writer = File::from(w);
        writer.write_all(&[b'x'; 100_000]).unwrap();
        drop(writer);

        let (bytes, integrity) = handle.join().unwrap();
        assert_eq!(bytes.len(), 8);
        assert_eq!(integrity, OutputIntegrity::TruncatedByLimit);
    }

    #[test]
    fn split_multibyte_tail_is_dropped_not_replaced() {
        let mut output = b"x".to_vec();
        for _ in 0..1000 {
            output.extend_from_slice("é".as_bytes());
        }
        let (r, w) = pipe().unwrap();
        let handle = read_fd_async(r, 1024);
        File::from(w).write_all(&output).unwrap();
        let (bytes, integrity) = handle.join().unwrap();
        assert_eq!(bytes.len(), 1024);

        let (text, integrity) = decode_bounded(&bytes, 1024, integrity);
        assert!(text.len() <= 1024, "{} bytes", text.len());
        assert_eq!(text.len(), 1023);
        assert!(!text.contains('\u{FFFD}'));
        assert_eq!(integrity, OutputIntegrity::TruncatedByLimit);
    }

    #[test]
    fn invalid_bytes_never_grow_past_the_cap() {
        let bytes = vec![0xFFu8; 16];
        let (text, integrity) = decode_bounded(&bytes, 16, OutputIntegrity::Complete);
        assert!(text.len() <= 16);
        assert!(text.chars().all(|c| c == '\u{FFFD}'));
        assert_eq!(integrity, OutputIntegrity::TruncatedByLimit);

        let (text, integrity) = decode_bounded("héllo".as_bytes(), 64, OutputIntegrity::Complete);
        assert_eq!(text, "héllo");
        assert_eq!(integrity, OutputIntegrity::Complete);
    }

    #[test]
    fn bounded_reader_keeps_short_output() {
        let (r, w) = pipe().unwrap();
        let handle = read_fd_async(r, 1024);
        File::from(w).write_all(b"hello\n").unwrap();

        let (bytes, integrity) = handle.join().unwrap();
        assert_eq!(bytes, b"hello\n");
        assert_eq!(integrity, OutputIntegrity::Complete);
    }

    #[test]
    fn stdin_writer_tolerates_early_close() {
        let (r, w) = pipe().unwrap();
        drop(r);
        // SIGPIPE is ignored by the Rust runtime, so the write surfaces as EPIPE.
        let result = write_stdin_async(w, vec![0u8; 1 << 20]).join().unwrap();
        assert_eq!(result, OutputIntegrity::TruncatedByProgramClose);
    }
}
