//! Host side of the supervisor -> proxy -> payload model.
//!
//! The supervisor re-executes the service binary in its proxy role, hands it
//! the launch request, and watches it from outside: wall clock, cgroup CPU
//! usage and the caller's cancel flag. Any of those fires a forced kill of
//! the sandbox cgroup; a proxy that then fails to report is killed as a group.
use crate::config::types::{ExecError, OutputIntegrity, Result};
use crate::core::types::{KillReport, PhaseOutcome, ProxyStatus, SandboxLaunchRequest, StopReason};
use crate::kernel::cgroup::CgroupV2;
use crossbeam_channel::{bounded, Receiver};
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// How long a killed sandbox gets to let the proxy report before the proxy itself is killed
const PROXY_GRACE: Duration = Duration::from_millis(500);
/// Status documents are small; anything past this is a broken proxy
const MAX_STATUS_BYTES: u64 = 64 * 1024 * 1024;

pub const PROXY_ROLE_FLAG: &str = "--internal-role";
pub const PROXY_ROLE: &str = "proxy";

fn to_process_error(prefix: &str, err: impl std::fmt::Display) -> ExecError {
    ExecError::Process(format!("{prefix}: {err}"))
}

/// Spawns proxies from one executable (normally the running service binary).
#[derive(Clone, Debug)]
pub struct ProxyLauncher {
    program: PathBuf,
}

impl ProxyLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn current_exe() -> Result<Self> {
        let program = std::env::current_exe()
            .map_err(|e| to_process_error("cannot resolve own executable", e))?;
        Ok(Self::new(program))
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Run one phase to completion. Always returns once the proxy is gone;
    /// sandbox-level failures come back as `PhaseOutcome::internal_error`.
    pub fn launch(
        &self,
        req: &SandboxLaunchRequest,
        cgroup: Option<&CgroupV2>,
        cancel: &AtomicBool,
    ) -> Result<PhaseOutcome> {
        if req.profile.command.is_empty() {
            return Err(ExecError::Config("empty command".to_string()));
        }

        let payload = serde_json::to_vec(req)?;
        let started = Instant::now();
        let mut child = Command::new(&self.program)
            .arg(PROXY_ROLE_FLAG)
            .arg(PROXY_ROLE)
            .env_clear()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .map_err(|e| to_process_error("spawn proxy", e))?;

        let status_rx = spawn_status_reader(&mut child)?;
        spawn_stderr_logger(&mut child, &req.instance_id);

        if let Some(mut stdin) = child.stdin.take() {
            // A proxy that died this early is reported below as a missing status.
            if let Err(e) = stdin.write_all(&payload) {
                log::debug!("[{}] failed to send launch request: {}", req.instance_id, e);
            }
        }

        let watch = watch_proxy(&mut child, req, cgroup, cancel, started)?;

        let status = match status_rx.recv_timeout(PROXY_GRACE) {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => ProxyStatus {
                internal_error: Some(format!(
                    "proxy exited ({}) without a readable status: {}",
                    watch.exit_summary, e
                )),
                ..Default::default()
            },
            Err(_) => ProxyStatus {
                internal_error: Some(format!("proxy exited ({}) without reporting", watch.exit_summary)),
                ..Default::default()
            },
        };

        let evidence = cgroup
            .map(|cg| cg.collect_evidence(&req.instance_id))
            .unwrap_or_default();

        let stopped = watch
            .stopped
            .or_else(|| status.timed_out.then_some(StopReason::WallClock));
        let truncated = status.stdout_integrity == OutputIntegrity::TruncatedByLimit
            || status.stderr_integrity == OutputIntegrity::TruncatedByLimit;

        log::debug!(
            "[{}] phase finished: exit={:?} stopped={:?} wall={:?} reaped={}",
            req.instance_id,
            status.exit_status(),
            stopped,
            started.elapsed(),
            status.reaped_descendants
        );

        Ok(PhaseOutcome {
            exit: status.exit_status(),
            truncated,
            integrity: status.output_integrity,
            wall_time: started.elapsed(),
            stopped,
            evidence,
            // A deliberate kill may cut the proxy short; that is not a sandbox fault.
            internal_error: if stopped.is_some() && status.internal_error.is_some() && watch.proxy_killed {
                None
            } else {
                status.internal_error
            },
            kill_report: watch.kill_report,
            stdout: status.stdout,
            stderr: status.stderr,
        })
    }
}

struct WatchResult {
    stopped: Option<StopReason>,
    kill_report: Option<KillReport>,
    proxy_killed: bool,
    exit_summary: String,
}

fn watch_proxy(
    child: &mut Child,
    req: &SandboxLaunchRequest,
    cgroup: Option<&CgroupV2>,
    cancel: &AtomicBool,
    started: Instant,
) -> Result<WatchResult> {
    let wall_limit = req.profile.limits.wall_time();
    let cpu_limit_usec = req.profile.cpu_limit_usec();
    let mut stopped = None;
    let mut kill_report: Option<KillReport> = None;
    let mut killed_at: Option<Instant> = None;
    let mut proxy_killed = false;

    loop {
        match child.try_wait() {
            Ok(Some(exit)) => {
                return Ok(WatchResult {
                    stopped,
                    kill_report,
                    proxy_killed,
                    exit_summary: exit.to_string(),
                })
            }
            Ok(None) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                kill_proxy_group(child);
                return Err(to_process_error("wait(proxy)", e));
            }
        }

        match killed_at {
            None => {
                let reason = if cancel.load(Ordering::Acquire) {
                    Some(StopReason::Cancelled)
                } else if started.elapsed() >= wall_limit {
                    Some(StopReason::WallClock)
                } else {
                    cgroup
                        .and_then(|cg| cg.cpu_usage_usec(&req.instance_id).ok())
                        .filter(|&usage| usage >= cpu_limit_usec)
                        .map(|_| StopReason::CpuTime)
                };

                if let Some(reason) = reason {
                    log::debug!("[{}] stopping sandbox: {:?}", req.instance_id, reason);
                    let report = kill_sandbox(child, &req.instance_id, cgroup);
                    proxy_killed = report.proxy_killed;
                    stopped = Some(reason);
                    kill_report = Some(report);
                    killed_at = Some(Instant::now());
                }
            }
            Some(at) if !proxy_killed && at.elapsed() >= PROXY_GRACE => {
                kill_proxy_group(child);
                proxy_killed = true;
                if let Some(report) = kill_report.as_mut() {
                    report.proxy_killed = true;
                    report.notes.push("proxy did not exit after sandbox kill".to_string());
                }
            }
            Some(_) => {}
        }

        thread::sleep(POLL_INTERVAL);
    }
}

/// Kill the untrusted side first. With a cgroup that is exactly the payload tree;
/// without one, the proxy group goes (the payload follows through PDEATHSIG).
fn kill_sandbox(child: &mut Child, instance_id: &str, cgroup: Option<&CgroupV2>) -> KillReport {
    let start = Instant::now();
    let mut report = KillReport::default();

    if let Some(cg) = cgroup {
        match cg.kill(instance_id) {
            Ok(()) => report.cgroup_killed = true,
            Err(e) => report.notes.push(format!("cgroup kill failed: {}", e)),
        }
    }
    if !report.cgroup_killed {
        // The payload leads its own session; signal that group and leave the
        // proxy alive to reap it. The watch loop kills the proxy if it stalls.
        let groups = payload_groups(child.id() as libc::pid_t);
        for pgid in &groups {
            // SAFETY: kill(2) with a negative pid only sends a signal.
            if unsafe { libc::kill(-pgid, libc::SIGKILL) } == 0 {
                report.group_signalled = true;
            }
        }
        if !report.group_signalled {
            report.notes.push("no payload group found; killing proxy group".to_string());
            kill_proxy_group(child);
            report.group_signalled = true;
            report.proxy_killed = true;
        }
    }

    report.waited_ms = start.elapsed().as_millis() as u64;
    report
}

/// Direct children of the (single-threaded) proxy, i.e. the payload.
fn payload_groups(proxy: libc::pid_t) -> Vec<libc::pid_t> {
    std::fs::read_to_string(format!("/proc/{proxy}/task/{proxy}/children"))
        .map(|raw| parse_pid_list(&raw))
        .unwrap_or_default()
}

fn parse_pid_list(raw: &str) -> Vec<libc::pid_t> {
    raw.split_whitespace()
        .filter_map(|pid| pid.parse().ok())
        .filter(|&pid: &libc::pid_t| pid > 1)
        .collect()
}

fn kill_proxy_group(child: &mut Child) {
    let pid = child.id() as libc::pid_t;
    // The proxy leads its own process group (process_group(0) at spawn).
    let rc = unsafe { libc::kill(-pid, libc::SIGKILL) };
    if rc != 0 {
        let _ = child.kill();
    }
}

fn spawn_status_reader(child: &mut Child) -> Result<Receiver<std::result::Result<ProxyStatus, String>>> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ExecError::Process("proxy stdout not captured".to_string()))?;
    let (tx, rx) = bounded(1);
    thread::spawn(move || {
        let mut raw = Vec::new();
        let parsed = stdout
            .take(MAX_STATUS_BYTES)
            .read_to_end(&mut raw)
            .map_err(|e| e.to_string())
            .and_then(|_| serde_json::from_slice::<ProxyStatus>(&raw).map_err(|e| e.to_string()));
        let _ = tx.send(parsed);
    });
    Ok(rx)
}

fn spawn_stderr_logger(child: &mut Child, instance_id: &str) {
    if let Some(stderr) = child.stderr.take() {
        let instance_id = instance_id.to_string();
        thread::spawn(move || {
            for line in BufReader::new(stderr).lines().map_while(|l| l.ok()) {
                log::debug!("[{}] proxy: {}", instance_id, line);
            }
        });
    }
}
