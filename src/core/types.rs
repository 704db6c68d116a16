use crate::config::types::{ExitStatus, OutputIntegrity, PhaseLimits};
use crate::kernel::cgroup::CgroupEvidence;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Everything the proxy needs to start one payload. Serialized supervisor -> proxy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionProfile {
    pub command: Vec<String>,
    pub environment: Vec<(String, String)>,
    /// Payload working directory, as seen by the payload
    pub workdir: PathBuf,
    /// Host path of the writable work dir (bind source for the sandbox root)
    pub host_workdir: PathBuf,
    /// Directory where the sandbox root is assembled; `None` keeps the host view
    pub new_root: Option<PathBuf>,
    pub tmp_size_bytes: u64,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Kernel isolation (namespaces, root, credentials) is mandatory
    pub strict_mode: bool,
    pub enable_syscall_filtering: bool,
    pub limits: PhaseLimits,
    /// Apply RLIMIT_AS from `limits.memory_bytes`
    pub address_space_limit: bool,
    pub file_size_limit: u64,
    pub stack_limit: u64,
    pub fd_limit: u64,
    pub max_output_bytes: usize,
}

impl ExecutionProfile {
    pub fn cpu_limit_usec(&self) -> u64 {
        self.limits.cpu_time_ms.saturating_mul(1000)
    }
}

/// Host->proxy launch contract.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SandboxLaunchRequest {
    pub instance_id: String,
    pub profile: ExecutionProfile,
    pub stdin_data: Vec<u8>,
    pub cgroup_attach_path: Option<PathBuf>,
}

/// Signal escalation report for timeout/forced termination paths.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct KillReport {
    pub cgroup_killed: bool,
    pub group_signalled: bool,
    pub proxy_killed: bool,
    pub waited_ms: u64,
    pub notes: Vec<String>,
}

/// Proxy->host status payload, printed by the proxy as one JSON document.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProxyStatus {
    pub payload_pid: Option<i32>,
    pub exit_code: Option<i32>,
    pub term_signal: Option<i32>,
    pub wall_time_ms: u64,
    /// The proxy's own deadline fired and it killed the payload
    pub timed_out: bool,
    pub stdout: String,
    pub stderr: String,
    pub stdout_integrity: OutputIntegrity,
    pub stderr_integrity: OutputIntegrity,
    pub output_integrity: OutputIntegrity,
    pub internal_error: Option<String>,
    pub reaped_descendants: u32,
}

impl ProxyStatus {
    pub fn exit_status(&self) -> Option<ExitStatus> {
        ExitStatus::from_parts(self.exit_code, self.term_signal)
    }
}

/// Why the supervisor stopped a phase before it finished on its own
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    WallClock,
    CpuTime,
    Cancelled,
}

/// Raw result of one supervised phase, before normalization
#[derive(Clone, Debug, Default)]
pub struct PhaseOutcome {
    pub exit: Option<ExitStatus>,
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
    pub integrity: OutputIntegrity,
    pub wall_time: Duration,
    pub stopped: Option<StopReason>,
    pub evidence: CgroupEvidence,
    /// The proxy or kernel setup failed; the payload may never have started
    pub internal_error: Option<String>,
    pub kill_report: Option<KillReport>,
}

impl PhaseOutcome {
    pub fn succeeded(&self) -> bool {
        self.stopped.is_none()
            && self.internal_error.is_none()
            && self.exit.map(|e| e.is_success()).unwrap_or(false)
    }

    pub fn timed_out(&self) -> bool {
        self.stopped == Some(StopReason::WallClock)
    }

    /// Evidence that a kernel-enforced limit ended the process
    pub fn resource_limit_hit(&self) -> bool {
        if self.stopped == Some(StopReason::CpuTime) || self.evidence.memory_exhausted() {
            return true;
        }
        match self.exit {
            Some(ExitStatus::Signal(sig)) => {
                sig == libc::SIGXCPU
                    || sig == libc::SIGXFSZ
                    || (sig == libc::SIGKILL && self.evidence.pids_exhausted())
            }
            Some(ExitStatus::Code(code)) => code != 0 && self.evidence.pids_exhausted(),
            None => false,
        }
    }
}
