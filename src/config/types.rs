/// Core types shared across the execution service
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Request-facing error taxonomy.
///
/// Admission-time kinds (`UnsupportedLanguage`, `InputTooLarge`, `Overloaded`) are
/// returned instead of a result. Execution-time kinds travel inside a normal
/// [`ExecutionResult`].
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    #[serde(rename = "unsupported_language")]
    UnsupportedLanguage,
    #[serde(rename = "input_too_large")]
    InputTooLarge,
    #[serde(rename = "overloaded")]
    Overloaded,
    #[serde(rename = "compile_error")]
    CompileError,
    #[serde(rename = "runtime_error")]
    RuntimeError,
    #[serde(rename = "timeout")]
    Timeout,
    #[serde(rename = "resource_limit_exceeded")]
    ResourceLimitExceeded,
    #[serde(rename = "sandbox_fault")]
    SandboxFault,
}

impl ErrorKind {
    /// Short class used on the wire as `error_type`.
    pub fn error_type(self) -> Option<&'static str> {
        match self {
            ErrorKind::CompileError => Some("compile"),
            ErrorKind::RuntimeError => Some("runtime"),
            ErrorKind::Timeout => Some("timeout"),
            ErrorKind::ResourceLimitExceeded => Some("resource"),
            _ => None,
        }
    }

    /// Whether the caller may retry the same request later.
    pub fn is_recoverable(self) -> bool {
        matches!(self, ErrorKind::Overloaded)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::UnsupportedLanguage => "unsupported_language",
            ErrorKind::InputTooLarge => "input_too_large",
            ErrorKind::Overloaded => "overloaded",
            ErrorKind::CompileError => "compile_error",
            ErrorKind::RuntimeError => "runtime_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ResourceLimitExceeded => "resource_limit_exceeded",
            ErrorKind::SandboxFault => "sandbox_fault",
        };
        write!(f, "{}", s)
    }
}

/// Output integrity classification for one captured stream
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum OutputIntegrity {
    #[default]
    #[serde(rename = "complete")]
    Complete,
    #[serde(rename = "truncated_by_limit")]
    TruncatedByLimit,
    #[serde(rename = "truncated_by_program_close")]
    TruncatedByProgramClose,
    #[serde(rename = "crash_mid_write")]
    CrashMidWrite,
    #[serde(rename = "write_error")]
    WriteError,
}

impl OutputIntegrity {
    /// Rank used when merging per-stream states; higher wins.
    pub fn severity(&self) -> u8 {
        match self {
            OutputIntegrity::Complete => 0,
            OutputIntegrity::TruncatedByProgramClose => 1,
            OutputIntegrity::TruncatedByLimit => 2,
            OutputIntegrity::CrashMidWrite => 3,
            OutputIntegrity::WriteError => 4,
        }
    }

    pub fn merge(self, other: OutputIntegrity) -> OutputIntegrity {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

impl std::fmt::Display for OutputIntegrity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputIntegrity::Complete => write!(f, "complete"),
            OutputIntegrity::TruncatedByLimit => write!(f, "truncated_by_limit"),
            OutputIntegrity::TruncatedByProgramClose => write!(f, "truncated_by_program_close"),
            OutputIntegrity::CrashMidWrite => write!(f, "crash_mid_write"),
            OutputIntegrity::WriteError => write!(f, "write_error"),
        }
    }
}

/// One execution submitted by a caller. Immutable once accepted.
#[derive(Clone, Debug)]
pub struct ExecutionRequest {
    pub language: String,
    pub source: Vec<u8>,
    pub stdin: Vec<u8>,
    pub caller_id: String,
}

impl ExecutionRequest {
    pub fn new(
        language: impl Into<String>,
        source: impl Into<Vec<u8>>,
        stdin: impl Into<Vec<u8>>,
        caller_id: impl Into<String>,
    ) -> Self {
        Self {
            language: language.into(),
            source: source.into(),
            stdin: stdin.into(),
            caller_id: caller_id.into(),
        }
    }
}

/// How the payload process ended
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    Code(i32),
    Signal(i32),
}

impl ExitStatus {
    pub fn from_parts(code: Option<i32>, signal: Option<i32>) -> Option<Self> {
        match (signal, code) {
            (Some(sig), _) => Some(ExitStatus::Signal(sig)),
            (None, Some(code)) => Some(ExitStatus::Code(code)),
            (None, None) => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExitStatus::Code(0))
    }
}

/// Uniform result contract returned once per request
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct ExecutionResult {
    pub run_id: String,
    /// The sandbox mechanism functioned. Says nothing about the submitted program.
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_status: Option<ExitStatus>,
    pub error_kind: Option<ErrorKind>,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    pub truncated: bool,
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }
}

/// Resource caps for one phase (compile or run) of an execution
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhaseLimits {
    pub cpu_time_ms: u64,
    pub wall_time_ms: u64,
    pub memory_bytes: u64,
    pub max_processes: u32,
}

impl PhaseLimits {
    pub fn wall_time(&self) -> Duration {
        Duration::from_millis(self.wall_time_ms)
    }

    pub fn cpu_time(&self) -> Duration {
        Duration::from_millis(self.cpu_time_ms)
    }
}

impl Default for PhaseLimits {
    fn default() -> Self {
        Self {
            cpu_time_ms: 2_000,
            wall_time_ms: 5_000,
            memory_bytes: 256 * 1024 * 1024,
            max_processes: 64,
        }
    }
}

/// Custom error types for execbox
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cgroup error: {0}")]
    Cgroup(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Namespace isolation error: {0}")]
    Namespace(String),

    #[error("Resource limit error: {0}")]
    ResourceLimit(String),

    #[error("Filesystem error: {0}")]
    Filesystem(String),

    #[error("Privilege error: {0}")]
    Privilege(String),

    #[error("Seccomp error: {0}")]
    Seccomp(String),

    #[error("Admission rejected: {0}")]
    Admission(String),
}

impl From<nix::errno::Errno> for ExecError {
    fn from(err: nix::errno::Errno) -> Self {
        ExecError::Process(err.to_string())
    }
}

impl From<serde_json::Error> for ExecError {
    fn from(err: serde_json::Error) -> Self {
        ExecError::Process(format!("serialization: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, ExecError>;
