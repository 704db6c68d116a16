//! Maps a terminal state onto the caller-facing result contract.
//!
//! `success` reports whether the sandbox mechanism worked, not whether the
//! submitted program did. Only `Crashed` states are unsuccessful.
//!
//! | terminal                 | success | error_kind            |
//! |--------------------------|---------|-----------------------|
//! | Completed, exit 0        | true    | -                     |
//! | Completed, other exit    | true    | RuntimeError          |
//! | CompileFailed            | true    | CompileError          |
//! | TimedOut                 | true    | Timeout               |
//! | Crashed (limit)          | false   | ResourceLimitExceeded |
//! | Crashed (fault)          | false   | SandboxFault          |
use crate::config::types::{ErrorKind, ExecutionResult};
use crate::core::types::PhaseOutcome;
use crate::verdict::state::{CrashCause, TerminalState};
use std::time::Duration;

/// Shown to the caller instead of any internal detail
pub const SANDBOX_FAULT_MESSAGE: &str = "Internal execution error.";

pub struct ResultNormalizer;

impl ResultNormalizer {
    pub fn normalize(run_id: &str, terminal: &TerminalState, duration: Duration) -> ExecutionResult {
        let (success, error_kind) = Self::classify(terminal);

        if error_kind == Some(ErrorKind::SandboxFault) {
            return ExecutionResult {
                run_id: run_id.to_string(),
                success,
                stdout: String::new(),
                stderr: SANDBOX_FAULT_MESSAGE.to_string(),
                exit_status: None,
                error_kind,
                duration,
                truncated: false,
            };
        }

        let outcome = terminal.outcome();
        let mut stderr = outcome.map(|o| o.stderr.clone()).unwrap_or_default();
        let stdout = outcome.map(|o| o.stdout.clone()).unwrap_or_default();

        // Some compilers report diagnostics on stdout only
        if matches!(terminal, TerminalState::CompileFailed { .. }) && stderr.is_empty() {
            stderr = stdout.clone();
        }

        ExecutionResult {
            run_id: run_id.to_string(),
            success,
            stdout,
            stderr,
            exit_status: outcome.and_then(|o| o.exit),
            error_kind,
            duration,
            truncated: outcome.map(|o| o.truncated).unwrap_or(false),
        }
    }

    /// Pure mapping from terminal state to (success, error_kind)
    pub fn classify(terminal: &TerminalState) -> (bool, Option<ErrorKind>) {
        match terminal {
            TerminalState::Completed { outcome } => (true, Self::completed_kind(outcome)),
            TerminalState::CompileFailed { .. } => (true, Some(ErrorKind::CompileError)),
            TerminalState::TimedOut { .. } => (true, Some(ErrorKind::Timeout)),
            TerminalState::Crashed {
                cause: CrashCause::ResourceLimitExceeded,
                ..
            } => (false, Some(ErrorKind::ResourceLimitExceeded)),
            TerminalState::Crashed {
                cause: CrashCause::SandboxFault,
                ..
            } => (false, Some(ErrorKind::SandboxFault)),
        }
    }

    fn completed_kind(outcome: &PhaseOutcome) -> Option<ErrorKind> {
        match outcome.exit {
            Some(exit) if exit.is_success() => None,
            _ => Some(ErrorKind::RuntimeError),
        }
    }
}

/// Coarse outcome label for audit records and metric labels
pub fn outcome_class(result: &ExecutionResult) -> &'static str {
    match result.error_kind {
        None => "ok",
        Some(ErrorKind::CompileError) => "compile_error",
        Some(ErrorKind::RuntimeError) => "runtime_error",
        Some(ErrorKind::Timeout) => "timeout",
        Some(ErrorKind::ResourceLimitExceeded) => "resource",
        Some(ErrorKind::SandboxFault) => "sandbox_fault",
        Some(ErrorKind::UnsupportedLanguage) => "unsupported_language",
        Some(ErrorKind::InputTooLarge) => "input_too_large",
        Some(ErrorKind::Overloaded) => "overloaded",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::ExitStatus;
    use crate::verdict::state::Phase;

    #[test]
    fn signal_death_is_runtime_error() {
        let terminal = TerminalState::Completed {
            outcome: PhaseOutcome {
                exit: Some(ExitStatus::Signal(libc::SIGSEGV)),
                stderr: "boom".into(),
                ..Default::default()
            },
        };
        let result = ResultNormalizer::normalize("r1", &terminal, Duration::ZERO);
        assert!(result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::RuntimeError));
        assert_eq!(result.exit_status, Some(ExitStatus::Signal(libc::SIGSEGV)));
        assert_eq!(result.stderr, "boom");
    }

    #[test]
    fn fault_hides_internal_detail() {
        let terminal = TerminalState::Crashed {
            phase: Some(Phase::Run),
            cause: CrashCause::SandboxFault,
            outcome: Some(PhaseOutcome {
                stderr: "/var/lib/execbox/abc: permission denied".into(),
                internal_error: Some("mount failed".into()),
                ..Default::default()
            }),
            detail: "mount failed at /var/lib/execbox".into(),
        };
        let result = ResultNormalizer::normalize("r2", &terminal, Duration::ZERO);
        assert!(!result.success);
        assert_eq!(result.stderr, SANDBOX_FAULT_MESSAGE);
        assert!(result.stdout.is_empty());
        assert_eq!(outcome_class(&result), "sandbox_fault");
    }

    #[test]
    fn compile_diagnostics_fall_back_to_stdout() {
        let terminal = TerminalState::CompileFailed {
            outcome: PhaseOutcome {
                exit: Some(ExitStatus::Code(1)),
                stdout: "Main.java:1: error".into(),
                ..Default::default()
            },
        };
        let result = ResultNormalizer::normalize("r3", &terminal, Duration::ZERO);
        assert_eq!(result.stderr, "Main.java:1: error");
        assert_eq!(result.error_kind.and_then(|k| k.error_type()), Some("compile"));
    }
}
