//! Per-request execution state machine.
//!
//! `Pending -> [Compiling ->] Running -> terminal`, where compile and run may
//! each jump straight to a terminal state. A terminal state is entered once and
//! never left.
use crate::core::types::PhaseOutcome;
use serde::Serialize;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Pending,
    Compiling,
    Running,
    Completed,
    TimedOut,
    Crashed,
    CompileFailed,
}

impl ExecutionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionState::Completed
                | ExecutionState::TimedOut
                | ExecutionState::Crashed
                | ExecutionState::CompileFailed
        )
    }

    fn can_advance_to(self, next: ExecutionState) -> bool {
        use ExecutionState::*;
        match self {
            Pending => matches!(next, Compiling | Running | Crashed),
            Compiling => matches!(next, Running | CompileFailed | TimedOut | Crashed),
            Running => matches!(next, Completed | TimedOut | Crashed),
            Completed | TimedOut | Crashed | CompileFailed => false,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: ExecutionState,
    pub to: ExecutionState,
}

/// Tracks the current state and the path taken to reach it
#[derive(Debug, Clone)]
pub struct StateMachine {
    state: ExecutionState,
    history: Vec<ExecutionState>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: ExecutionState::Pending,
            history: vec![ExecutionState::Pending],
        }
    }

    pub fn state(&self) -> ExecutionState {
        self.state
    }

    pub fn history(&self) -> &[ExecutionState] {
        &self.history
    }

    pub fn advance(&mut self, next: ExecutionState) -> Result<(), InvalidTransition> {
        if !self.state.can_advance_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.history.push(next);
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Compile,
    Run,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Compile => "compile",
            Phase::Run => "run",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CrashCause {
    ResourceLimitExceeded,
    SandboxFault,
}

/// Where a request ended, with the raw evidence the normalizer needs
#[derive(Clone, Debug)]
pub enum TerminalState {
    Completed {
        outcome: PhaseOutcome,
    },
    CompileFailed {
        outcome: PhaseOutcome,
    },
    TimedOut {
        phase: Phase,
        outcome: PhaseOutcome,
    },
    Crashed {
        phase: Option<Phase>,
        cause: CrashCause,
        outcome: Option<PhaseOutcome>,
        /// Operator-facing detail; never returned to the caller
        detail: String,
    },
}

impl TerminalState {
    pub fn state(&self) -> ExecutionState {
        match self {
            TerminalState::Completed { .. } => ExecutionState::Completed,
            TerminalState::CompileFailed { .. } => ExecutionState::CompileFailed,
            TerminalState::TimedOut { .. } => ExecutionState::TimedOut,
            TerminalState::Crashed { .. } => ExecutionState::Crashed,
        }
    }

    pub fn outcome(&self) -> Option<&PhaseOutcome> {
        match self {
            TerminalState::Completed { outcome }
            | TerminalState::CompileFailed { outcome }
            | TerminalState::TimedOut { outcome, .. } => Some(outcome),
            TerminalState::Crashed { outcome, .. } => outcome.as_ref(),
        }
    }

    pub fn is_sandbox_fault(&self) -> bool {
        matches!(
            self,
            TerminalState::Crashed {
                cause: CrashCause::SandboxFault,
                ..
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiled_happy_path() {
        let mut sm = StateMachine::new();
        sm.advance(ExecutionState::Compiling).unwrap();
        sm.advance(ExecutionState::Running).unwrap();
        sm.advance(ExecutionState::Completed).unwrap();
        assert!(sm.state().is_terminal());
        assert_eq!(sm.history().len(), 4);
    }

    #[test]
    fn terminal_is_final() {
        let mut sm = StateMachine::new();
        sm.advance(ExecutionState::Running).unwrap();
        sm.advance(ExecutionState::TimedOut).unwrap();
        let err = sm.advance(ExecutionState::Completed).unwrap_err();
        assert_eq!(err.from, ExecutionState::TimedOut);
        assert_eq!(sm.state(), ExecutionState::TimedOut);
    }

    #[test]
    fn compile_failure_skips_running() {
        let mut sm = StateMachine::new();
        assert!(sm.advance(ExecutionState::CompileFailed).is_err());
        sm.advance(ExecutionState::Compiling).unwrap();
        sm.advance(ExecutionState::CompileFailed).unwrap();
        assert!(sm.advance(ExecutionState::Running).is_err());
    }

    #[test]
    fn running_cannot_fail_compilation() {
        let mut sm = StateMachine::new();
        sm.advance(ExecutionState::Running).unwrap();
        assert!(sm.advance(ExecutionState::CompileFailed).is_err());
    }
}
