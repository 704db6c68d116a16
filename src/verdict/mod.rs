//! Execution state machine and result normalization
//!
//! The supervisor drives a request to exactly one terminal state; the
//! normalizer turns that state into the caller-facing result.

pub mod normalizer;
pub mod state;
pub mod supervisor;

pub use normalizer::{outcome_class, ResultNormalizer, SANDBOX_FAULT_MESSAGE};
pub use state::{CrashCause, ExecutionState, Phase, StateMachine, TerminalState};
pub use supervisor::{ExecutionSupervisor, PhaseListener, PhaseRunner, SupervisedRun};
