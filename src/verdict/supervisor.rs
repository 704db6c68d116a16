//! Drives one request through compile and run inside an acquired sandbox.
//!
//! The supervisor never releases the handle itself; the caller owns it and
//! releases it on every path. What it guarantees is that exactly one
//! [`TerminalState`] comes back, whatever the phases did.
use crate::config::types::{ExecutionRequest, Result};
use crate::core::supervisor::ProxyLauncher;
use crate::core::types::{PhaseOutcome, StopReason};
use crate::judge::registry::LanguageProfile;
use crate::safety::{PhaseSpec, SandboxHandle};
use crate::verdict::state::{
    CrashCause, ExecutionState, Phase, StateMachine, TerminalState,
};
use log::{debug, error};
use std::sync::atomic::AtomicBool;

/// Runs one phase inside a sandbox. The proxy launcher is the real one; tests
/// substitute canned outcomes.
pub trait PhaseRunner: Send + Sync {
    fn run_phase(
        &self,
        handle: &mut SandboxHandle,
        spec: PhaseSpec,
        cancel: &AtomicBool,
    ) -> Result<PhaseOutcome>;
}

impl PhaseRunner for ProxyLauncher {
    fn run_phase(
        &self,
        handle: &mut SandboxHandle,
        spec: PhaseSpec,
        cancel: &AtomicBool,
    ) -> Result<PhaseOutcome> {
        let (request, cgroup) = handle.launch_request(spec)?;
        self.launch(&request, cgroup.as_ref(), cancel)
    }
}

/// Phase boundary notifications, used for auditing
pub trait PhaseListener {
    fn phase_started(&self, _phase: Phase) {}
    fn phase_finished(&self, _phase: Phase, _outcome: &PhaseOutcome) {}
}

impl PhaseListener for () {}

/// Result of one supervised request
#[derive(Debug, Clone)]
pub struct SupervisedRun {
    pub terminal: TerminalState,
    pub path: Vec<ExecutionState>,
}

pub struct ExecutionSupervisor<R: PhaseRunner = ProxyLauncher> {
    runner: R,
}

enum Step {
    Continue(PhaseOutcome),
    Stop(TerminalState),
}

impl<R: PhaseRunner> ExecutionSupervisor<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn execute(
        &self,
        handle: &mut SandboxHandle,
        profile: &LanguageProfile,
        request: &ExecutionRequest,
        cancel: &AtomicBool,
        listener: &dyn PhaseListener,
    ) -> SupervisedRun {
        let mut machine = StateMachine::new();
        let terminal = self.drive(&mut machine, handle, profile, request, cancel, listener);

        // Every terminal variant is reachable from the state the drive stopped in.
        if let Err(e) = machine.advance(terminal.state()) {
            error!("[{}] state machine rejected terminal: {}", handle.id(), e);
        }
        debug!("[{}] path: {:?}", handle.id(), machine.history());

        SupervisedRun {
            terminal,
            path: machine.history().to_vec(),
        }
    }

    fn drive(
        &self,
        machine: &mut StateMachine,
        handle: &mut SandboxHandle,
        profile: &LanguageProfile,
        request: &ExecutionRequest,
        cancel: &AtomicBool,
        listener: &dyn PhaseListener,
    ) -> TerminalState {
        let invocation = profile.prepare(&request.source);
        if let Err(e) = handle.write_file(&invocation.source_file, &request.source) {
            return fault(None, format!("staging source: {}", e));
        }

        if let Some(compile) = invocation.compile {
            if let Err(e) = machine.advance(ExecutionState::Compiling) {
                return fault(None, e.to_string());
            }
            let spec = PhaseSpec {
                name: Phase::Compile.as_str(),
                command: compile,
                environment: profile.environment.clone(),
                limits: profile.compile_limits,
                address_space_limit: profile.address_space_limit,
                max_output_bytes: profile.max_output_bytes,
                stdin: Vec::new(),
            };
            match self.run(Phase::Compile, handle, spec, cancel, listener) {
                Step::Stop(terminal) => return terminal,
                Step::Continue(outcome) if !outcome.succeeded() => {
                    return TerminalState::CompileFailed { outcome };
                }
                Step::Continue(_) => {}
            }
        }

        if let Err(e) = machine.advance(ExecutionState::Running) {
            return fault(None, e.to_string());
        }
        let spec = PhaseSpec {
            name: Phase::Run.as_str(),
            command: invocation.run,
            environment: profile.environment.clone(),
            limits: profile.run_limits,
            address_space_limit: profile.address_space_limit,
            max_output_bytes: profile.max_output_bytes,
            stdin: request.stdin.clone(),
        };
        match self.run(Phase::Run, handle, spec, cancel, listener) {
            Step::Stop(terminal) => terminal,
            Step::Continue(outcome) => TerminalState::Completed { outcome },
        }
    }

    /// Launch one phase and decide whether the request ends here.
    fn run(
        &self,
        phase: Phase,
        handle: &mut SandboxHandle,
        spec: PhaseSpec,
        cancel: &AtomicBool,
        listener: &dyn PhaseListener,
    ) -> Step {
        listener.phase_started(phase);
        let outcome = match self.runner.run_phase(handle, spec, cancel) {
            Ok(outcome) => outcome,
            Err(e) => return Step::Stop(fault(Some(phase), format!("{} phase: {}", phase.as_str(), e))),
        };
        listener.phase_finished(phase, &outcome);

        if let Some(detail) = outcome.internal_error.clone() {
            return Step::Stop(TerminalState::Crashed {
                phase: Some(phase),
                cause: CrashCause::SandboxFault,
                outcome: Some(outcome),
                detail,
            });
        }
        match outcome.stopped {
            Some(StopReason::WallClock) | Some(StopReason::Cancelled) => {
                return Step::Stop(TerminalState::TimedOut { phase, outcome });
            }
            Some(StopReason::CpuTime) | None => {}
        }
        if outcome.resource_limit_hit() {
            return Step::Stop(TerminalState::Crashed {
                phase: Some(phase),
                cause: CrashCause::ResourceLimitExceeded,
                outcome: Some(outcome),
                detail: format!("{} phase hit a resource limit", phase.as_str()),
            });
        }
        if outcome.exit.is_none() {
            return Step::Stop(TerminalState::Crashed {
                phase: Some(phase),
                cause: CrashCause::SandboxFault,
                outcome: Some(outcome),
                detail: format!("{} phase ended without an exit status", phase.as_str()),
            });
        }
        Step::Continue(outcome)
    }
}

fn fault(phase: Option<Phase>, detail: String) -> TerminalState {
    TerminalState::Crashed {
        phase,
        cause: CrashCause::SandboxFault,
        outcome: None,
        detail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::service::ServiceConfig;
    use crate::config::types::{ExecError, ExitStatus};
    use crate::judge::registry::LanguageRegistry;
    use crate::kernel::cgroup::CgroupEvidence;
    use crate::safety::{IsolationBoundary, IsolationMode};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Hands out pre-baked outcomes in order and records the phases it saw
    struct Scripted {
        outcomes: Mutex<VecDeque<Result<PhaseOutcome>>>,
        seen: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl Scripted {
        fn new(outcomes: Vec<Result<PhaseOutcome>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl PhaseRunner for Scripted {
        fn run_phase(&self, _: &mut SandboxHandle, spec: PhaseSpec, _: &AtomicBool) -> Result<PhaseOutcome> {
            self.seen.lock().unwrap().push((spec.name.to_string(), spec.stdin));
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ExecError::Process("unexpected phase".into())))
        }
    }

    fn exited(code: i32) -> PhaseOutcome {
        PhaseOutcome {
            exit: Some(ExitStatus::Code(code)),
            ..Default::default()
        }
    }

    fn run(lang: &str, outcomes: Vec<Result<PhaseOutcome>>) -> (SupervisedRun, Vec<(String, Vec<u8>)>) {
        let tmp = tempfile::tempdir().unwrap();
        let config = ServiceConfig {
            runtime_root: tmp.path().join("runtime"),
            allow_degraded: true,
            ..Default::default()
        };
        let registry = LanguageRegistry::from_config(&config).unwrap();
        let boundary = IsolationBoundary::with_mode(IsolationMode::Degraded, &config).unwrap();
        let mut handle = boundary.acquire().unwrap();

        let supervisor = ExecutionSupervisor::new(Scripted::new(outcomes));
        let request = ExecutionRequest::new(lang, "source", "stdin", "tester");
        let profile = registry.lookup(lang).unwrap();
        let cancel = AtomicBool::new(false);
        let result = supervisor.execute(&mut handle, profile, &request, &cancel, &());
        handle.release().unwrap();
        let seen = supervisor.runner().seen.lock().unwrap().clone();
        (result, seen)
    }

    #[test]
    fn interpreted_language_skips_compile() {
        let (result, seen) = run("python", vec![Ok(exited(0))]);
        assert!(matches!(result.terminal, TerminalState::Completed { .. }));
        assert_eq!(
            result.path,
            vec![ExecutionState::Pending, ExecutionState::Running, ExecutionState::Completed]
        );
        assert_eq!(seen, vec![("run".to_string(), b"stdin".to_vec())]);
    }

    #[test]
    fn compile_failure_short_circuits() {
        let (result, seen) = run("c", vec![Ok(exited(1))]);
        assert!(matches!(result.terminal, TerminalState::CompileFailed { .. }));
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "compile");
        assert!(seen[0].1.is_empty());
    }

    #[test]
    fn compiled_language_runs_both_phases() {
        let (result, seen) = run("cpp", vec![Ok(exited(0)), Ok(exited(3))]);
        assert!(matches!(result.terminal, TerminalState::Completed { .. }));
        assert_eq!(seen.len(), 2);
        assert_eq!(result.path.last(), Some(&ExecutionState::Completed));
    }

    #[test]
    fn compile_timeout_is_timed_out() {
        let slow = PhaseOutcome {
            stopped: Some(StopReason::WallClock),
            exit: Some(ExitStatus::Signal(libc::SIGKILL)),
            ..Default::default()
        };
        let (result, _) = run("c", vec![Ok(slow)]);
        assert!(matches!(
            result.terminal,
            TerminalState::TimedOut { phase: Phase::Compile, .. }
        ));
    }

    #[test]
    fn memory_breach_is_resource_crash() {
        let oom = PhaseOutcome {
            exit: Some(ExitStatus::Signal(libc::SIGKILL)),
            evidence: CgroupEvidence {
                oom_kill_events: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        let (result, _) = run("python", vec![Ok(oom)]);
        assert!(matches!(
            result.terminal,
            TerminalState::Crashed { cause: CrashCause::ResourceLimitExceeded, .. }
        ));
    }

    #[test]
    fn launcher_error_is_sandbox_fault() {
        let (result, _) = run("python", vec![Err(ExecError::Cgroup("gone".into()))]);
        assert!(result.terminal.is_sandbox_fault());
        assert_eq!(result.path.last(), Some(&ExecutionState::Crashed));
    }

    #[test]
    fn cancellation_ends_as_timed_out() {
        let cancelled = PhaseOutcome {
            stopped: Some(StopReason::Cancelled),
            ..Default::default()
        };
        let (result, _) = run("python", vec![Ok(cancelled)]);
        assert_eq!(result.terminal.state(), ExecutionState::TimedOut);
    }
}
