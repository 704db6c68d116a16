//! Request pipeline: size checks, language lookup, admission, sandbox,
//! supervision, normalization. Audit events and metrics are emitted at each
//! stage.
//!
//! The admission ticket and the sandbox handle are both scoped to
//! [`ExecutionService::run`]: they are released explicitly on the normal
//! path and by their `Drop` impls on every other one, including panics.
use crate::admission::{AdmissionController, AdmissionError, AdmissionLimits, AdmissionSnapshot};
use crate::config::service::ServiceConfig;
use crate::config::types::{ErrorKind, ExecutionRequest, ExecutionResult, Result};
use crate::core::supervisor::ProxyLauncher;
use crate::core::types::PhaseOutcome;
use crate::judge::registry::{LanguageProfile, LanguageRegistry};
use crate::observability::audit::{
    AuditContext, AuditEventKind, AuditTrail, JsonlFileSink, LogSink,
};
use crate::observability::metrics::{Gauge, MetricsRegistry};
use crate::safety::{IsolationBoundary, IsolationMode};
use crate::verdict::{
    outcome_class, CrashCause, ExecutionSupervisor, Phase, PhaseListener, PhaseRunner,
    ResultNormalizer, TerminalState,
};
use log::{debug, error, info};
use serde::Serialize;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

/// Admission-time refusals. These replace a result rather than travel in one.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("{what} exceeds {limit} bytes")]
    InputTooLarge { what: &'static str, limit: usize },
    #[error("service overloaded, retry later")]
    Overloaded,
}

impl Rejection {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Rejection::UnsupportedLanguage(_) => ErrorKind::UnsupportedLanguage,
            Rejection::InputTooLarge { .. } => ErrorKind::InputTooLarge,
            Rejection::Overloaded => ErrorKind::Overloaded,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub mode: IsolationMode,
    pub in_flight: usize,
    pub queued: usize,
    pub live_sandboxes: u64,
    pub sandboxes_created: u64,
    pub sandboxes_destroyed: u64,
    pub tickets_issued: u64,
    pub tickets_released: u64,
}

/// What the HTTP layer needs from the service
pub trait Executor: Send + Sync + 'static {
    fn execute(
        &self,
        request: ExecutionRequest,
        caller_role: Option<String>,
        cancel: &AtomicBool,
    ) -> std::result::Result<ExecutionResult, Rejection>;

    fn health(&self) -> ServiceHealth;

    fn metrics_text(&self) -> String;

    /// Largest request body the HTTP layer buffers before decoding.
    fn request_body_limit(&self) -> usize {
        DEFAULT_BODY_LIMIT
    }
}

/// axum's own default
pub const DEFAULT_BODY_LIMIT: usize = 2 * 1024 * 1024;

/// JSON escaping can grow a byte to six (`\u0000`); the rest covers field names.
const JSON_ESCAPE_FACTOR: usize = 6;
const BODY_OVERHEAD: usize = 4096;

pub struct ExecutionService<R: PhaseRunner = ProxyLauncher> {
    config: Arc<ServiceConfig>,
    registry: LanguageRegistry,
    admission: AdmissionController,
    boundary: IsolationBoundary,
    supervisor: ExecutionSupervisor<R>,
    audit: AuditTrail,
    metrics: MetricsRegistry,
}

impl ExecutionService<ProxyLauncher> {
    /// Production wiring: re-exec this binary as the proxy, log sink plus the
    /// optional JSONL audit file.
    pub fn from_config(config: Arc<ServiceConfig>) -> Result<Self> {
        let boundary = IsolationBoundary::from_config(&config)?;
        let launcher = ProxyLauncher::current_exe()?;

        let mut audit = AuditTrail::new().with_sink(Arc::new(LogSink));
        if let Some(path) = &config.audit_log_path {
            audit = audit.with_sink(Arc::new(JsonlFileSink::open(path)?));
        }

        Self::with_parts(config, boundary, launcher, audit)
    }
}

impl<R: PhaseRunner> ExecutionService<R> {
    pub fn with_parts(
        config: Arc<ServiceConfig>,
        boundary: IsolationBoundary,
        runner: R,
        audit: AuditTrail,
    ) -> Result<Self> {
        let registry = LanguageRegistry::from_config(&config)?;
        let admission = AdmissionController::new(AdmissionLimits::from_config(&config));
        info!(
            "Execution service ready: mode={:?} G={} P={} languages={}",
            boundary.mode(),
            config.global_limit,
            config.per_caller_limit,
            registry.languages().map(|p| p.id.as_str()).collect::<Vec<_>>().join(",")
        );
        Ok(Self {
            config,
            registry,
            admission,
            boundary,
            supervisor: ExecutionSupervisor::new(runner),
            audit,
            metrics: MetricsRegistry::new(),
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn registry(&self) -> &LanguageRegistry {
        &self.registry
    }

    pub fn boundary(&self) -> &IsolationBoundary {
        &self.boundary
    }

    pub fn admission_snapshot(&self) -> AdmissionSnapshot {
        self.admission.snapshot()
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    pub fn run(
        &self,
        request: ExecutionRequest,
        caller_role: Option<String>,
        cancel: &AtomicBool,
    ) -> std::result::Result<ExecutionResult, Rejection> {
        self.metrics.requests_total.inc();
        let run_id = Uuid::new_v4().to_string();
        let ctx = AuditContext::new(&run_id, &request.caller_id, &request.language, &request.source)
            .with_role(caller_role);

        let profile = match self.check(&request) {
            Ok(profile) => profile,
            Err(rejection) => return Err(self.reject(&ctx, rejection)),
        };

        let waiting = Instant::now();
        let ticket = match self.admission.admit(&request.caller_id, Some(cancel)) {
            Ok(ticket) => ticket,
            Err(e) => {
                self.refresh_gauges();
                let rejection = match e {
                    AdmissionError::QueueFull { .. }
                    | AdmissionError::Timeout { .. }
                    | AdmissionError::Cancelled => Rejection::Overloaded,
                };
                return Err(self.reject(&ctx, rejection));
            }
        };
        self.metrics.admission_wait.observe(waiting.elapsed());
        self.audit.record(ctx.event(AuditEventKind::Admitted));
        let _in_flight = InFlight::enter(&self.metrics.in_flight);
        self.refresh_gauges();

        let started = Instant::now();
        let terminal = self.supervise(&ctx, profile, &request, cancel);
        let duration = started.elapsed();

        let result = ResultNormalizer::normalize(&run_id, &terminal, duration);
        self.record_terminal(&ctx, &terminal, &result, duration);

        ticket.release();
        self.audit.record(
            ctx.event(AuditEventKind::Released)
                .with_outcome(outcome_class(&result))
                .with_duration(duration),
        );
        self.refresh_gauges();
        Ok(result)
    }

    /// Everything rejected here is rejected before any resource is allocated.
    fn check(&self, request: &ExecutionRequest) -> std::result::Result<&LanguageProfile, Rejection> {
        if request.source.len() > self.config.max_source_bytes {
            return Err(Rejection::InputTooLarge {
                what: "source",
                limit: self.config.max_source_bytes,
            });
        }
        if request.stdin.len() > self.config.max_stdin_bytes {
            return Err(Rejection::InputTooLarge {
                what: "stdin",
                limit: self.config.max_stdin_bytes,
            });
        }
        self.registry
            .lookup(&request.language)
            .map_err(|e| Rejection::UnsupportedLanguage(e.0))
    }

    fn reject(&self, ctx: &AuditContext, rejection: Rejection) -> Rejection {
        self.metrics.record_outcome(&rejection.kind().to_string());
        self.audit.record(
            ctx.event(AuditEventKind::Rejected)
                .with_outcome(rejection.kind().to_string())
                .with_detail(rejection.to_string()),
        );
        rejection
    }

    /// Acquire, drive, release. The handle never outlives this call.
    fn supervise(
        &self,
        ctx: &AuditContext,
        profile: &LanguageProfile,
        request: &ExecutionRequest,
        cancel: &AtomicBool,
    ) -> TerminalState {
        let mut handle = match self.boundary.acquire() {
            Ok(handle) => handle,
            Err(e) => {
                return TerminalState::Crashed {
                    phase: None,
                    cause: CrashCause::SandboxFault,
                    outcome: None,
                    detail: format!("acquire: {}", e),
                }
            }
        };
        debug!("[{}] sandbox {} acquired", ctx.run_id, handle.id());

        let listener = AuditListener {
            audit: &self.audit,
            ctx,
        };
        let run = self.supervisor.execute(&mut handle, profile, request, cancel, &listener);

        match handle.release() {
            Ok(()) => run.terminal,
            Err(e) => TerminalState::Crashed {
                phase: None,
                cause: CrashCause::SandboxFault,
                outcome: run.terminal.outcome().cloned(),
                detail: format!("teardown: {}", e),
            },
        }
    }

    fn record_terminal(
        &self,
        ctx: &AuditContext,
        terminal: &TerminalState,
        result: &ExecutionResult,
        duration: Duration,
    ) {
        let class = outcome_class(result);
        self.metrics.record_outcome(class);
        self.metrics.execution_duration.observe(duration);

        let event = match terminal {
            TerminalState::TimedOut { phase, .. } => Some(
                ctx.event(AuditEventKind::TimedOut)
                    .with_detail(format!("{} phase", phase.as_str())),
            ),
            TerminalState::Crashed {
                cause: CrashCause::ResourceLimitExceeded,
                detail,
                ..
            } => Some(ctx.event(AuditEventKind::ResourceBreach).with_detail(detail.clone())),
            TerminalState::Crashed {
                cause: CrashCause::SandboxFault,
                detail,
                ..
            } => {
                error!("[{}] sandbox fault: {}", ctx.run_id, detail);
                Some(ctx.event(AuditEventKind::SandboxFault).with_detail(detail.clone()))
            }
            _ => None,
        };
        if let Some(event) = event {
            self.audit.record(event.with_outcome(class).with_duration(duration));
        }
    }

    fn refresh_gauges(&self) {
        let snapshot = self.admission.snapshot();
        self.metrics.queued_waiters.set(snapshot.queued as u64);
        self.metrics.live_sandboxes.set(self.boundary.live());
    }
}

impl<R: PhaseRunner + 'static> Executor for ExecutionService<R> {
    fn execute(
        &self,
        request: ExecutionRequest,
        caller_role: Option<String>,
        cancel: &AtomicBool,
    ) -> std::result::Result<ExecutionResult, Rejection> {
        self.run(request, caller_role, cancel)
    }

    fn health(&self) -> ServiceHealth {
        let snapshot = self.admission.snapshot();
        ServiceHealth {
            mode: self.boundary.mode(),
            in_flight: snapshot.in_use,
            queued: snapshot.queued,
            live_sandboxes: self.boundary.live(),
            sandboxes_created: self.boundary.created(),
            sandboxes_destroyed: self.boundary.destroyed(),
            tickets_issued: snapshot.issued,
            tickets_released: snapshot.released,
        }
    }

    fn metrics_text(&self) -> String {
        self.refresh_gauges();
        self.metrics.export_prometheus()
    }

    fn request_body_limit(&self) -> usize {
        self.config
            .max_source_bytes
            .saturating_add(self.config.max_stdin_bytes)
            .saturating_mul(JSON_ESCAPE_FACTOR)
            .saturating_add(BODY_OVERHEAD)
    }
}

/// Keeps the in-flight gauge honest on every exit path
struct InFlight<'a>(&'a Gauge);

impl<'a> InFlight<'a> {
    fn enter(gauge: &'a Gauge) -> Self {
        gauge.inc();
        Self(gauge)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.dec();
    }
}

struct AuditListener<'a> {
    audit: &'a AuditTrail,
    ctx: &'a AuditContext,
}

impl PhaseListener for AuditListener<'_> {
    fn phase_started(&self, phase: Phase) {
        let kind = match phase {
            Phase::Compile => AuditEventKind::CompileStarted,
            Phase::Run => AuditEventKind::RunStarted,
        };
        self.audit.record(self.ctx.event(kind));
    }

    fn phase_finished(&self, phase: Phase, outcome: &PhaseOutcome) {
        let kind = match phase {
            Phase::Compile => AuditEventKind::CompileFinished,
            Phase::Run => AuditEventKind::RunFinished,
        };
        let summary = match outcome.exit {
            Some(exit) => format!("{:?}", exit),
            None => "no exit".to_string(),
        };
        self.audit
            .record(self.ctx.event(kind).with_outcome(summary).with_duration(outcome.wall_time));
    }
}
