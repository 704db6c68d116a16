//! Structured audit trail for execution lifecycle events.
//!
//! Every event carries the run id, caller, language and a SHA-256 digest of
//! the submitted source. The source text and stdin themselves are never
//! recorded.
use crate::config::types::{ExecError, Result};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    Admitted,
    Rejected,
    CompileStarted,
    CompileFinished,
    RunStarted,
    RunFinished,
    TimedOut,
    ResourceBreach,
    SandboxFault,
    Released,
}

impl AuditEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditEventKind::Admitted => "admitted",
            AuditEventKind::Rejected => "rejected",
            AuditEventKind::CompileStarted => "compile_started",
            AuditEventKind::CompileFinished => "compile_finished",
            AuditEventKind::RunStarted => "run_started",
            AuditEventKind::RunFinished => "run_finished",
            AuditEventKind::TimedOut => "timed_out",
            AuditEventKind::ResourceBreach => "resource_breach",
            AuditEventKind::SandboxFault => "sandbox_fault",
            AuditEventKind::Released => "released",
        }
    }
}

/// Identity of one request, shared by all of its events
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditContext {
    pub run_id: String,
    pub caller_id: String,
    pub caller_role: Option<String>,
    pub language: String,
    pub source_sha256: String,
}

impl AuditContext {
    pub fn new(run_id: &str, caller_id: &str, language: &str, source: &[u8]) -> Self {
        Self {
            run_id: run_id.to_string(),
            caller_id: caller_id.to_string(),
            caller_role: None,
            language: language.to_string(),
            source_sha256: source_digest(source),
        }
    }

    pub fn with_role(mut self, role: Option<String>) -> Self {
        self.caller_role = role;
        self
    }

    pub fn event(&self, kind: AuditEventKind) -> AuditEvent {
        AuditEvent {
            timestamp: Utc::now(),
            kind,
            context: self.clone(),
            duration_ms: None,
            outcome: None,
            detail: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: AuditEventKind,
    #[serde(flatten)]
    pub context: AuditContext,
    pub duration_ms: Option<u64>,
    pub outcome: Option<String>,
    /// Operator-facing note; may contain host detail, so never sent to callers
    pub detail: Option<String>,
}

impl AuditEvent {
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = Some(duration.as_millis().min(u64::MAX as u128) as u64);
        self
    }

    pub fn with_outcome(mut self, outcome: impl Into<String>) -> Self {
        self.outcome = Some(outcome.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// One-line JSON document with an RFC 3339 timestamp
    pub fn to_json_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!("{{\"kind\":\"{}\",\"error\":\"{}\"}}", self.kind.as_str(), e)
        })
    }
}

pub fn source_digest(source: &[u8]) -> String {
    let digest = Sha256::digest(source);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent);
}

/// Writes events through the `log` facade. Faults go to the error channel.
#[derive(Debug, Default)]
pub struct LogSink;

impl AuditSink for LogSink {
    fn record(&self, event: &AuditEvent) {
        let ctx = &event.context;
        match event.kind {
            AuditEventKind::SandboxFault => error!(
                target: "execbox::audit",
                "[{}] sandbox fault caller={} lang={} detail={}",
                ctx.run_id,
                ctx.caller_id,
                ctx.language,
                event.detail.as_deref().unwrap_or("-")
            ),
            AuditEventKind::Rejected | AuditEventKind::ResourceBreach | AuditEventKind::TimedOut => warn!(
                target: "execbox::audit",
                "[{}] {} caller={} lang={} outcome={}",
                ctx.run_id,
                event.kind.as_str(),
                ctx.caller_id,
                ctx.language,
                event.outcome.as_deref().unwrap_or("-")
            ),
            _ => info!(
                target: "execbox::audit",
                "[{}] {} caller={} lang={} sha256={}",
                ctx.run_id,
                event.kind.as_str(),
                ctx.caller_id,
                ctx.language,
                ctx.source_sha256
            ),
        }
    }
}

/// Appends one JSON document per line
#[derive(Debug)]
pub struct JsonlFileSink {
    file: Mutex<File>,
    path: PathBuf,
}

impl JsonlFileSink {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ExecError::Config(format!("Failed to create audit log directory: {}", e)))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| ExecError::Config(format!("Failed to open audit log {}: {}", path.display(), e)))?;
        Ok(Self {
            file: Mutex::new(file),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for JsonlFileSink {
    fn record(&self, event: &AuditEvent) {
        let line = event.to_json_line();
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = writeln!(file, "{}", line) {
            warn!("Failed to write audit event to {}: {}", self.path.display(), e);
        }
    }
}

/// Keeps events in memory, for inspection in tests
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn kinds(&self) -> Vec<AuditEventKind> {
        self.events().iter().map(|e| e.kind).collect()
    }
}

impl AuditSink for MemorySink {
    fn record(&self, event: &AuditEvent) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).push(event.clone());
    }
}

/// Fans each event out to every configured sink
#[derive(Clone, Default)]
pub struct AuditTrail {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl AuditTrail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn record(&self, event: AuditEvent) {
        for sink in &self.sinks {
            sink.record(&event);
        }
    }
}

impl std::fmt::Debug for AuditTrail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditTrail").field("sinks", &self.sinks.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_hex_sha256() {
        assert_eq!(
            source_digest(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn json_line_has_rfc3339_and_no_source() {
        let ctx = AuditContext::new("run-1", "alice", "python", b"print('secret')");
        let line = ctx
            .event(AuditEventKind::RunFinished)
            .with_duration(Duration::from_millis(42))
            .with_outcome("ok")
            .to_json_line();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["kind"], "run_finished");
        assert_eq!(value["caller_id"], "alice");
        assert_eq!(value["duration_ms"], 42);
        assert!(chrono::DateTime::parse_from_rfc3339(value["timestamp"].as_str().unwrap()).is_ok());
        assert!(!line.contains("secret"));
    }

    #[test]
    fn jsonl_sink_appends_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("audit/events.jsonl");
        let sink = JsonlFileSink::open(&path).unwrap();
        let ctx = AuditContext::new("run-2", "bob", "c", b"int main(){}");
        sink.record(&ctx.event(AuditEventKind::Admitted));
        sink.record(&ctx.event(AuditEventKind::Released));

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("\"released\""));
    }

    #[test]
    fn trail_fans_out() {
        let a = Arc::new(MemorySink::new());
        let b = Arc::new(MemorySink::new());
        let trail = AuditTrail::new().with_sink(a.clone()).with_sink(b.clone());
        let ctx = AuditContext::new("run-3", "carol", "java", b"");
        trail.record(ctx.event(AuditEventKind::Rejected));
        assert_eq!(a.kinds(), vec![AuditEventKind::Rejected]);
        assert_eq!(b.events().len(), 1);
    }
}
