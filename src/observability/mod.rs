//! Observability
//!
//! Structured audit events and metrics for operational visibility.

pub mod audit;
pub mod metrics;

pub use audit::{AuditContext, AuditEvent, AuditEventKind, AuditSink, AuditTrail, JsonlFileSink, LogSink, MemorySink};
pub use metrics::MetricsRegistry;
