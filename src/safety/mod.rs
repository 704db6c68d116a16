//! Sandbox lifecycle safety: the isolation boundary, its resource ledger and
//! symlink-safe teardown.

pub mod boundary;
pub mod cleanup;
pub mod safe_cleanup;

pub use boundary::{IsolationBoundary, IsolationMode, PhaseSpec, SandboxHandle};
