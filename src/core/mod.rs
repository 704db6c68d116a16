//! Language-agnostic sandbox core.
//!
//! Core owns the process model (supervisor -> proxy -> payload), the wire
//! types exchanged between them, and forced termination. Language-specific
//! command lines come from judge adapters.

pub mod proxy;
pub mod supervisor;
pub mod types;
