//! Execution service: the request pipeline shared by the HTTP server and the CLI.

pub mod execution;

pub use execution::{ExecutionService, Executor, Rejection, ServiceHealth};
