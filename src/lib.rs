//! execbox: run untrusted source code under kernel-enforced isolation.
//!
//! A request flows through admission control, a per-request isolation
//! boundary, a supervised compile/run state machine and a result normalizer.
//!
//! # Layout
//!
//! ## Kernel primitives ([`kernel`])
//! - [`kernel::namespace`]: PID, mount, IPC, UTS and network namespaces
//! - [`kernel::cgroup`]: cgroup v2 limits, accounting and kill
//! - [`kernel::mount`]: sandbox root assembly and `pivot_root`
//! - [`kernel::credentials`] / [`kernel::capabilities`]: privilege drop
//! - [`kernel::seccomp`]: deny-list syscall filter
//!
//! ## Process model ([`core`], [`exec`])
//! - [`core::supervisor`]: launches the proxy and enforces the wall clock
//! - [`core::proxy`]: forks the payload, captures bounded output, reaps
//! - [`exec::preexec`]: type-state ordered setup inside the payload
//!
//! ## Request pipeline
//! - [`judge`]: language profiles and registry
//! - [`admission`]: global and per-caller concurrency caps
//! - [`safety`]: isolation boundary, sandbox handles and cleanup ledger
//! - [`verdict`]: execution state machine and result normalizer
//! - [`service`]: the pipeline itself
//! - [`server`]: HTTP surface
//! - [`observability`]: audit trail and metrics
//!
//! # Design principles
//!
//! 1. **Kernel as the boundary**: limits are enforced by namespaces, cgroups,
//!    rlimits and seccomp, never by trusting the submitted code
//! 2. **Scoped ownership**: tickets and sandbox handles release on drop
//! 3. **Types prevent misordering**: the pre-exec chain cannot be reordered
//! 4. **Honest results**: `success` says whether the sandbox worked

pub mod admission;
pub mod cli;
pub mod config;
pub mod core;
pub mod exec;
pub mod judge;
pub mod kernel;
pub mod observability;
pub mod safety;
pub mod server;
pub mod service;
pub mod utils;
pub mod verdict;

pub use config::types::*;
