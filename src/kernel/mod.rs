//! Thin wrappers around Linux kernel primitives.
//!
//! All `unsafe` code is concentrated here with explicit SAFETY comments.

pub mod capabilities;
pub mod cgroup;
pub mod credentials;
pub mod mount;
pub mod namespace;
pub mod seccomp;
