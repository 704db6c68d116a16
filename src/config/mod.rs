//! Configuration
//!
//! Shared type definitions and the startup-time service configuration.

pub mod service;
pub mod types;
