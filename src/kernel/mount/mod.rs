//! Filesystem isolation and mount management

pub mod filesystem;

pub use filesystem::*;
