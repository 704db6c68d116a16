//! Payload-side setup with type-state enforced ordering.

pub mod preexec;
