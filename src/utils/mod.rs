//! Process hygiene helpers used on the payload side of the fork
pub mod env_hygiene;
pub mod fd_closure;
