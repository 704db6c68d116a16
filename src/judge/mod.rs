//! Language adapters and the profile registry.
//!
//! The sandbox core stays language-agnostic. Adapters define compile/run command
//! templates and limit envelopes; the registry resolves them once at startup.

pub mod adapter;
pub mod languages;
pub mod registry;

pub use registry::{Invocation, LanguageProfile, LanguageRegistry, UnsupportedLanguage};
