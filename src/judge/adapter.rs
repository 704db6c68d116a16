use crate::config::types::PhaseLimits;

/// How the submitted source is named on disk and how the entry point is derived.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EntryRule {
    /// Fixed file name and entry point
    Fixed {
        file_name: &'static str,
        main: &'static str,
    },
    /// File and entry point named after the first `public class` (Java)
    PublicClass { fallback: &'static str },
}

/// Language adapter contract for compile/run stages.
///
/// Command templates may contain `{source}` (the source file name) and `{main}`
/// (the entry point). Paths are relative to the sandbox work directory.
pub trait JudgeAdapter: Send + Sync {
    fn language(&self) -> &'static str;

    fn aliases(&self) -> &'static [&'static str] {
        &[]
    }

    /// Toolchain reference reported to callers and in audit records
    fn toolchain(&self) -> &'static str;

    fn entry_rule(&self) -> EntryRule;

    /// `None` for interpreted languages
    fn compile_command(&self) -> Option<Vec<String>>;

    fn run_command(&self) -> Vec<String>;

    /// Compile-phase limits derived from the service compile wall clock
    fn compile_limits(&self, wall_time_ms: u64) -> PhaseLimits {
        PhaseLimits {
            cpu_time_ms: wall_time_ms,
            wall_time_ms,
            memory_bytes: 512 * 1024 * 1024,
            max_processes: 64,
        }
    }

    /// Run-phase limits derived from the service defaults
    fn run_limits(&self, defaults: &PhaseLimits) -> PhaseLimits {
        *defaults
    }

    /// Extra environment on top of the sanitized base set
    fn environment(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// JVM and V8 reserve far more address space than they touch; those runtimes
    /// rely on the cgroup memory cap alone.
    fn address_space_limit(&self) -> bool {
        true
    }
}

pub(crate) fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}
