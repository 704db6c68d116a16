//! Service configuration.
//!
//! Enumerated once at startup (defaults, then an optional JSON file, then
//! `EXECBOX_*` environment variables) and shared read-only afterwards.

use crate::config::types::{ExecError, PhaseLimits, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Per-language overrides. Unset fields keep the adapter's values.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LanguageOverride {
    pub cpu_time_ms: Option<u64>,
    pub wall_time_ms: Option<u64>,
    pub memory_bytes: Option<u64>,
    pub max_processes: Option<u32>,
    pub compile_wall_time_ms: Option<u64>,
    pub max_output_bytes: Option<usize>,
    pub enabled: Option<bool>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Host-wide concurrent execution cap (G)
    pub global_limit: usize,
    /// Concurrent execution cap per caller id (P)
    pub per_caller_limit: usize,
    pub admission_timeout_ms: u64,
    pub max_queue_depth: usize,
    pub max_source_bytes: usize,
    pub max_stdin_bytes: usize,
    pub max_output_bytes: usize,
    pub compile_wall_time_ms: u64,
    /// Run-phase limits applied when a language has no stricter default
    pub default_limits: PhaseLimits,
    pub languages: HashMap<String, LanguageOverride>,
    pub strict_mode: bool,
    pub allow_degraded: bool,
    pub runtime_root: PathBuf,
    pub cgroup_root: PathBuf,
    pub sandbox_uid: u32,
    pub sandbox_gid: u32,
    pub scratch_size_bytes: u64,
    pub audit_log_path: Option<PathBuf>,
    pub bind_addr: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            global_limit: parallelism.max(1),
            per_caller_limit: 2.min(parallelism.max(1)),
            admission_timeout_ms: 5_000,
            max_queue_depth: 64,
            max_source_bytes: 64 * 1024,
            max_stdin_bytes: 1024 * 1024,
            max_output_bytes: 64 * 1024,
            compile_wall_time_ms: 15_000,
            default_limits: PhaseLimits::default(),
            languages: HashMap::new(),
            strict_mode: true,
            allow_degraded: false,
            runtime_root: Self::default_runtime_root(),
            cgroup_root: PathBuf::from("/sys/fs/cgroup/execbox"),
            sandbox_uid: 65534,
            sandbox_gid: 65534,
            scratch_size_bytes: 64 * 1024 * 1024,
            audit_log_path: None,
            bind_addr: "127.0.0.1:8080".to_string(),
        }
    }
}

impl ServiceConfig {
    /// Per-euid runtime directory so concurrent users never share scratch trees.
    pub fn default_runtime_root() -> PathBuf {
        let euid = nix::unistd::geteuid().as_raw();
        std::env::temp_dir().join(format!("execbox-uid-{}", euid))
    }

    pub fn admission_timeout(&self) -> Duration {
        Duration::from_millis(self.admission_timeout_ms)
    }

    /// Defaults, then `path` (if any), then environment overrides, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ExecError::Config(format!("cannot read config {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            ExecError::Config(format!("invalid config {}: {}", path.display(), e))
        })
    }

    /// Apply `EXECBOX_*` overrides. `lookup` abstracts the environment for tests.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
            raw.trim()
                .parse::<T>()
                .map_err(|_| ExecError::Config(format!("{} has invalid value '{}'", key, raw)))
        }
        fn parse_bool(key: &str, raw: &str) -> Result<bool> {
            match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ExecError::Config(format!("{} has invalid value '{}'", key, raw))),
            }
        }

        if let Some(v) = lookup("EXECBOX_GLOBAL_LIMIT") {
            self.global_limit = parse("EXECBOX_GLOBAL_LIMIT", &v)?;
        }
        if let Some(v) = lookup("EXECBOX_PER_CALLER_LIMIT") {
            self.per_caller_limit = parse("EXECBOX_PER_CALLER_LIMIT", &v)?;
        }
        if let Some(v) = lookup("EXECBOX_ADMISSION_TIMEOUT_MS") {
            self.admission_timeout_ms = parse("EXECBOX_ADMISSION_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("EXECBOX_MAX_QUEUE_DEPTH") {
            self.max_queue_depth = parse("EXECBOX_MAX_QUEUE_DEPTH", &v)?;
        }
        if let Some(v) = lookup("EXECBOX_MAX_SOURCE_BYTES") {
            self.max_source_bytes = parse("EXECBOX_MAX_SOURCE_BYTES", &v)?;
        }
        if let Some(v) = lookup("EXECBOX_MAX_STDIN_BYTES") {
            self.max_stdin_bytes = parse("EXECBOX_MAX_STDIN_BYTES", &v)?;
        }
        if let Some(v) = lookup("EXECBOX_MAX_OUTPUT_BYTES") {
            self.max_output_bytes = parse("EXECBOX_MAX_OUTPUT_BYTES", &v)?;
        }
        if let Some(v) = lookup("EXECBOX_STRICT") {
            self.strict_mode = parse_bool("EXECBOX_STRICT", &v)?;
        }
        if let Some(v) = lookup("EXECBOX_ALLOW_DEGRADED") {
            self.allow_degraded = parse_bool("EXECBOX_ALLOW_DEGRADED", &v)?;
        }
        if let Some(v) = lookup("EXECBOX_BIND") {
            self.bind_addr = v;
        }
        if let Some(v) = lookup("EXECBOX_AUDIT_LOG") {
            self.audit_log_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("EXECBOX_RUNTIME_ROOT") {
            self.runtime_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("EXECBOX_CGROUP_ROOT") {
            self.cgroup_root = PathBuf::from(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.global_limit == 0 {
            return Err(ExecError::Config("global_limit must be at least 1".into()));
        }
        if self.per_caller_limit == 0 {
            return Err(ExecError::Config("per_caller_limit must be at least 1".into()));
        }
        if self.per_caller_limit > self.global_limit {
            return Err(ExecError::Config(format!(
                "per_caller_limit ({}) exceeds global_limit ({})",
                self.per_caller_limit, self.global_limit
            )));
        }
        if self.max_source_bytes == 0 || self.max_output_bytes == 0 {
            return Err(ExecError::Config("size bounds must be non-zero".into()));
        }
        let limits = &self.default_limits;
        if limits.cpu_time_ms == 0
            || limits.wall_time_ms == 0
            || limits.memory_bytes == 0
            || limits.max_processes == 0
        {
            return Err(ExecError::Config("default_limits must be non-zero".into()));
        }
        if self.compile_wall_time_ms == 0 {
            return Err(ExecError::Config("compile_wall_time_ms must be non-zero".into()));
        }
        if self.strict_mode && (self.sandbox_uid == 0 || self.sandbox_gid == 0) {
            return Err(ExecError::Config(
                "sandbox uid/gid must not be 0 in strict mode".into(),
            ));
        }
        for (id, ov) in &self.languages {
            if ov.wall_time_ms == Some(0) || ov.cpu_time_ms == Some(0) || ov.memory_bytes == Some(0)
            {
                return Err(ExecError::Config(format!(
                    "language override '{}' has a zero limit",
                    id
                )));
            }
        }
        Ok(())
    }
}
