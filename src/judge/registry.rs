use crate::config::service::{LanguageOverride, ServiceConfig};
use crate::config::types::{ExecError, PhaseLimits, Result};
use crate::judge::adapter::{EntryRule, JudgeAdapter};
use crate::judge::languages::{
    c::CAdapter, cpp::CppAdapter, java::detect_class_name, java::JavaAdapter,
    javascript::JavaScriptAdapter, python::PythonAdapter,
};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unsupported language: {0}")]
pub struct UnsupportedLanguage(pub String);

pub fn builtin_adapters() -> Vec<Box<dyn JudgeAdapter>> {
    vec![
        Box::new(PythonAdapter),
        Box::new(JavaScriptAdapter),
        Box::new(CAdapter),
        Box::new(CppAdapter),
        Box::new(JavaAdapter),
    ]
}

/// Resolved, immutable description of one language.
#[derive(Clone, Debug, Serialize)]
pub struct LanguageProfile {
    pub id: String,
    pub aliases: Vec<String>,
    pub toolchain: String,
    #[serde(skip)]
    pub entry: EntryRule,
    pub compile_command: Option<Vec<String>>,
    pub run_command: Vec<String>,
    pub compile_limits: PhaseLimits,
    pub run_limits: PhaseLimits,
    pub max_output_bytes: usize,
    #[serde(skip)]
    pub environment: Vec<(String, String)>,
    pub address_space_limit: bool,
}

/// Concrete file name and argv for one submission
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invocation {
    pub source_file: String,
    pub compile: Option<Vec<String>>,
    pub run: Vec<String>,
}

impl LanguageProfile {
    pub fn cpu_time_limit(&self) -> Duration {
        self.run_limits.cpu_time()
    }

    pub fn wall_time_limit(&self) -> Duration {
        self.run_limits.wall_time()
    }

    pub fn memory_limit(&self) -> u64 {
        self.run_limits.memory_bytes
    }

    pub fn is_compiled(&self) -> bool {
        self.compile_command.is_some()
    }

    /// Substitute the source file name and entry point into the command templates.
    pub fn prepare(&self, source: &[u8]) -> Invocation {
        let (source_file, main) = match &self.entry {
            EntryRule::Fixed { file_name, main } => (file_name.to_string(), main.to_string()),
            EntryRule::PublicClass { fallback } => {
                let text = String::from_utf8_lossy(source);
                let class = detect_class_name(&text).unwrap_or_else(|| fallback.to_string());
                (format!("{}.java", class), class)
            }
        };
        let render = |template: &[String]| -> Vec<String> {
            template
                .iter()
                .map(|arg| arg.replace("{source}", &source_file).replace("{main}", &main))
                .collect()
        };
        Invocation {
            compile: self.compile_command.as_deref().map(render),
            run: render(&self.run_command),
            source_file,
        }
    }

    fn from_adapter(adapter: &dyn JudgeAdapter, config: &ServiceConfig) -> Self {
        Self {
            id: adapter.language().to_string(),
            aliases: adapter.aliases().iter().map(|a| a.to_string()).collect(),
            toolchain: adapter.toolchain().to_string(),
            entry: adapter.entry_rule(),
            compile_command: adapter.compile_command(),
            run_command: adapter.run_command(),
            compile_limits: adapter.compile_limits(config.compile_wall_time_ms),
            run_limits: adapter.run_limits(&config.default_limits),
            max_output_bytes: config.max_output_bytes,
            environment: adapter.environment(),
            address_space_limit: adapter.address_space_limit(),
        }
    }

    fn apply_override(&mut self, ov: &LanguageOverride) {
        if let Some(v) = ov.cpu_time_ms {
            self.run_limits.cpu_time_ms = v;
        }
        if let Some(v) = ov.wall_time_ms {
            self.run_limits.wall_time_ms = v;
        }
        if let Some(v) = ov.memory_bytes {
            self.run_limits.memory_bytes = v;
        }
        if let Some(v) = ov.max_processes {
            self.run_limits.max_processes = v;
        }
        if let Some(v) = ov.compile_wall_time_ms {
            self.compile_limits.wall_time_ms = v;
            self.compile_limits.cpu_time_ms = self.compile_limits.cpu_time_ms.min(v.max(1) * 2);
        }
        if let Some(v) = ov.max_output_bytes {
            self.max_output_bytes = v;
        }
    }
}

/// Language id -> profile table. Built once at startup; read-only afterwards.
#[derive(Debug)]
pub struct LanguageRegistry {
    profiles: Vec<LanguageProfile>,
    index: HashMap<String, usize>,
}

impl LanguageRegistry {
    pub fn from_config(config: &ServiceConfig) -> Result<Self> {
        Self::with_adapters(builtin_adapters(), config)
    }

    pub fn with_adapters(adapters: Vec<Box<dyn JudgeAdapter>>, config: &ServiceConfig) -> Result<Self> {
        for id in config.languages.keys() {
            if !adapters.iter().any(|a| a.language() == id) {
                return Err(ExecError::Config(format!(
                    "override for unknown language '{}'",
                    id
                )));
            }
        }

        let mut profiles = Vec::with_capacity(adapters.len());
        let mut index = HashMap::new();
        for adapter in &adapters {
            let ov = config.languages.get(adapter.language());
            if ov.and_then(|o| o.enabled) == Some(false) {
                log::info!("language '{}' disabled by configuration", adapter.language());
                continue;
            }
            let mut profile = LanguageProfile::from_adapter(adapter.as_ref(), config);
            if let Some(ov) = ov {
                profile.apply_override(ov);
            }

            let slot = profiles.len();
            for key in std::iter::once(&profile.id).chain(profile.aliases.iter()) {
                if index.insert(key.to_ascii_lowercase(), slot).is_some() {
                    return Err(ExecError::Config(format!(
                        "language id or alias '{}' registered twice",
                        key
                    )));
                }
            }
            profiles.push(profile);
        }

        Ok(Self { profiles, index })
    }

    pub fn lookup(&self, language_id: &str) -> std::result::Result<&LanguageProfile, UnsupportedLanguage> {
        self.index
            .get(&language_id.trim().to_ascii_lowercase())
            .map(|&slot| &self.profiles[slot])
            .ok_or_else(|| UnsupportedLanguage(language_id.to_string()))
    }

    pub fn languages(&self) -> impl Iterator<Item = &LanguageProfile> {
        self.profiles.iter()
    }
}
