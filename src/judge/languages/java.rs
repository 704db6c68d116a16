use crate::config::types::PhaseLimits;
use crate::judge::adapter::{argv, EntryRule, JudgeAdapter};
use once_cell::sync::Lazy;
use regex::Regex;

const JAVA_MIN_MEMORY: u64 = 512 * 1024 * 1024;

static PUBLIC_CLASS: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*public\s+(?:(?:final|abstract|strictfp)\s+)*class\s+([A-Za-z_$][A-Za-z0-9_$]*)")
        .ok()
});

#[derive(Debug, Clone, Default)]
pub struct JavaAdapter;

/// Name of the first top-level `public class`, if the source declares one.
pub fn detect_class_name(source: &str) -> Option<String> {
    let re = PUBLIC_CLASS.as_ref()?;
    re.captures(source)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

impl JudgeAdapter for JavaAdapter {
    fn language(&self) -> &'static str {
        "java"
    }

    fn toolchain(&self) -> &'static str {
        "openjdk"
    }

    fn entry_rule(&self) -> EntryRule {
        EntryRule::PublicClass { fallback: "Main" }
    }

    fn compile_command(&self) -> Option<Vec<String>> {
        Some(argv(&[
            "/usr/bin/javac",
            "-encoding",
            "UTF-8",
            "-J-Xmx256m",
            "{source}",
        ]))
    }

    fn run_command(&self) -> Vec<String> {
        argv(&[
            "/usr/bin/java",
            "-Xmx256m",
            "-Xss1m",
            "-XX:+UseSerialGC",
            "-XX:TieredStopAtLevel=1",
            "-cp",
            ".",
            "{main}",
        ])
    }

    fn compile_limits(&self, wall_time_ms: u64) -> PhaseLimits {
        PhaseLimits {
            cpu_time_ms: wall_time_ms * 2,
            wall_time_ms,
            memory_bytes: 768 * 1024 * 1024,
            max_processes: 320,
        }
    }

    fn run_limits(&self, defaults: &PhaseLimits) -> PhaseLimits {
        PhaseLimits {
            cpu_time_ms: defaults.cpu_time_ms * 2,
            wall_time_ms: defaults.wall_time_ms * 2,
            memory_bytes: defaults.memory_bytes.max(JAVA_MIN_MEMORY),
            max_processes: defaults.max_processes.max(256),
        }
    }

    fn environment(&self) -> Vec<(String, String)> {
        vec![(
            "JAVA_TOOL_OPTIONS".to_string(),
            "-Dfile.encoding=UTF-8".to_string(),
        )]
    }

    fn address_space_limit(&self) -> bool {
        false
    }
}
