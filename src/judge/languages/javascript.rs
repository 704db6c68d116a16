use crate::config::types::PhaseLimits;
use crate::judge::adapter::{argv, EntryRule, JudgeAdapter};

#[derive(Debug, Clone, Default)]
pub struct JavaScriptAdapter;

impl JudgeAdapter for JavaScriptAdapter {
    fn language(&self) -> &'static str {
        "javascript"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["js", "node", "nodejs"]
    }

    fn toolchain(&self) -> &'static str {
        "nodejs"
    }

    fn entry_rule(&self) -> EntryRule {
        EntryRule::Fixed {
            file_name: "main.js",
            main: "main.js",
        }
    }

    fn compile_command(&self) -> Option<Vec<String>> {
        None
    }

    fn run_command(&self) -> Vec<String> {
        argv(&["/usr/bin/node", "--max-old-space-size=192", "{source}"])
    }

    fn run_limits(&self, defaults: &PhaseLimits) -> PhaseLimits {
        // V8 spawns its own worker threads
        PhaseLimits {
            max_processes: defaults.max_processes.max(32),
            ..*defaults
        }
    }

    fn address_space_limit(&self) -> bool {
        false
    }
}
