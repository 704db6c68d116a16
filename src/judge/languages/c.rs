use crate::judge::adapter::{argv, EntryRule, JudgeAdapter};

#[derive(Debug, Clone, Default)]
pub struct CAdapter;

impl JudgeAdapter for CAdapter {
    fn language(&self) -> &'static str {
        "c"
    }

    fn toolchain(&self) -> &'static str {
        "gcc"
    }

    fn entry_rule(&self) -> EntryRule {
        EntryRule::Fixed {
            file_name: "main.c",
            main: "main",
        }
    }

    fn compile_command(&self) -> Option<Vec<String>> {
        Some(argv(&[
            "/usr/bin/gcc",
            "-O2",
            "-std=c17",
            "-pipe",
            "-o",
            "{main}",
            "{source}",
            "-lm",
        ]))
    }

    fn run_command(&self) -> Vec<String> {
        argv(&["./{main}"])
    }
}
