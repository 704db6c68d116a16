use crate::judge::adapter::{argv, EntryRule, JudgeAdapter};

#[derive(Debug, Clone, Default)]
pub struct CppAdapter;

impl JudgeAdapter for CppAdapter {
    fn language(&self) -> &'static str {
        "cpp"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["c++", "cxx", "cc"]
    }

    fn toolchain(&self) -> &'static str {
        "g++"
    }

    fn entry_rule(&self) -> EntryRule {
        EntryRule::Fixed {
            file_name: "main.cpp",
            main: "main",
        }
    }

    fn compile_command(&self) -> Option<Vec<String>> {
        Some(argv(&[
            "/usr/bin/g++",
            "-O2",
            "-std=c++17",
            "-pipe",
            "-o",
            "{main}",
            "{source}",
        ]))
    }

    fn run_command(&self) -> Vec<String> {
        argv(&["./{main}"])
    }
}
