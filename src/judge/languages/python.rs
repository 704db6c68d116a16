use crate::judge::adapter::{argv, EntryRule, JudgeAdapter};

#[derive(Debug, Clone, Default)]
pub struct PythonAdapter;

impl JudgeAdapter for PythonAdapter {
    fn language(&self) -> &'static str {
        "python"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["py", "python3"]
    }

    fn toolchain(&self) -> &'static str {
        "cpython3"
    }

    fn entry_rule(&self) -> EntryRule {
        EntryRule::Fixed {
            file_name: "main.py",
            main: "main.py",
        }
    }

    fn compile_command(&self) -> Option<Vec<String>> {
        None
    }

    fn run_command(&self) -> Vec<String> {
        argv(&["/usr/bin/python3", "-B", "-u", "{source}"])
    }

    fn environment(&self) -> Vec<(String, String)> {
        vec![
            ("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string()),
            ("PYTHONIOENCODING".to_string(), "utf-8".to_string()),
        ]
    }
}
