/// Cgroup v2 backend
/// memory.max + memory.swap.max + memory.oom.group for memory, pids.max for
/// fork bombs, cpu.stat for the CPU watchdog, cgroup.kill for teardown.
use crate::config::types::{ExecError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const REMOVE_ATTEMPTS: u32 = 50;

/// Accounting read back from a sandbox cgroup after a phase
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CgroupEvidence {
    pub memory_peak: u64,
    pub oom_events: u64,
    pub oom_kill_events: u64,
    pub cpu_usage_usec: u64,
    pub pids_max_events: u64,
}

impl CgroupEvidence {
    pub fn memory_exhausted(&self) -> bool {
        self.oom_kill_events > 0
    }

    pub fn pids_exhausted(&self) -> bool {
        self.pids_max_events > 0
    }
}

/// Cgroup v2 backend rooted at a service-owned directory
#[derive(Clone, Debug)]
pub struct CgroupV2 {
    base_path: PathBuf,
    strict_mode: bool,
}

impl CgroupV2 {
    pub fn new(base_path: impl Into<PathBuf>, strict_mode: bool) -> Self {
        Self {
            base_path: base_path.into(),
            strict_mode,
        }
    }

    /// Unified hierarchy mounted at the usual place
    pub fn is_available() -> bool {
        Path::new("/sys/fs/cgroup/cgroup.controllers").exists()
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn instance_path(&self, instance_id: &str) -> PathBuf {
        self.base_path.join(instance_id)
    }

    /// Create the service root and delegate memory/pids/cpu to its children.
    pub fn prepare_root(&self) -> Result<()> {
        fs::create_dir_all(&self.base_path).map_err(|e| {
            ExecError::Cgroup(format!(
                "Failed to create cgroup root {}: {}",
                self.base_path.display(),
                e
            ))
        })?;

        let controllers = "+memory +pids +cpu";
        if let Some(parent) = self.base_path.parent() {
            let parent_control = parent.join("cgroup.subtree_control");
            if parent_control.exists() {
                self.write_or_warn(&parent_control, controllers)?;
            }
        }
        let control = self.base_path.join("cgroup.subtree_control");
        if control.exists() {
            self.write_or_warn(&control, controllers)?;
        }
        Ok(())
    }

    fn write_or_warn(&self, path: &Path, value: &str) -> Result<()> {
        match fs::write(path, value) {
            Ok(()) => Ok(()),
            Err(e) if self.strict_mode => Err(ExecError::Cgroup(format!(
                "Failed to write {} to {}: {}",
                value,
                path.display(),
                e
            ))),
            Err(e) => {
                log::warn!("Failed to write {} to {} (permissive mode): {}", value, path.display(), e);
                Ok(())
            }
        }
    }

    pub fn create(&self, instance_id: &str) -> Result<()> {
        let path = self.instance_path(instance_id);
        fs::create_dir(&path)
            .map_err(|e| ExecError::Cgroup(format!("Failed to create cgroup: {}", e)))?;

        // Kill the whole group on OOM rather than a single victim
        let oom_group_path = path.join("memory.oom.group");
        if oom_group_path.exists() {
            self.write_or_warn(&oom_group_path, "1")?;
        }
        Ok(())
    }

    pub fn set_memory_limit(&self, instance_id: &str, limit_bytes: u64) -> Result<()> {
        let path = self.instance_path(instance_id);
        fs::write(path.join("memory.max"), limit_bytes.to_string())
            .map_err(|e| ExecError::Cgroup(format!("Failed to set memory limit: {}", e)))?;

        let swap_path = path.join("memory.swap.max");
        if swap_path.exists() {
            self.write_or_warn(&swap_path, "0")?;
        }
        Ok(())
    }

    pub fn set_process_limit(&self, instance_id: &str, limit: u32) -> Result<()> {
        fs::write(self.instance_path(instance_id).join("pids.max"), limit.to_string())
            .map_err(|e| ExecError::Cgroup(format!("Failed to set process limit: {}", e)))
    }

    /// Cumulative CPU time of the group (cpu.stat usage_usec)
    pub fn cpu_usage_usec(&self, instance_id: &str) -> Result<u64> {
        let content = fs::read_to_string(self.instance_path(instance_id).join("cpu.stat"))
            .map_err(|e| ExecError::Cgroup(format!("Failed to read cpu.stat: {}", e)))?;
        Ok(parse_keyed(&content, "usage_usec").unwrap_or(0))
    }

    /// Read memory.peak (kernel 5.19+) with fallback to memory.current
    pub fn peak_memory(&self, instance_id: &str) -> Result<u64> {
        let path = self.instance_path(instance_id);
        let file = if path.join("memory.peak").exists() {
            "memory.peak"
        } else {
            "memory.current"
        };
        let content = fs::read_to_string(path.join(file))
            .map_err(|e| ExecError::Cgroup(format!("Failed to read {}: {}", file, e)))?;
        content
            .trim()
            .parse::<u64>()
            .map_err(|e| ExecError::Cgroup(format!("Failed to parse {}: {}", file, e)))
    }

    /// (oom, oom_kill) counters from memory.events
    pub fn oom_events(&self, instance_id: &str) -> Result<(u64, u64)> {
        let events_path = self.instance_path(instance_id).join("memory.events");
        if !events_path.exists() {
            return Ok((0, 0));
        }
        let content = fs::read_to_string(&events_path)
            .map_err(|e| ExecError::Cgroup(format!("Failed to read memory.events: {}", e)))?;
        Ok((
            parse_keyed(&content, "oom").unwrap_or(0),
            parse_keyed(&content, "oom_kill").unwrap_or(0),
        ))
    }

    /// Number of forks refused by pids.max
    pub fn pids_max_events(&self, instance_id: &str) -> Result<u64> {
        let events_path = self.instance_path(instance_id).join("pids.events");
        if !events_path.exists() {
            return Ok(0);
        }
        let content = fs::read_to_string(&events_path)
            .map_err(|e| ExecError::Cgroup(format!("Failed to read pids.events: {}", e)))?;
        Ok(parse_keyed(&content, "max").unwrap_or(0))
    }

    pub fn procs(&self, instance_id: &str) -> Result<Vec<i32>> {
        let procs_path = self.instance_path(instance_id).join("cgroup.procs");
        if !procs_path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&procs_path)
            .map_err(|e| ExecError::Cgroup(format!("Failed to read cgroup.procs: {}", e)))?;
        Ok(content
            .lines()
            .filter_map(|line| line.trim().parse::<i32>().ok())
            .collect())
    }

    pub fn is_empty(&self, instance_id: &str) -> Result<bool> {
        Ok(self.procs(instance_id)?.is_empty())
    }

    /// SIGKILL everything in the group. cgroup.kill (5.14+) first, then per-pid.
    pub fn kill(&self, instance_id: &str) -> Result<()> {
        let path = self.instance_path(instance_id);
        if !path.exists() {
            return Ok(());
        }
        let kill_path = path.join("cgroup.kill");
        if kill_path.exists() && fs::write(&kill_path, "1").is_ok() {
            return Ok(());
        }
        for pid in self.procs(instance_id)? {
            if pid > 0 {
                let _ = nix::sys::signal::kill(
                    nix::unistd::Pid::from_raw(pid),
                    nix::sys::signal::Signal::SIGKILL,
                );
            }
        }
        Ok(())
    }

    /// Kill, wait for the group to drain, then rmdir. Idempotent.
    pub fn remove(&self, instance_id: &str) -> Result<()> {
        let path = self.instance_path(instance_id);
        if !path.exists() {
            return Ok(());
        }

        let mut last_err = None;
        for _ in 0..REMOVE_ATTEMPTS {
            if !self.is_empty(instance_id)? {
                self.kill(instance_id)?;
            }
            match fs::remove_dir(&path) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) => last_err = Some(e),
            }
            // Exiting tasks leave the group asynchronously
            std::thread::sleep(Duration::from_millis(5 + fastrand::u64(0..10)));
        }

        Err(ExecError::Cgroup(format!(
            "Failed to remove cgroup {}: {}",
            path.display(),
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    pub fn collect_evidence(&self, instance_id: &str) -> CgroupEvidence {
        let (oom_events, oom_kill_events) = self.oom_events(instance_id).unwrap_or((0, 0));
        CgroupEvidence {
            memory_peak: self.peak_memory(instance_id).unwrap_or(0),
            oom_events,
            oom_kill_events,
            cpu_usage_usec: self.cpu_usage_usec(instance_id).unwrap_or(0),
            pids_max_events: self.pids_max_events(instance_id).unwrap_or(0),
        }
    }
}

/// Move the calling process into the cgroup at `cgroup_path`.
pub fn attach_current_process(cgroup_path: &Path) -> Result<()> {
    fs::write(cgroup_path.join("cgroup.procs"), "0")
        .map_err(|e| ExecError::Cgroup(format!("Failed to attach process to cgroup: {}", e)))
}

fn parse_keyed(content: &str, key: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some(k), Some(v)) if k == key => v.parse::<u64>().ok(),
            _ => None,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_cgroup() -> (tempfile::TempDir, CgroupV2) {
        let dir = tempfile::tempdir().unwrap();
        let cg = CgroupV2::new(dir.path().join("execbox"), false);
        cg.prepare_root().unwrap();
        (dir, cg)
    }

    #[test]
    fn instance_path_is_under_root() {
        let cg = CgroupV2::new("/sys/fs/cgroup/execbox", true);
        assert_eq!(
            cg.instance_path("abc"),
            PathBuf::from("/sys/fs/cgroup/execbox/abc")
        );
    }

    #[test]
    fn limits_are_written() {
        let (_dir, cg) = fake_cgroup();
        cg.create("box").unwrap();
        cg.set_memory_limit("box", 1024).unwrap();
        cg.set_process_limit("box", 16).unwrap();
        let path = cg.instance_path("box");
        assert_eq!(fs::read_to_string(path.join("memory.max")).unwrap(), "1024");
        assert_eq!(fs::read_to_string(path.join("pids.max")).unwrap(), "16");
    }

    #[test]
    fn evidence_parses_kernel_files() {
        let (_dir, cg) = fake_cgroup();
        cg.create("box").unwrap();
        let path = cg.instance_path("box");
        fs::write(path.join("cpu.stat"), "usage_usec 1500\nuser_usec 1000\nsystem_usec 500\n").unwrap();
        fs::write(path.join("memory.current"), "4096\n").unwrap();
        fs::write(path.join("memory.events"), "low 0\nhigh 0\nmax 3\noom 1\noom_kill 1\n").unwrap();
        fs::write(path.join("pids.events"), "max 2\n").unwrap();

        let ev = cg.collect_evidence("box");
        assert_eq!(ev.cpu_usage_usec, 1500);
        assert_eq!(ev.memory_peak, 4096);
        assert_eq!(ev.oom_kill_events, 1);
        assert_eq!(ev.pids_max_events, 2);
        assert!(ev.memory_exhausted());
        assert!(ev.pids_exhausted());
    }

    #[test]
    fn remove_is_idempotent() {
        let (_dir, cg) = fake_cgroup();
        cg.create("box").unwrap();
        cg.remove("box").unwrap();
        cg.remove("box").unwrap();
        assert!(!cg.instance_path("box").exists());
    }

    #[test]
    fn parse_keyed_matches_whole_key() {
        let content = "oom 4\noom_kill 2\n";
        assert_eq!(parse_keyed(content, "oom"), Some(4));
        assert_eq!(parse_keyed(content, "oom_kill"), Some(2));
        assert_eq!(parse_keyed(content, "missing"), None);
    }
}
