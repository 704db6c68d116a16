//! Isolation boundary: one ephemeral sandbox per request.
//!
//! `IsolationBoundary::acquire` builds the host-side pieces (tmpfs-backed
//! scratch area, sandbox-owned work dir) and `SandboxHandle::launch_request`
//! adds a fresh cgroup per phase. Everything is recorded in the handle's
//! ledger and torn down by `release`, which `Drop` repeats if it never ran.
use crate::config::service::ServiceConfig;
use crate::config::types::{ExecError, PhaseLimits, Result};
use crate::core::types::{ExecutionProfile, SandboxLaunchRequest};
use crate::kernel::cgroup::CgroupV2;
use crate::kernel::mount::{create_owned_dir, mount_scratch_tmpfs, SANDBOX_WORKDIR};
use crate::kernel::namespace::NamespaceIsolation;
use crate::kernel::seccomp::seccomp_available;
use crate::safety::cleanup::{Resource, ResourceLedger};
use std::fs;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const STACK_LIMIT: u64 = 64 * 1024 * 1024;
const FD_LIMIT: u64 = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    /// Namespaces, pivot_root, cgroup v2, credential drop, seccomp
    Strict,
    /// Scratch directory, rlimits and process-group kill only
    Degraded,
}

#[derive(Debug, Default)]
struct Counters {
    created: AtomicU64,
    destroyed: AtomicU64,
}

/// One phase (compile or run) to be launched inside a handle
#[derive(Clone, Debug)]
pub struct PhaseSpec {
    pub name: &'static str,
    pub command: Vec<String>,
    pub environment: Vec<(String, String)>,
    pub limits: PhaseLimits,
    pub address_space_limit: bool,
    pub max_output_bytes: usize,
    pub stdin: Vec<u8>,
}

#[derive(Debug)]
pub struct IsolationBoundary {
    mode: IsolationMode,
    runtime_root: PathBuf,
    cgroups: Option<CgroupV2>,
    uid: u32,
    gid: u32,
    scratch_size_bytes: u64,
    counters: Arc<Counters>,
}

impl IsolationBoundary {
    /// Pick the isolation mode for this host. Strict needs root and a cgroup v2
    /// hierarchy; without them the boundary only starts when degraded mode is allowed.
    pub fn from_config(config: &ServiceConfig) -> Result<Self> {
        let is_root = nix::unistd::geteuid().is_root();
        let cgroups = CgroupV2::is_available();
        let strict_possible =
            is_root && cgroups && NamespaceIsolation::is_supported() && seccomp_available();

        let mode = if strict_possible && config.strict_mode {
            IsolationMode::Strict
        } else if config.allow_degraded {
            log::warn!(
                "Kernel isolation unavailable or disabled (root={}, cgroup v2={}, strict_possible={}, strict_mode={}); running DEGRADED: no namespaces, no cgroup limits",
                is_root,
                cgroups,
                strict_possible,
                config.strict_mode
            );
            IsolationMode::Degraded
        } else {
            return Err(ExecError::Privilege(
                "kernel isolation requires root, cgroup v2, namespaces and seccomp; set allow_degraded for development only"
                    .to_string(),
            ));
        };

        Self::with_mode(mode, config)
    }

    pub fn with_mode(mode: IsolationMode, config: &ServiceConfig) -> Result<Self> {
        let dir_mode = if mode == IsolationMode::Strict { 0o711 } else { 0o700 };
        fs::DirBuilder::new()
            .recursive(true)
            .mode(dir_mode)
            .create(&config.runtime_root)
            .map_err(|e| {
                ExecError::Filesystem(format!(
                    "Failed to create runtime root {}: {}",
                    config.runtime_root.display(),
                    e
                ))
            })?;

        let cgroups = match mode {
            IsolationMode::Strict => {
                let controller = CgroupV2::new(&config.cgroup_root, true);
                controller.prepare_root()?;
                Some(controller)
            }
            IsolationMode::Degraded => None,
        };

        log::info!(
            "Isolation boundary ready: mode={:?} runtime_root={}",
            mode,
            config.runtime_root.display()
        );

        Ok(Self {
            mode,
            runtime_root: config.runtime_root.clone(),
            cgroups,
            uid: config.sandbox_uid,
            gid: config.sandbox_gid,
            scratch_size_bytes: config.scratch_size_bytes,
            counters: Arc::default(),
        })
    }

    pub fn mode(&self) -> IsolationMode {
        self.mode
    }

    pub fn created(&self) -> u64 {
        self.counters.created.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> u64 {
        self.counters.destroyed.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> u64 {
        self.created().saturating_sub(self.destroyed())
    }

    /// Create a sandbox. On failure everything created so far is torn down
    /// before the error is returned.
    pub fn acquire(&self) -> Result<SandboxHandle> {
        if self.mode == IsolationMode::Degraded {
            log::warn!("Acquiring DEGRADED sandbox: untrusted code runs without kernel isolation");
        }

        let id = uuid::Uuid::new_v4().simple().to_string();
        let scratch = self.runtime_root.join(&id);
        self.counters.created.fetch_add(1, Ordering::SeqCst);

        let mut handle = SandboxHandle {
            id,
            mode: self.mode,
            work_dir: scratch.join("work"),
            root_dir: scratch.join("root"),
            scratch_dir: scratch,
            cgroups: self.cgroups.clone(),
            ids: (self.mode == IsolationMode::Strict).then_some((self.uid, self.gid)),
            scratch_size_bytes: self.scratch_size_bytes,
            ledger: ResourceLedger::new(),
            counters: Arc::clone(&self.counters),
            released: false,
        };

        if let Err(e) = handle.build() {
            if let Err(cleanup) = handle.release() {
                log::error!("[{}] cleanup after failed acquire also failed: {}", handle.id, cleanup);
            }
            return Err(e);
        }

        log::debug!("[{}] sandbox acquired at {}", handle.id, handle.scratch_dir.display());
        Ok(handle)
    }
}

/// One sandbox instance. Exclusively owned by the request that acquired it.
#[derive(Debug)]
pub struct SandboxHandle {
    id: String,
    mode: IsolationMode,
    scratch_dir: PathBuf,
    work_dir: PathBuf,
    root_dir: PathBuf,
    cgroups: Option<CgroupV2>,
    ids: Option<(u32, u32)>,
    scratch_size_bytes: u64,
    ledger: ResourceLedger,
    counters: Arc<Counters>,
    released: bool,
}

impl SandboxHandle {
    fn build(&mut self) -> Result<()> {
        fs::DirBuilder::new()
            .mode(0o711)
            .create(&self.scratch_dir)
            .map_err(|e| {
                ExecError::Filesystem(format!(
                    "Failed to create scratch dir {}: {}",
                    self.scratch_dir.display(),
                    e
                ))
            })?;
        self.ledger.record(Resource::ScratchDir(self.scratch_dir.clone()));

        match self.ids {
            Some((uid, gid)) => {
                mount_scratch_tmpfs(&self.scratch_dir, self.scratch_size_bytes)?;
                self.ledger.record(Resource::Mount(self.scratch_dir.clone()));
                create_owned_dir(&self.work_dir, uid, gid, 0o700)?;
            }
            None => {
                fs::DirBuilder::new().mode(0o700).create(&self.work_dir)?;
            }
        }
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn mode(&self) -> IsolationMode {
        self.mode
    }

    /// Host path of the writable work dir
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Work dir as the payload sees it
    pub fn payload_workdir(&self) -> PathBuf {
        match self.mode {
            IsolationMode::Strict => PathBuf::from(SANDBOX_WORKDIR),
            IsolationMode::Degraded => self.work_dir.clone(),
        }
    }

    /// Place a submission file in the work dir, readable only by the sandbox identity.
    pub fn write_file(&self, name: &str, contents: &[u8]) -> Result<PathBuf> {
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(ExecError::Filesystem(format!("invalid sandbox file name '{}'", name)));
        }
        let path = self.work_dir.join(name);
        fs::write(&path, contents)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
        if let Some((uid, gid)) = self.ids {
            nix::unistd::chown(
                &path,
                Some(nix::unistd::Uid::from_raw(uid)),
                Some(nix::unistd::Gid::from_raw(gid)),
            )?;
        }
        Ok(path)
    }

    /// Build the launch request for one phase, creating its cgroup with the phase limits.
    /// Returns the controller the supervisor should watch, if any.
    pub fn launch_request(&mut self, spec: PhaseSpec) -> Result<(SandboxLaunchRequest, Option<CgroupV2>)> {
        if self.released {
            return Err(ExecError::Process(format!("sandbox {} already released", self.id)));
        }

        let instance_id = format!("{}-{}", self.id, spec.name);
        let attach_path = match &self.cgroups {
            Some(controller) => {
                controller.create(&instance_id)?;
                self.ledger.record(Resource::Cgroup {
                    controller: controller.clone(),
                    instance_id: instance_id.clone(),
                });
                controller.set_memory_limit(&instance_id, spec.limits.memory_bytes)?;
                controller.set_process_limit(&instance_id, spec.limits.max_processes)?;
                Some(controller.instance_path(&instance_id))
            }
            None => None,
        };

        let strict = self.mode == IsolationMode::Strict;
        let profile = ExecutionProfile {
            command: spec.command,
            environment: spec.environment,
            workdir: self.payload_workdir(),
            host_workdir: self.work_dir.clone(),
            new_root: strict.then(|| self.root_dir.clone()),
            tmp_size_bytes: self.scratch_size_bytes,
            uid: self.ids.map(|(uid, _)| uid),
            gid: self.ids.map(|(_, gid)| gid),
            strict_mode: strict,
            enable_syscall_filtering: strict,
            limits: spec.limits,
            address_space_limit: spec.address_space_limit,
            file_size_limit: self.scratch_size_bytes,
            stack_limit: STACK_LIMIT,
            fd_limit: FD_LIMIT,
            max_output_bytes: spec.max_output_bytes,
        };

        let request = SandboxLaunchRequest {
            instance_id,
            profile,
            stdin_data: spec.stdin,
            cgroup_attach_path: attach_path,
        };
        Ok((request, self.cgroups.clone()))
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Kill anything still running and reclaim every resource. Idempotent.
    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.ledger.release_all()?;
        self.released = true;
        self.counters.destroyed.fetch_add(1, Ordering::SeqCst);
        log::debug!("[{}] sandbox released", self.id);
        Ok(())
    }
}

impl Drop for SandboxHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.release() {
            log::error!("[{}] sandbox teardown failed, resources leaked: {}", self.id, e);
            self.released = true;
            self.counters.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn degraded(tmp: &Path) -> IsolationBoundary {
        let config = ServiceConfig {
            runtime_root: tmp.join("runtime"),
            allow_degraded: true,
            ..Default::default()
        };
        IsolationBoundary::with_mode(IsolationMode::Degraded, &config).unwrap()
    }

    fn spec() -> PhaseSpec {
        PhaseSpec {
            name: "run",
            command: vec!["/bin/true".to_string()],
            environment: Vec::new(),
            limits: PhaseLimits::default(),
            address_space_limit: true,
            max_output_bytes: 1024,
            stdin: b"input".to_vec(),
        }
    }

    #[test]
    fn acquire_and_release_balance_counters() {
        let tmp = tempfile::tempdir().unwrap();
        let boundary = degraded(tmp.path());

        let mut handle = boundary.acquire().unwrap();
        assert_eq!(boundary.live(), 1);
        assert!(handle.work_dir().is_dir());
        let scratch = handle.scratch_dir.clone();

        handle.release().unwrap();
        handle.release().unwrap();
        drop(handle);

        assert_eq!(boundary.created(), 1);
        assert_eq!(boundary.destroyed(), 1);
        assert!(!scratch.exists());
    }

    #[test]
    fn drop_releases_unreleased_handle() {
        let tmp = tempfile::tempdir().unwrap();
        let boundary = degraded(tmp.path());
        let scratch = {
            let handle = boundary.acquire().unwrap();
            handle.write_file("main.py", b"print(1)").unwrap();
            handle.scratch_dir.clone()
        };
        assert!(!scratch.exists());
        assert_eq!(boundary.live(), 0);
    }

    #[test]
    fn handles_do_not_share_scratch() {
        let tmp = tempfile::tempdir().unwrap();
        let boundary = degraded(tmp.path());
        let a = boundary.acquire().unwrap();
        let b = boundary.acquire().unwrap();
        assert_ne!(a.id(), b.id());
        assert_ne!(a.work_dir(), b.work_dir());
        assert_eq!(boundary.live(), 2);
    }

    #[test]
    fn file_names_cannot_escape_work_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let boundary = degraded(tmp.path());
        let handle = boundary.acquire().unwrap();
        assert!(handle.write_file("../evil", b"x").is_err());
        assert!(handle.write_file("", b"x").is_err());
        let path = handle.write_file("Main.java", b"class Main {}").unwrap();
        assert_eq!(fs::read(path).unwrap(), b"class Main {}");
    }

    #[test]
    fn degraded_request_keeps_host_view() {
        let tmp = tempfile::tempdir().unwrap();
        let boundary = degraded(tmp.path());
        let mut handle = boundary.acquire().unwrap();
        let (req, cgroup) = handle.launch_request(spec()).unwrap();

        assert!(cgroup.is_none());
        assert!(req.cgroup_attach_path.is_none());
        assert!(!req.profile.strict_mode);
        assert!(req.profile.new_root.is_none());
        assert_eq!(req.profile.workdir, handle.work_dir());
        assert_eq!(req.stdin_data, b"input");
        assert!(req.instance_id.ends_with("-run"));

        handle.release().unwrap();
        assert!(handle.launch_request(spec()).is_err());
    }
}
