//! Pre-exec ordering for the payload process.
//!
//! The setup sequence is fixed:
//! 1. setsid() and PR_SET_PDEATHSIG(SIGKILL)
//! 2. private mount namespace
//! 3. mount propagation hardening (MS_PRIVATE | MS_REC on /)
//! 4. cgroup attach, while host cgroup paths are still visible
//! 5. sandbox root assembly and pivot_root
//! 6. rlimits, umask, fd closure, environment, chdir
//! 7. bounding/ambient capability drop, setresgid/setresuid, capset
//! 8. PR_SET_NO_NEW_PRIVS
//! 9. seccomp filter (or an explicit opt-out)
//! 10. exec
//!
//! Every step consumes the previous state; only `Sandbox<ExecReady>` can exec.
//!
//! Skipping a step does not compile:
//!
//! ```compile_fail,E0599
//! use execbox::exec::preexec::{FreshChild, Sandbox};
//!
//! let sandbox = Sandbox::<FreshChild>::new("box".to_string(), false);
//! let _ = sandbox.exec_payload(&["/bin/true".to_string()]);
//! ```
//!
//! ```compile_fail,E0599
//! use execbox::exec::preexec::{FreshChild, Sandbox};
//!
//! let sandbox = Sandbox::<FreshChild>::new("box".to_string(), false);
//! let _ = sandbox.harden_mount_propagation();
//! ```
//!
//! ```compile_fail,E0599
//! use execbox::exec::preexec::{FreshChild, Sandbox};
//!
//! fn seal() -> execbox::Result<()> {
//!     let sandbox = Sandbox::<FreshChild>::new("box".to_string(), false)
//!         .setup_namespaces(false)?
//!         .harden_mount_propagation()?;
//!     let _ = sandbox.setup_root(None);
//!     Ok(())
//! }
//! ```
//!
//! ```compile_fail,E0599
//! use execbox::exec::preexec::{HygieneApplied, Sandbox};
//!
//! fn lock(sandbox: Sandbox<HygieneApplied>) {
//!     let _ = sandbox.lock_privileges();
//! }
//! ```
//!
//! ```compile_fail,E0599
//! use execbox::exec::preexec::{CredsDropped, Sandbox};
//!
//! fn filter(sandbox: Sandbox<CredsDropped>) {
//!     let _ = sandbox.enable_seccomp();
//! }
//! ```
//!
//! A state cannot be reused once consumed:
//!
//! ```compile_fail,E0382
//! use execbox::exec::preexec::{FreshChild, Sandbox};
//!
//! let sandbox = Sandbox::<FreshChild>::new("box".to_string(), false);
//! let _ready = sandbox.setup_namespaces(false);
//! let _again = sandbox.setup_namespaces(false);
//! ```
use crate::config::types::{ExecError, Result};
use crate::core::types::ExecutionProfile;
use crate::kernel::capabilities::{
    check_no_new_privs, clear_process_capabilities, drop_bounding_and_ambient, get_capability_status,
    set_no_new_privs,
};
use crate::kernel::cgroup::attach_current_process;
use crate::kernel::credentials::transition_to_unprivileged;
use crate::kernel::mount::FilesystemSecurity;
use crate::kernel::namespace::{harden_mount_propagation, unshare_mount_namespace};
use crate::kernel::seccomp::apply_default_filter;
use crate::utils::env_hygiene::{EnvHygiene, EnvPolicy, PermissionPolicy};
use std::collections::BTreeMap;
use std::ffi::CString;
use std::marker::PhantomData;
use std::os::unix::io::RawFd;
use std::path::Path;

/// Close-on-exec pipe the payload uses to report a failed setup step to the proxy.
/// Survives fd closure; vanishes on a successful exec.
pub const SETUP_REPORT_FD: RawFd = 3;

fn apply_rlimit_value(
    name: &str,
    resource: libc::__rlimit_resource_t,
    soft: u64,
    hard: u64,
    strict_mode: bool,
) -> Result<()> {
    let limit = libc::rlimit {
        rlim_cur: soft as libc::rlim_t,
        rlim_max: hard as libc::rlim_t,
    };

    let rc = unsafe { libc::setrlimit(resource, &limit) };
    if rc == 0 {
        return Ok(());
    }

    let err = std::io::Error::last_os_error();
    if strict_mode {
        Err(ExecError::ResourceLimit(format!(
            "Failed to apply {}={} (hard={}): {}",
            name, soft, hard, err
        )))
    } else {
        log::warn!("Failed to apply {}={} (hard={}): {}", name, soft, hard, err);
        Ok(())
    }
}

/// Replace the process environment with exactly `env_map`.
fn apply_exec_environment(env_map: &BTreeMap<String, String>) -> Result<()> {
    let rc = unsafe { libc::clearenv() };
    if rc != 0 {
        return Err(ExecError::Process(format!(
            "clearenv failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    for (key, value) in env_map {
        let key_c = CString::new(key.as_str())
            .map_err(|_| ExecError::Config(format!("Environment key contains NUL byte: {}", key)))?;
        let value_c = CString::new(value.as_str())
            .map_err(|_| ExecError::Config(format!("Environment value for {} contains NUL byte", key)))?;

        let rc = unsafe { libc::setenv(key_c.as_ptr(), value_c.as_ptr(), 1) };
        if rc != 0 {
            return Err(ExecError::Process(format!(
                "setenv failed for {}: {}",
                key,
                std::io::Error::last_os_error()
            )));
        }
    }
    Ok(())
}

/// Ignored dispositions survive exec; the payload must see default SIGPIPE
/// behaviour and an empty signal mask.
fn reset_signal_state() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
        let mut empty: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut empty);
        libc::sigprocmask(libc::SIG_SETMASK, &empty, std::ptr::null_mut());
    }
}

/// Kill this process if its parent (the proxy) dies.
pub fn setup_parent_death_signal() -> Result<()> {
    use nix::sys::prctl;
    use nix::sys::signal::Signal;

    prctl::set_pdeathsig(Signal::SIGKILL)
        .map_err(|e| ExecError::Process(format!("Failed to set parent death signal: {}", e)))
}

pub struct FreshChild;
pub struct NamespacesReady;
pub struct MountsPrivate;
pub struct CgroupAttached;
pub struct RootSealed;
pub struct HygieneApplied;
pub struct CredsDropped;
pub struct PrivsLocked;
pub struct ExecReady;

/// Payload process with type-state tracking of the pre-exec sequence
pub struct Sandbox<S> {
    pub instance_id: String,
    pub strict_mode: bool,
    /// Whether the payload entered its own mount namespace
    pub mount_namespace_enabled: bool,
    /// Whether the payload joined a per-sandbox cgroup (and its `pids.max`)
    pub cgroup_attached: bool,
    _state: PhantomData<S>,
}

impl<S> Sandbox<S> {
    fn advance<T>(self) -> Sandbox<T> {
        Sandbox {
            instance_id: self.instance_id,
            strict_mode: self.strict_mode,
            mount_namespace_enabled: self.mount_namespace_enabled,
            cgroup_attached: self.cgroup_attached,
            _state: PhantomData,
        }
    }

    /// Strict mode turns a failed step into an error; otherwise it is logged and skipped.
    fn tolerate(&self, step: &str, result: Result<()>) -> Result<()> {
        match result {
            Err(e) if self.strict_mode => Err(e),
            Err(e) => {
                log::warn!("[{}] {} failed in degraded mode: {}", self.instance_id, step, e);
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }
}

impl Sandbox<FreshChild> {
    pub fn new(instance_id: String, strict_mode: bool) -> Self {
        Self {
            instance_id,
            strict_mode,
            mount_namespace_enabled: false,
            cgroup_attached: false,
            _state: PhantomData,
        }
    }

    pub fn setup_namespaces(self, enable_mount: bool) -> Result<Sandbox<NamespacesReady>> {
        if unsafe { libc::setsid() } < 0 {
            let err = std::io::Error::last_os_error();
            self.tolerate("setsid", Err(ExecError::Process(format!("setsid failed: {}", err))))?;
        }
        setup_parent_death_signal()?;

        let mut next: Sandbox<NamespacesReady> = self.advance();
        if enable_mount {
            unshare_mount_namespace()?;
            next.mount_namespace_enabled = true;
        }
        Ok(next)
    }
}

impl Sandbox<NamespacesReady> {
    /// Mandatory whenever a mount namespace exists: mounts must never propagate to the host.
    pub fn harden_mount_propagation(self) -> Result<Sandbox<MountsPrivate>> {
        if self.mount_namespace_enabled {
            harden_mount_propagation()?;
        }
        Ok(self.advance())
    }
}

impl Sandbox<MountsPrivate> {
    pub fn attach_to_cgroup(self, cgroup_path: Option<&Path>) -> Result<Sandbox<CgroupAttached>> {
        let mut next: Sandbox<CgroupAttached> = self.advance();
        if let Some(path) = cgroup_path {
            attach_current_process(path)?;
            next.cgroup_attached = true;
        }
        Ok(next)
    }
}

impl Sandbox<CgroupAttached> {
    pub fn setup_root(self, fs: Option<&FilesystemSecurity>) -> Result<Sandbox<RootSealed>> {
        match fs {
            Some(fs) => {
                if !self.mount_namespace_enabled {
                    return Err(ExecError::Filesystem(
                        "sandbox root requires a private mount namespace".to_string(),
                    ));
                }
                fs.setup_root()?;
            }
            None if self.strict_mode => {
                return Err(ExecError::Filesystem(
                    "strict mode requires an isolated root".to_string(),
                ));
            }
            None => {}
        }
        Ok(self.advance())
    }
}

/// RLIMIT_NPROC counts every task of the uid host-wide, and all sandboxes share
/// one uid. With a cgroup attached `pids.max` bounds this sandbox alone, so the
/// rlimit is left unset rather than letting tenants exhaust each other's quota.
fn nproc_rlimit(profile: &ExecutionProfile, cgroup_attached: bool) -> Option<u64> {
    (profile.uid.is_some() && !cgroup_attached).then(|| u64::from(profile.limits.max_processes))
}

impl Sandbox<RootSealed> {
    pub fn apply_runtime_hygiene(self, profile: &ExecutionProfile) -> Result<Sandbox<HygieneApplied>> {
        let strict = self.strict_mode;
        let limits = &profile.limits;

        if profile.address_space_limit {
            apply_rlimit_value("RLIMIT_AS", libc::RLIMIT_AS, limits.memory_bytes, limits.memory_bytes, strict)?;
        }
        apply_rlimit_value(
            "RLIMIT_FSIZE",
            libc::RLIMIT_FSIZE,
            profile.file_size_limit,
            profile.file_size_limit,
            strict,
        )?;
        apply_rlimit_value("RLIMIT_CORE", libc::RLIMIT_CORE, 0, 0, strict)?;
        apply_rlimit_value("RLIMIT_MEMLOCK", libc::RLIMIT_MEMLOCK, 0, 0, strict)?;
        apply_rlimit_value(
            "RLIMIT_STACK",
            libc::RLIMIT_STACK,
            profile.stack_limit,
            profile.stack_limit,
            strict,
        )?;
        apply_rlimit_value("RLIMIT_NOFILE", libc::RLIMIT_NOFILE, profile.fd_limit, profile.fd_limit, strict)?;
        if let Some(nproc) = nproc_rlimit(profile, self.cgroup_attached) {
            apply_rlimit_value("RLIMIT_NPROC", libc::RLIMIT_NPROC, nproc, nproc, strict)?;
        }
        // soft -> SIGXCPU, hard -> SIGKILL one second later
        let cpu_secs = limits.cpu_time_ms.div_ceil(1000).max(1);
        apply_rlimit_value("RLIMIT_CPU", libc::RLIMIT_CPU, cpu_secs, cpu_secs + 1, strict)?;

        let hygiene = EnvHygiene::new(
            EnvPolicy {
                strict_mode: strict,
                ..Default::default()
            },
            PermissionPolicy::default(),
        );
        hygiene.apply_umask()?;
        reset_signal_state();
        crate::utils::fd_closure::close_fds_from(SETUP_REPORT_FD + 1, strict)?;

        let env_map = hygiene.build_environment(&profile.environment)?;
        apply_exec_environment(&env_map)?;

        std::env::set_current_dir(&profile.workdir).map_err(|e| {
            ExecError::Filesystem(format!(
                "Failed to chdir to workdir {}: {}",
                profile.workdir.display(),
                e
            ))
        })?;

        Ok(self.advance())
    }
}

impl Sandbox<HygieneApplied> {
    /// Switch to the sandbox identity. The bounding set is shrunk first, while
    /// CAP_SETPCAP is still held.
    pub fn drop_credentials(self, ids: Option<(u32, u32)>) -> Result<Sandbox<CredsDropped>> {
        match ids {
            Some((uid, gid)) => {
                drop_bounding_and_ambient()?;
                transition_to_unprivileged(uid, gid)?;
                clear_process_capabilities()?;
            }
            None if self.strict_mode => {
                return Err(ExecError::Privilege(
                    "strict mode requires a sandbox uid/gid".to_string(),
                ));
            }
            None => {
                let attempt = drop_bounding_and_ambient().and_then(|_| clear_process_capabilities());
                self.tolerate("capability drop", attempt)?;
            }
        }
        Ok(self.advance())
    }
}

impl Sandbox<CredsDropped> {
    pub fn lock_privileges(self) -> Result<Sandbox<PrivsLocked>> {
        set_no_new_privs()?;
        if !check_no_new_privs() {
            return Err(ExecError::Privilege(
                "PR_SET_NO_NEW_PRIVS verification failed".to_string(),
            ));
        }

        if self.strict_mode {
            let status = get_capability_status()?;
            if !status.is_fully_dropped() {
                return Err(ExecError::Privilege(format!(
                    "capabilities still present before exec: {:?}",
                    status
                )));
            }
        }
        Ok(self.advance())
    }
}

impl Sandbox<PrivsLocked> {
    /// Install the syscall deny filter. Must be the last kernel-state change.
    pub fn enable_seccomp(self) -> Result<Sandbox<ExecReady>> {
        apply_default_filter()?;
        Ok(self.advance())
    }

    pub fn without_seccomp(self) -> Sandbox<ExecReady> {
        self.advance()
    }
}

impl Sandbox<ExecReady> {
    /// Only returns on failure.
    pub fn exec_payload(self, command: &[String]) -> Result<()> {
        if command.is_empty() {
            return Err(ExecError::Config("Empty command for exec".to_string()));
        }

        let cargv = command
            .iter()
            .map(|arg| CString::new(arg.as_str()))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| ExecError::Config("command contains NUL byte".to_string()))?;

        nix::unistd::execvp(cargv[0].as_c_str(), &cargv)
            .map_err(|e| ExecError::Process(format!("execvp {} failed: {}", command[0], e)))?;
        Ok(())
    }
}
