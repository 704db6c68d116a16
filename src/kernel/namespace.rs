//! Namespace isolation for sandboxed payloads
//! Two-stage: the proxy unshares PID/IPC/UTS/NET before forking the payload,
//! the payload unshares its own mount namespace before building its root.
use crate::config::types::{ExecError, Result};

use nix::sched::{unshare, CloneFlags};
use nix::unistd::sethostname;

pub const SANDBOX_HOSTNAME: &str = "execbox";

/// Namespace set entered by the proxy before the payload fork
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NamespaceIsolation {
    enable_pid_namespace: bool,
    enable_network_namespace: bool,
    enable_ipc_namespace: bool,
    enable_uts_namespace: bool,
}

impl NamespaceIsolation {
    pub fn new(enable_pid: bool, enable_network: bool, enable_ipc: bool, enable_uts: bool) -> Self {
        Self {
            enable_pid_namespace: enable_pid,
            enable_network_namespace: enable_network,
            enable_ipc_namespace: enable_ipc,
            enable_uts_namespace: enable_uts,
        }
    }

    /// Everything on; the network namespace is left without a configured interface.
    pub fn strict() -> Self {
        Self::new(true, true, true, true)
    }

    pub fn none() -> Self {
        Self::new(false, false, false, false)
    }

    /// Check if namespace isolation is supported on this system
    pub fn is_supported() -> bool {
        std::fs::read_dir("/proc/self/ns").is_ok()
    }

    pub fn clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::empty();
        if self.enable_pid_namespace {
            flags |= CloneFlags::CLONE_NEWPID;
        }
        if self.enable_network_namespace {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        if self.enable_ipc_namespace {
            flags |= CloneFlags::CLONE_NEWIPC;
        }
        if self.enable_uts_namespace {
            flags |= CloneFlags::CLONE_NEWUTS;
        }
        flags
    }

    /// Unshare the configured namespaces. With CLONE_NEWPID the caller's next
    /// child becomes PID 1 of the new namespace; the caller itself stays outside.
    pub fn apply_isolation(&self) -> Result<()> {
        let flags = self.clone_flags();
        if flags.is_empty() {
            return Ok(());
        }

        unshare(flags)
            .map_err(|e| ExecError::Namespace(format!("Failed to unshare namespaces: {}", e)))?;

        if self.enable_uts_namespace {
            sethostname(SANDBOX_HOSTNAME).map_err(|e| {
                ExecError::Namespace(format!("Failed to set hostname in UTS namespace: {}", e))
            })?;
        }

        log::debug!("Applied namespace isolation: {:?}", self.enabled_namespaces());
        Ok(())
    }

    pub fn is_isolation_enabled(&self) -> bool {
        !self.clone_flags().is_empty()
    }

    pub fn enabled_namespaces(&self) -> Vec<&'static str> {
        let mut namespaces = Vec::new();
        if self.enable_pid_namespace {
            namespaces.push("pid");
        }
        if self.enable_network_namespace {
            namespaces.push("net");
        }
        if self.enable_ipc_namespace {
            namespaces.push("ipc");
        }
        if self.enable_uts_namespace {
            namespaces.push("uts");
        }
        namespaces
    }
}

/// Enter a private mount namespace. Called by the payload before any mount work.
pub fn unshare_mount_namespace() -> Result<()> {
    unshare(CloneFlags::CLONE_NEWNS)
        .map_err(|e| ExecError::Namespace(format!("Failed to unshare mount namespace: {}", e)))
}

/// mount(NULL, "/", NULL, MS_REC | MS_PRIVATE, NULL)
/// Must succeed: without it sandbox mounts would propagate to the host.
pub fn harden_mount_propagation() -> Result<()> {
    use nix::mount::{mount, MsFlags};

    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| {
        ExecError::Namespace(format!(
            "Failed to harden mount propagation (MS_PRIVATE|MS_REC on /): {}",
            e
        ))
    })
}
