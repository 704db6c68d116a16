//! Resource ledger for one sandbox.
//!
//! Resources are recorded immediately after they are created and released in
//! reverse creation order. Release is idempotent: an entry leaves the ledger
//! only once its teardown succeeded, so a retry picks up exactly what is left.
use crate::config::types::{ExecError, Result};
use crate::kernel::cgroup::CgroupV2;
use crate::kernel::mount::{is_mounted, unmount_detach};
use crate::safety::safe_cleanup::remove_tree_secure;
use log::{debug, warn};
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub enum Resource {
    /// Directory tree removed with symlink-safe traversal
    ScratchDir(PathBuf),
    /// Mount point detached on release
    Mount(PathBuf),
    /// Per-sandbox cgroup: killed, drained and removed
    Cgroup { controller: CgroupV2, instance_id: String },
}

impl Resource {
    fn describe(&self) -> String {
        match self {
            Resource::ScratchDir(path) => format!("scratch dir {}", path.display()),
            Resource::Mount(path) => format!("mount {}", path.display()),
            Resource::Cgroup { controller, instance_id } => {
                format!("cgroup {}", controller.instance_path(instance_id).display())
            }
        }
    }

    fn release(&self) -> Result<()> {
        match self {
            Resource::ScratchDir(path) => remove_tree_secure(path),
            Resource::Mount(path) => {
                if is_mounted(path) {
                    unmount_detach(path)?;
                }
                Ok(())
            }
            Resource::Cgroup { controller, instance_id } => controller.remove(instance_id),
        }
    }
}

#[derive(Debug, Default)]
pub struct ResourceLedger {
    entries: Vec<Resource>,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, resource: Resource) {
        debug!("Recording resource: {}", resource.describe());
        self.entries.push(resource);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Tear down everything still recorded, newest first. Failed entries stay
    /// in the ledger and are reported together.
    pub fn release_all(&mut self) -> Result<()> {
        let mut failures = Vec::new();
        let mut remaining = Vec::new();

        while let Some(resource) = self.entries.pop() {
            match resource.release() {
                Ok(()) => debug!("Released {}", resource.describe()),
                Err(e) => {
                    warn!("Failed to release {}: {}", resource.describe(), e);
                    failures.push(format!("{}: {}", resource.describe(), e));
                    remaining.push(resource);
                }
            }
        }

        remaining.reverse();
        self.entries = remaining;

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ExecError::Filesystem(format!(
                "Cleanup failed for {} resource(s): {}",
                failures.len(),
                failures.join("; ")
            )))
        }
    }
}
