/// Filesystem isolation: a throwaway root assembled from read-only toolchain
/// binds, the writable work dir, fresh /proc, a minimal /dev and a capped /tmp.
use crate::config::types::{ExecError, Result};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Where the writable work dir appears inside the sandbox
pub const SANDBOX_WORKDIR: &str = "/box";

const DEVICES: &[&str] = &["null", "zero", "random", "urandom"];

/// One host path exposed inside the sandbox
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryBinding {
    pub source: PathBuf,
    pub target: PathBuf,
    pub writable: bool,
    /// Skip silently when the source does not exist
    pub maybe: bool,
}

impl DirectoryBinding {
    pub fn read_only(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            target: path.clone(),
            source: path,
            writable: false,
            maybe: false,
        }
    }

    pub fn maybe(path: impl Into<PathBuf>) -> Self {
        Self {
            maybe: true,
            ..Self::read_only(path)
        }
    }
}

/// Toolchain directories every language profile needs
pub fn default_bindings() -> Vec<DirectoryBinding> {
    let mut bindings = vec![
        DirectoryBinding::read_only("/usr"),
        DirectoryBinding::maybe("/bin"),
        DirectoryBinding::maybe("/lib"),
        DirectoryBinding::maybe("/lib64"),
        DirectoryBinding::maybe("/etc/ld.so.cache"),
        DirectoryBinding::maybe("/etc/alternatives"),
        DirectoryBinding::maybe("/etc/localtime"),
    ];
    // JDK packages keep their security and logging config under /etc/java-*
    if let Ok(entries) = fs::read_dir("/etc") {
        for entry in entries.flatten() {
            if entry.file_name().to_string_lossy().starts_with("java-") {
                bindings.push(DirectoryBinding::maybe(entry.path()));
            }
        }
    }
    bindings
}

/// Root filesystem builder for one payload. Must run inside a private mount namespace.
#[derive(Clone, Debug)]
pub struct FilesystemSecurity {
    new_root: PathBuf,
    work_dir: PathBuf,
    bindings: Vec<DirectoryBinding>,
    tmp_size_bytes: u64,
}

impl FilesystemSecurity {
    pub fn new(
        new_root: PathBuf,
        work_dir: PathBuf,
        bindings: Vec<DirectoryBinding>,
        tmp_size_bytes: u64,
    ) -> Self {
        Self {
            new_root,
            work_dir,
            bindings,
            tmp_size_bytes,
        }
    }

    /// Map an absolute sandbox path to its location under the new root.
    pub fn target_in_root(&self, target: &Path) -> PathBuf {
        self.new_root.join(target.strip_prefix("/").unwrap_or(target))
    }

    /// Assemble the root, pivot into it and seal it read-only.
    /// Afterwards the host filesystem is unreachable from this process.
    pub fn setup_root(&self) -> Result<()> {
        fs::create_dir_all(&self.new_root).map_err(|e| {
            ExecError::Filesystem(format!(
                "Failed to create new root {}: {}",
                self.new_root.display(),
                e
            ))
        })?;
        mount_fs(
            "tmpfs",
            &self.new_root,
            "tmpfs",
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            "size=1m,mode=755",
        )?;

        for binding in &self.bindings {
            self.setup_single_binding(binding)?;
        }

        let box_dir = self.target_in_root(Path::new(SANDBOX_WORKDIR));
        create_mount_point(&box_dir, true)?;
        bind(&self.work_dir, &box_dir, BindMode::ReadWrite)?;

        self.mount_hardened_procfs()?;
        self.mount_minimal_devfs()?;
        self.mount_tmp()?;
        self.pivot()?;
        Ok(())
    }

    fn setup_single_binding(&self, binding: &DirectoryBinding) -> Result<()> {
        let meta = match fs::symlink_metadata(&binding.source) {
            Ok(meta) => meta,
            Err(_) if binding.maybe => {
                log::debug!("Skipping missing binding {}", binding.source.display());
                return Ok(());
            }
            Err(e) => {
                return Err(ExecError::Filesystem(format!(
                    "Binding source {} unavailable: {}",
                    binding.source.display(),
                    e
                )))
            }
        };

        let target = self.target_in_root(&binding.target);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                ExecError::Filesystem(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }

        // Merged-/usr hosts: /bin -> usr/bin. Recreate the link instead of binding twice.
        if meta.file_type().is_symlink() {
            let link = fs::read_link(&binding.source)?;
            std::os::unix::fs::symlink(&link, &target).map_err(|e| {
                ExecError::Filesystem(format!("Failed to link {}: {}", target.display(), e))
            })?;
            return Ok(());
        }

        create_mount_point(&target, meta.is_dir())?;
        let mode = if binding.writable {
            BindMode::ReadWrite
        } else {
            BindMode::ReadOnly
        };
        bind(&binding.source, &target, mode)
    }

    fn mount_hardened_procfs(&self) -> Result<()> {
        let proc_dir = self.target_in_root(Path::new("/proc"));
        create_mount_point(&proc_dir, true)?;
        mount_fs(
            "proc",
            &proc_dir,
            "proc",
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
            "hidepid=2",
        )
        .or_else(|_| {
            // Older kernels reject hidepid inside a fresh pid namespace
            mount_fs(
                "proc",
                &proc_dir,
                "proc",
                MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
                "",
            )
        })
    }

    fn mount_minimal_devfs(&self) -> Result<()> {
        let dev_dir = self.target_in_root(Path::new("/dev"));
        create_mount_point(&dev_dir, true)?;
        mount_fs(
            "tmpfs",
            &dev_dir,
            "tmpfs",
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
            "size=64k,mode=755",
        )?;
        for device in DEVICES {
            let host = Path::new("/dev").join(device);
            let target = dev_dir.join(device);
            create_mount_point(&target, false)?;
            bind(&host, &target, BindMode::Device)?;
        }
        let links = [
            ("fd", "/proc/self/fd"),
            ("stdin", "/proc/self/fd/0"),
            ("stdout", "/proc/self/fd/1"),
            ("stderr", "/proc/self/fd/2"),
        ];
        for (name, link) in links {
            let _ = std::os::unix::fs::symlink(link, dev_dir.join(name));
        }
        Ok(())
    }

    fn mount_tmp(&self) -> Result<()> {
        let tmp_dir = self.target_in_root(Path::new("/tmp"));
        create_mount_point(&tmp_dir, true)?;
        mount_fs(
            "tmpfs",
            &tmp_dir,
            "tmpfs",
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            &format!("size={},mode=1777", self.tmp_size_bytes.max(4096)),
        )
    }

    /// pivot_root(".", ".") then lazily detach the old root stacked on top.
    fn pivot(&self) -> Result<()> {
        std::env::set_current_dir(&self.new_root).map_err(|e| {
            ExecError::Filesystem(format!("Failed to enter new root: {}", e))
        })?;
        nix::unistd::pivot_root(".", ".")
            .map_err(|e| ExecError::Filesystem(format!("pivot_root failed: {}", e)))?;
        umount2(".", MntFlags::MNT_DETACH)
            .map_err(|e| ExecError::Filesystem(format!("Failed to detach old root: {}", e)))?;
        std::env::set_current_dir("/")
            .map_err(|e| ExecError::Filesystem(format!("chdir / failed: {}", e)))?;

        mount(
            None::<&str>,
            "/",
            None::<&str>,
            MsFlags::MS_REMOUNT
                | MsFlags::MS_BIND
                | MsFlags::MS_RDONLY
                | MsFlags::MS_NOSUID
                | MsFlags::MS_NODEV,
            None::<&str>,
        )
        .map_err(|e| ExecError::Filesystem(format!("Failed to seal root read-only: {}", e)))
    }
}

fn create_mount_point(path: &Path, is_dir: bool) -> Result<()> {
    let res = if is_dir {
        fs::create_dir_all(path)
    } else {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map(|_| ())
    };
    res.map_err(|e| {
        ExecError::Filesystem(format!("Failed to create mount point {}: {}", path.display(), e))
    })
}

fn mount_fs(source: &str, target: &Path, fstype: &str, flags: MsFlags, data: &str) -> Result<()> {
    let data = if data.is_empty() { None } else { Some(data) };
    mount(Some(source), target, Some(fstype), flags, data).map_err(|e| {
        ExecError::Filesystem(format!(
            "Failed to mount {} on {}: {}",
            fstype,
            target.display(),
            e
        ))
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BindMode {
    ReadOnly,
    ReadWrite,
    /// Keeps device semantics (for /dev nodes)
    Device,
}

/// Recursive bind; per-mount flags need a second remount pass.
fn bind(source: &Path, target: &Path, mode: BindMode) -> Result<()> {
    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| {
        ExecError::Filesystem(format!(
            "Failed to bind {} to {}: {}",
            source.display(),
            target.display(),
            e
        ))
    })?;

    let mut flags = MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_NOSUID;
    match mode {
        BindMode::ReadOnly => flags |= MsFlags::MS_RDONLY | MsFlags::MS_NODEV,
        BindMode::ReadWrite => flags |= MsFlags::MS_NODEV,
        BindMode::Device => flags |= MsFlags::MS_NOEXEC,
    }
    mount(None::<&str>, target, None::<&str>, flags, None::<&str>).map_err(|e| {
        ExecError::Filesystem(format!("Failed to remount {}: {}", target.display(), e))
    })
}

/// Size-capped tmpfs backing a sandbox scratch area.
pub fn mount_scratch_tmpfs(path: &Path, size_bytes: u64) -> Result<()> {
    mount_fs(
        "tmpfs",
        path,
        "tmpfs",
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        &format!("size={},mode=711", size_bytes.max(4096)),
    )?;
    log::debug!("Mounted {} byte scratch tmpfs at {}", size_bytes, path.display());
    Ok(())
}

pub fn unmount_detach(path: &Path) -> Result<()> {
    umount2(path, MntFlags::MNT_DETACH)
        .map_err(|e| ExecError::Filesystem(format!("Failed to unmount {}: {}", path.display(), e)))
}

/// Whether `path` is a mount point according to /proc/self/mounts
pub fn is_mounted(path: &Path) -> bool {
    let Ok(mounts) = fs::read_to_string("/proc/self/mounts") else {
        return false;
    };
    let needle = path.to_string_lossy();
    mounts
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|mount_point| mount_point == needle)
}

/// Create a directory owned by the sandbox identity with a fixed mode.
pub fn create_owned_dir(path: &Path, uid: u32, gid: u32, mode: u32) -> Result<()> {
    fs::create_dir_all(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    nix::unistd::chown(
        path,
        Some(nix::unistd::Uid::from_raw(uid)),
        Some(nix::unistd::Gid::from_raw(gid)),
    )
    .map_err(|e| ExecError::Filesystem(format!("Failed to chown {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targets_land_under_new_root() {
        let fs = FilesystemSecurity::new(
            PathBuf::from("/run/execbox/abc/root"),
            PathBuf::from("/run/execbox/abc/work"),
            Vec::new(),
            1 << 20,
        );
        assert_eq!(
            fs.target_in_root(Path::new("/usr")),
            PathBuf::from("/run/execbox/abc/root/usr")
        );
        assert_eq!(
            fs.target_in_root(Path::new(SANDBOX_WORKDIR)),
            PathBuf::from("/run/execbox/abc/root/box")
        );
    }

    #[test]
    fn default_bindings_are_read_only() {
        let bindings = default_bindings();
        assert!(bindings.iter().all(|b| !b.writable));
        assert!(bindings.iter().any(|b| b.source == Path::new("/usr") && !b.maybe));
    }

    #[test]
    fn root_is_always_mounted() {
        assert!(is_mounted(Path::new("/")));
        assert!(!is_mounted(Path::new("/definitely/not/a/mount")));
    }
}
