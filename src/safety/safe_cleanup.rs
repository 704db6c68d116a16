//! Symlink-safe recursive removal for sandbox scratch trees.
//!
//! The tree was writable by untrusted code, so it may contain symlinks pointing
//! anywhere on the host. Every step goes through directory fds with O_NOFOLLOW /
//! AT_SYMLINK_NOFOLLOW, and descent stops at filesystem boundaries.
use crate::config::types::{ExecError, Result};
use std::ffi::{CStr, CString};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

const DIR_FLAGS: libc::c_int = libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC | libc::O_NOFOLLOW;

fn last_os_error(context: impl std::fmt::Display) -> ExecError {
    ExecError::Filesystem(format!("{}: {}", context, std::io::Error::last_os_error()))
}

fn c_path(bytes: &[u8], shown: &Path) -> Result<CString> {
    CString::new(bytes).map_err(|_| {
        ExecError::Filesystem(format!("Path contains NUL byte: {}", shown.display()))
    })
}

fn open_dir_nofollow(path: &Path) -> Result<OwnedFd> {
    let path_c = c_path(path.as_os_str().as_bytes(), path)?;
    let fd = unsafe { libc::open(path_c.as_ptr(), DIR_FLAGS) };
    if fd < 0 {
        return Err(last_os_error(format_args!("open {}", path.display())));
    }
    // SAFETY: fd was just returned by open(2) and is owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn openat_dir_nofollow(parent: RawFd, name: &CStr) -> Result<OwnedFd> {
    let fd = unsafe { libc::openat(parent, name.as_ptr(), DIR_FLAGS) };
    if fd < 0 {
        return Err(last_os_error(format_args!("openat {:?}", name)));
    }
    // SAFETY: as above.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn fstatat_nofollow(parent: RawFd, name: &CStr) -> Result<libc::stat> {
    let mut st = std::mem::MaybeUninit::<libc::stat>::zeroed();
    let rc = unsafe { libc::fstatat(parent, name.as_ptr(), st.as_mut_ptr(), libc::AT_SYMLINK_NOFOLLOW) };
    if rc != 0 {
        return Err(last_os_error(format_args!("fstatat {:?}", name)));
    }
    // SAFETY: fstatat succeeded and filled the buffer.
    Ok(unsafe { st.assume_init() })
}

fn unlink_at(parent: RawFd, name: &CStr, flags: libc::c_int) -> Result<()> {
    if unsafe { libc::unlinkat(parent, name.as_ptr(), flags) } != 0 {
        return Err(last_os_error(format_args!("unlinkat {:?}", name)));
    }
    Ok(())
}

/// Names in a directory, excluding `.` and `..`. Collected up front so the
/// directory stream is closed before anything is unlinked.
fn list_dir(dir: &OwnedFd) -> Result<Vec<CString>> {
    let iter_fd = unsafe { libc::dup(dir.as_raw_fd()) };
    if iter_fd < 0 {
        return Err(last_os_error("dup for directory listing"));
    }
    let stream = unsafe { libc::fdopendir(iter_fd) };
    if stream.is_null() {
        unsafe { libc::close(iter_fd) };
        return Err(last_os_error("fdopendir"));
    }
    // readdir continues from the shared offset of the dup'd descriptor
    unsafe { libc::rewinddir(stream) };

    let mut names = Vec::new();
    let result = loop {
        unsafe { *libc::__errno_location() = 0 };
        let entry = unsafe { libc::readdir(stream) };
        if entry.is_null() {
            let errno = unsafe { *libc::__errno_location() };
            break if errno == 0 {
                Ok(())
            } else {
                Err(ExecError::Filesystem(format!(
                    "readdir failed: {}",
                    std::io::Error::from_raw_os_error(errno)
                )))
            };
        }
        let name = unsafe { CStr::from_ptr((*entry).d_name.as_ptr()) };
        if name.to_bytes() != b"." && name.to_bytes() != b".." {
            names.push(name.to_owned());
        }
    };
    unsafe { libc::closedir(stream) };
    result.map(|_| names)
}

fn remove_contents(dir: &OwnedFd, root_dev: libc::dev_t) -> Result<()> {
    for name in list_dir(dir)? {
        let st = fstatat_nofollow(dir.as_raw_fd(), &name)?;
        if st.st_mode & libc::S_IFMT == libc::S_IFDIR {
            if st.st_dev != root_dev {
                return Err(ExecError::Filesystem(format!(
                    "Refusing to cross filesystem boundary at {:?}",
                    name
                )));
            }
            let child = openat_dir_nofollow(dir.as_raw_fd(), &name)?;
            remove_contents(&child, root_dev)?;
            drop(child);
            unlink_at(dir.as_raw_fd(), &name, libc::AT_REMOVEDIR)?;
        } else {
            unlink_at(dir.as_raw_fd(), &name, 0)?;
        }
    }
    Ok(())
}

/// Remove `path` and everything below it without following symlinks.
/// A missing path is success. Mount points inside the tree must be unmounted first.
pub fn remove_tree_secure(path: &Path) -> Result<()> {
    if std::fs::symlink_metadata(path).is_err() {
        return Ok(());
    }

    let parent = path.parent().ok_or_else(|| {
        ExecError::Filesystem(format!("Cannot remove path without parent: {}", path.display()))
    })?;
    let name = path.file_name().ok_or_else(|| {
        ExecError::Filesystem(format!("Cannot remove path without file name: {}", path.display()))
    })?;
    let name = c_path(name.as_bytes(), path)?;

    let parent_fd = open_dir_nofollow(parent)?;
    let st = fstatat_nofollow(parent_fd.as_raw_fd(), &name)?;
    if st.st_mode & libc::S_IFMT == libc::S_IFDIR {
        let dir = openat_dir_nofollow(parent_fd.as_raw_fd(), &name)?;
        remove_contents(&dir, st.st_dev)?;
        drop(dir);
        unlink_at(parent_fd.as_raw_fd(), &name, libc::AT_REMOVEDIR)
    } else {
        unlink_at(parent_fd.as_raw_fd(), &name, 0)
    }
}
