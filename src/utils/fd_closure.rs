//! Inherited file descriptor closure: close_range(2) with a /proc/self/fd fallback.
use crate::config::types::{ExecError, Result};
use std::fs;
use std::os::unix::io::RawFd;

/// Close every descriptor numbered `first_fd` or above.
pub fn close_fds_from(first_fd: RawFd, strict_mode: bool) -> Result<()> {
    if try_close_range(first_fd) {
        return Ok(());
    }
    close_fds_via_proc(first_fd, strict_mode)
}

fn try_close_range(first_fd: RawFd) -> bool {
    // Same number on x86_64 and aarch64 (unified syscall table since 5.9)
    const SYS_CLOSE_RANGE: libc::c_long = 436;

    let rc = unsafe { libc::syscall(SYS_CLOSE_RANGE, first_fd as libc::c_uint, libc::c_uint::MAX, 0 as libc::c_uint) };
    rc == 0
}

fn close_fds_via_proc(first_fd: RawFd, strict_mode: bool) -> Result<()> {
    // Collect first; closing while iterating would close the directory handle itself.
    let fds: Vec<i32> = open_fds()?.into_iter().filter(|&fd| fd >= first_fd).collect();

    let mut failed = Vec::new();
    for fd in fds {
        match nix::unistd::close(fd) {
            Ok(()) | Err(nix::errno::Errno::EBADF) => {}
            Err(e) => failed.push(format!("fd {}: {}", fd, e)),
        }
    }

    if !failed.is_empty() {
        if strict_mode {
            return Err(ExecError::Filesystem(format!(
                "Failed to close inherited descriptors: {}",
                failed.join(", ")
            )));
        }
        log::warn!("Some inherited descriptors stayed open: {}", failed.join(", "));
    }
    Ok(())
}

pub fn open_fds() -> Result<Vec<i32>> {
    let entries = fs::read_dir("/proc/self/fd")
        .map_err(|e| ExecError::Filesystem(format!("Failed to read /proc/self/fd: {}", e)))?;

    let mut fds: Vec<i32> = entries
        .flatten()
        .filter_map(|entry| entry.file_name().to_str().and_then(|name| name.parse().ok()))
        .collect();
    fds.sort_unstable();
    Ok(fds)
}
