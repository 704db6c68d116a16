//! Capability removal. The bounding set can only be shrunk while CAP_SETPCAP is
//! still held, so [`drop_bounding_and_ambient`] runs before the uid transition
//! and [`clear_process_capabilities`] after it.
use super::{
    LAST_CAP, LINUX_CAPABILITY_VERSION_3, PR_CAPBSET_DROP, PR_CAP_AMBIENT,
    PR_CAP_AMBIENT_CLEAR_ALL, PR_SET_NO_NEW_PRIVS,
};
use crate::config::types::{ExecError, Result};

#[cfg(target_arch = "x86_64")]
const SYS_CAPSET: libc::c_long = 126;
#[cfg(target_arch = "aarch64")]
const SYS_CAPSET: libc::c_long = 91;
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("SYS_capset number not defined for this architecture");

pub fn drop_bounding_and_ambient() -> Result<()> {
    for cap in 0..=LAST_CAP {
        // SAFETY: prctl(PR_CAPBSET_DROP) with any cap number is safe; unknown caps return EINVAL.
        let rc = unsafe { libc::prctl(PR_CAPBSET_DROP, cap as libc::c_ulong, 0, 0, 0) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINVAL) {
                return Err(ExecError::Privilege(format!(
                    "Failed to drop capability {} from bounding set: {}",
                    cap, err
                )));
            }
        }
    }

    // SAFETY: clearing the ambient set has no preconditions.
    let rc = unsafe { libc::prctl(PR_CAP_AMBIENT, PR_CAP_AMBIENT_CLEAR_ALL as libc::c_ulong, 0, 0, 0) };
    if rc != 0 {
        log::debug!(
            "Failed to clear ambient capabilities: {}",
            std::io::Error::last_os_error()
        );
    }
    Ok(())
}

/// Zero effective, permitted and inheritable via raw capset(2).
pub fn clear_process_capabilities() -> Result<()> {
    #[repr(C)]
    struct CapUserHeader {
        version: u32,
        pid: i32,
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    struct CapUserData {
        effective: u32,
        permitted: u32,
        inheritable: u32,
    }

    let header = CapUserHeader {
        version: LINUX_CAPABILITY_VERSION_3,
        pid: 0,
    };
    // Version 3 takes two entries: caps 0-31 and 32-63.
    let data = [CapUserData {
        effective: 0,
        permitted: 0,
        inheritable: 0,
    }; 2];

    // SAFETY: valid v3 header for the calling thread and two initialized data entries.
    let rc = unsafe {
        libc::syscall(
            SYS_CAPSET,
            &header as *const CapUserHeader,
            data.as_ptr(),
        )
    };
    if rc != 0 {
        return Err(ExecError::Privilege(format!(
            "capset failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Prevent privilege gain through execve (setuid bits, file capabilities).
/// Irreversible once set.
pub fn set_no_new_privs() -> Result<()> {
    // SAFETY: prctl(PR_SET_NO_NEW_PRIVS, 1) is safe and idempotent.
    let rc = unsafe { libc::prctl(PR_SET_NO_NEW_PRIVS, 1 as libc::c_ulong, 0, 0, 0) };
    if rc != 0 {
        return Err(ExecError::Privilege(format!(
            "Failed to set PR_SET_NO_NEW_PRIVS: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}
