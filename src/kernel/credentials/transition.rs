//! Irreversible transition to the sandbox identity.

use super::validation::validate_ids;
use crate::config::types::{ExecError, Result};
use nix::unistd::{getegid, geteuid, getgid, getgroups, getuid, setgroups, Gid, Uid};

/// validate -> clear groups -> setresgid -> setresuid -> verify.
pub fn transition_to_unprivileged(uid: u32, gid: u32) -> Result<()> {
    validate_ids(uid, gid)?;

    setgroups(&[]).map_err(|e| {
        ExecError::Privilege(format!("Failed to clear supplementary groups: {}", e))
    })?;

    let gid = Gid::from_raw(gid);
    nix::unistd::setresgid(gid, gid, gid)
        .map_err(|e| ExecError::Privilege(format!("Failed to setresgid({}): {}", gid, e)))?;

    let uid = Uid::from_raw(uid);
    nix::unistd::setresuid(uid, uid, uid)
        .map_err(|e| ExecError::Privilege(format!("Failed to setresuid({}): {}", uid, e)))?;

    verify_transition(uid, gid)
}

fn verify_transition(expected_uid: Uid, expected_gid: Gid) -> Result<()> {
    if getuid() != expected_uid || geteuid() != expected_uid {
        return Err(ExecError::Privilege(format!(
            "UID verification failed: expected {}, got real={}, effective={}",
            expected_uid,
            getuid(),
            geteuid()
        )));
    }
    if getgid() != expected_gid || getegid() != expected_gid {
        return Err(ExecError::Privilege(format!(
            "GID verification failed: expected {}, got real={}, effective={}",
            expected_gid,
            getgid(),
            getegid()
        )));
    }
    if getgroups().map(|groups| !groups.is_empty()).unwrap_or(true) {
        return Err(ExecError::Privilege(
            "Supplementary groups still present after transition".to_string(),
        ));
    }
    // Regaining root must now be impossible
    if nix::unistd::setuid(Uid::from_raw(0)).is_ok() {
        return Err(ExecError::Privilege("setuid(0) succeeded after drop".to_string()));
    }
    Ok(())
}
