//! Credential validation logic.

use crate::config::types::{ExecError, Result};

/// A sandbox identity must never be root.
pub fn validate_ids(uid: u32, gid: u32) -> Result<()> {
    if uid == 0 || gid == 0 {
        return Err(ExecError::Privilege(format!(
            "Cannot transition to root UID/GID (uid={}, gid={})",
            uid, gid
        )));
    }
    Ok(())
}
