//! Read-only capability introspection.
use super::PR_GET_NO_NEW_PRIVS;
use crate::config::types::{ExecError, Result};

/// Capability masks as reported by /proc/<pid>/status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilityStatus {
    pub inheritable: u64,
    pub permitted: u64,
    pub effective: u64,
    pub bounding: u64,
    pub ambient: u64,
}

impl CapabilityStatus {
    pub fn parse(status: &str) -> Self {
        let mut caps = CapabilityStatus::default();
        for line in status.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let Ok(mask) = u64::from_str_radix(value.trim(), 16) else {
                continue;
            };
            match key {
                "CapInh" => caps.inheritable = mask,
                "CapPrm" => caps.permitted = mask,
                "CapEff" => caps.effective = mask,
                "CapBnd" => caps.bounding = mask,
                "CapAmb" => caps.ambient = mask,
                _ => {}
            }
        }
        caps
    }

    pub fn is_fully_dropped(&self) -> bool {
        self.inheritable == 0
            && self.permitted == 0
            && self.effective == 0
            && self.bounding == 0
            && self.ambient == 0
    }
}

pub fn get_capability_status() -> Result<CapabilityStatus> {
    let status = std::fs::read_to_string("/proc/self/status")
        .map_err(|e| ExecError::Privilege(format!("Cannot read /proc/self/status: {}", e)))?;
    Ok(CapabilityStatus::parse(&status))
}

pub fn check_no_new_privs() -> bool {
    // SAFETY: PR_GET_NO_NEW_PRIVS only reads a flag.
    unsafe { libc::prctl(PR_GET_NO_NEW_PRIVS, 0, 0, 0, 0) == 1 }
}
