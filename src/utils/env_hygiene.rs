//! Environment and permission hygiene for payload processes.
//! The payload environment is built from nothing: the host environment never leaks in.
use crate::config::types::{ExecError, Result};
use std::collections::BTreeMap;

pub const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
pub const SANDBOX_HOME: &str = "/tmp";

/// Loader variables a language adapter may never inject
const FORBIDDEN_VARS: &[&str] = &[
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "LD_AUDIT",
    "LD_BIND_NOW",
    "LD_DEBUG",
    "LD_PROFILE",
    "LD_USE_LOAD_BIAS",
    "LD_DYNAMIC_WEAK",
    "GCONV_PATH",
    "MALLOC_CHECK_",
];

#[derive(Debug, Clone)]
pub struct EnvPolicy {
    pub home: String,
    pub tmpdir: String,
    pub locale: String,
    pub strict_mode: bool,
}

impl Default for EnvPolicy {
    fn default() -> Self {
        EnvPolicy {
            home: SANDBOX_HOME.to_string(),
            tmpdir: "/tmp".to_string(),
            locale: "C.UTF-8".to_string(),
            strict_mode: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PermissionPolicy {
    pub umask: u32,
}

impl Default for PermissionPolicy {
    fn default() -> Self {
        PermissionPolicy { umask: 0o077 }
    }
}

pub struct EnvHygiene {
    env_policy: EnvPolicy,
    perm_policy: PermissionPolicy,
}

impl EnvHygiene {
    pub fn new(env_policy: EnvPolicy, perm_policy: PermissionPolicy) -> Self {
        EnvHygiene {
            env_policy,
            perm_policy,
        }
    }

    /// Deterministic base environment plus `extra` (language-specific variables).
    /// Forbidden loader variables are rejected in strict mode and dropped otherwise.
    pub fn build_environment(&self, extra: &[(String, String)]) -> Result<BTreeMap<String, String>> {
        let mut env_map = BTreeMap::new();
        env_map.insert("PATH".to_string(), SANDBOX_PATH.to_string());
        env_map.insert("HOME".to_string(), self.env_policy.home.clone());
        env_map.insert("LANG".to_string(), self.env_policy.locale.clone());
        env_map.insert("LC_ALL".to_string(), self.env_policy.locale.clone());
        env_map.insert("TMPDIR".to_string(), self.env_policy.tmpdir.clone());

        for (key, value) in extra {
            if FORBIDDEN_VARS.contains(&key.as_str()) {
                if self.env_policy.strict_mode {
                    return Err(ExecError::Config(format!(
                        "environment variable {} is not allowed in the sandbox",
                        key
                    )));
                }
                log::warn!("Dropping forbidden environment variable {}", key);
                continue;
            }
            env_map.insert(key.clone(), value.clone());
        }

        Ok(env_map)
    }

    pub fn apply_umask(&self) -> Result<()> {
        use nix::sys::stat::{umask, Mode};

        let mode = Mode::from_bits(self.perm_policy.umask)
            .ok_or_else(|| ExecError::Config(format!("Invalid umask: {:o}", self.perm_policy.umask)))?;
        umask(mode);
        Ok(())
    }
}
