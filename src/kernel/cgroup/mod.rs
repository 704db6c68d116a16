//! Resource governance through cgroup v2.
//!
//! One child cgroup per sandbox under a service-owned root. The payload attaches
//! itself; the proxy never joins, so `cgroup.kill` only reaches untrusted code.

pub mod v2;

pub use v2::{attach_current_process, CgroupEvidence, CgroupV2};
