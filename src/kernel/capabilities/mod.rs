//! Capability teardown for the payload and read-back checks that it stuck.

mod drop;
mod query;

pub use drop::{clear_process_capabilities, drop_bounding_and_ambient, set_no_new_privs};
pub use query::{check_no_new_privs, get_capability_status, CapabilityStatus};

/// Highest capability number swept when clearing the bounding set
pub(crate) const LAST_CAP: u32 = 40;

pub(crate) const PR_CAPBSET_DROP: libc::c_int = 24;
pub(crate) const PR_SET_NO_NEW_PRIVS: libc::c_int = 38;
pub(crate) const PR_GET_NO_NEW_PRIVS: libc::c_int = 39;
pub(crate) const PR_CAP_AMBIENT: libc::c_int = 47;
pub(crate) const PR_CAP_AMBIENT_CLEAR_ALL: libc::c_int = 4;
pub(crate) const LINUX_CAPABILITY_VERSION_3: u32 = 0x20080522;
