//! UID/GID transitions for privilege dropping.
//!
//! setresgid must run before setresuid: once the uid is gone the gid can no
//! longer be changed.

mod transition;
mod validation;

pub use transition::transition_to_unprivileged;
pub use validation::validate_ids;
