// The full pre-exec chain in its one legal order.

use execbox::core::types::ExecutionProfile;
use execbox::exec::preexec::{FreshChild, Sandbox};
use execbox::Result;

fn chain(profile: &ExecutionProfile) -> Result<()> {
    Sandbox::<FreshChild>::new("box".to_string(), true)
        .setup_namespaces(true)?
        .harden_mount_propagation()?
        .attach_to_cgroup(None)?
        .setup_root(None)?
        .apply_runtime_hygiene(profile)?
        .drop_credentials(Some((65534, 65534)))?
        .lock_privileges()?
        .enable_seccomp()?
        .exec_payload(&profile.command)
}

fn unfiltered(profile: &ExecutionProfile) -> Result<()> {
    Sandbox::<FreshChild>::new("box".to_string(), false)
        .setup_namespaces(false)?
        .harden_mount_propagation()?
        .attach_to_cgroup(None)?
        .setup_root(None)?
        .apply_runtime_hygiene(profile)?
        .drop_credentials(None)?
        .lock_privileges()?
        .without_seccomp()
        .exec_payload(&profile.command)
}

fn main() {
    // Type-checked only; running either chain would unshare this process.
    let _: [fn(&ExecutionProfile) -> Result<()>; 2] = [chain, unfiltered];
}
