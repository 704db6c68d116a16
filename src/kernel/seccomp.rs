//! Seccomp-BPF syscall filtering for payloads.
//!
//! Deny-list filter, installed last before execve:
//!
//! 1. Foreign architecture (or x32 ABI) -> kill
//! 2. `clone3` -> ENOSYS so libc falls back to `clone`
//! 3. `clone` with any `CLONE_NEW*` flag -> EPERM
//! 4. `socket` with `AF_NETLINK` or `SOCK_RAW` -> EPERM
//! 5. `ioctl` TIOCSTI / TIOCSETD / TIOCLINUX -> EPERM
//! 6. Mount, namespace, module, tracing, keyring and clock syscalls -> EPERM
//! 7. Everything else allowed; namespaces, cgroups and rlimits bound it.

use crate::config::types::{ExecError, Result};

const SECCOMP_SET_MODE_FILTER: libc::c_ulong = 1;
const SECCOMP_RET_KILL_PROCESS: u32 = 0x8000_0000;
const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;
const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;

// BPF instruction classes and fields
const BPF_LD: u16 = 0x00;
const BPF_ALU: u16 = 0x04;
const BPF_JMP: u16 = 0x05;
const BPF_RET: u16 = 0x06;
const BPF_W: u16 = 0x00;
const BPF_ABS: u16 = 0x20;
const BPF_AND: u16 = 0x50;
const BPF_JEQ: u16 = 0x10;
const BPF_JGE: u16 = 0x30;
const BPF_JSET: u16 = 0x40;
const BPF_K: u16 = 0x00;

#[cfg(target_arch = "x86_64")]
const AUDIT_ARCH_NATIVE: u32 = 0xc000_003e;
#[cfg(target_arch = "aarch64")]
const AUDIT_ARCH_NATIVE: u32 = 0xc000_00b7;
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("seccomp filter only supports x86_64 and aarch64");

const X32_SYSCALL_BIT: u32 = 0x4000_0000;

// seccomp_data offsets; args are read as their low 32 bits (little endian)
const OFFSET_SYSCALL_NR: u32 = 0;
const OFFSET_ARCH: u32 = 4;
const OFFSET_ARGS_0: u32 = 16;
const OFFSET_ARGS_1: u32 = 24;

const CLONE_NEWNS: u32 = 0x0002_0000;
const CLONE_NEWCGROUP: u32 = 0x0200_0000;
const CLONE_NEWUTS: u32 = 0x0400_0000;
const CLONE_NEWIPC: u32 = 0x0800_0000;
const CLONE_NEWUSER: u32 = 0x1000_0000;
const CLONE_NEWPID: u32 = 0x2000_0000;
const CLONE_NEWNET: u32 = 0x4000_0000;

pub const BLOCKED_CLONE_FLAGS: u32 = CLONE_NEWNS
    | CLONE_NEWCGROUP
    | CLONE_NEWUTS
    | CLONE_NEWIPC
    | CLONE_NEWUSER
    | CLONE_NEWPID
    | CLONE_NEWNET;

const AF_NETLINK: u32 = 16;
const SOCK_RAW: u32 = 3;
const SOCK_TYPE_MASK: u32 = 0xf;

const TIOCSTI: u32 = 0x5412;
const TIOCSETD: u32 = 0x5423;
const TIOCLINUX: u32 = 0x541c;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SockFilter {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

impl SockFilter {
    pub const fn stmt(code: u16, k: u32) -> Self {
        Self {
            code,
            jt: 0,
            jf: 0,
            k,
        }
    }

    pub const fn jump(code: u16, k: u32, jt: u8, jf: u8) -> Self {
        Self { code, jt, jf, k }
    }
}

#[repr(C)]
#[derive(Debug)]
struct SockFprog {
    len: u16,
    filter: *const SockFilter,
}

/// Syscalls refused with EPERM
pub fn denied_syscalls() -> Vec<i64> {
    let mut denied = vec![
        libc::SYS_mount,
        libc::SYS_umount2,
        libc::SYS_pivot_root,
        libc::SYS_chroot,
        libc::SYS_unshare,
        libc::SYS_setns,
        libc::SYS_ptrace,
        libc::SYS_process_vm_readv,
        libc::SYS_process_vm_writev,
        libc::SYS_kexec_load,
        libc::SYS_kexec_file_load,
        libc::SYS_init_module,
        libc::SYS_finit_module,
        libc::SYS_delete_module,
        libc::SYS_bpf,
        libc::SYS_perf_event_open,
        libc::SYS_userfaultfd,
        libc::SYS_keyctl,
        libc::SYS_add_key,
        libc::SYS_request_key,
        libc::SYS_swapon,
        libc::SYS_swapoff,
        libc::SYS_reboot,
        libc::SYS_acct,
        libc::SYS_quotactl,
        libc::SYS_open_by_handle_at,
        libc::SYS_name_to_handle_at,
        libc::SYS_settimeofday,
        libc::SYS_clock_settime,
        libc::SYS_clock_adjtime,
        libc::SYS_adjtimex,
        libc::SYS_sethostname,
        libc::SYS_setdomainname,
        libc::SYS_fsopen,
        libc::SYS_fsconfig,
        libc::SYS_fsmount,
        libc::SYS_fspick,
        libc::SYS_move_mount,
        libc::SYS_open_tree,
        libc::SYS_mount_setattr,
    ];
    #[cfg(target_arch = "x86_64")]
    denied.extend_from_slice(&[libc::SYS_iopl, libc::SYS_ioperm]);
    denied
}

fn offset(from: usize, to: usize) -> Result<u8> {
    let distance = to
        .checked_sub(from + 1)
        .ok_or_else(|| ExecError::Seccomp(format!("backward jump {} -> {}", from, to)))?;
    u8::try_from(distance)
        .map_err(|_| ExecError::Seccomp(format!("jump {} -> {} exceeds BPF range", from, to)))
}

/// Build the deny-list program.
pub fn build_filter(denied: &[i64]) -> Result<Vec<SockFilter>> {
    const HEADER: usize = 10;
    let n = denied.len();

    // Jump targets
    let allow = HEADER + n;
    let eperm = allow + 1;
    let enosys = allow + 2;
    let clone_handler = allow + 3;
    let socket_handler = clone_handler + 4;
    let ioctl_handler = socket_handler + 7;
    let total = ioctl_handler + 6;

    let mut f = Vec::with_capacity(total);

    // Architecture
    f.push(SockFilter::stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_ARCH));
    f.push(SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, AUDIT_ARCH_NATIVE, 1, 0));
    f.push(SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_KILL_PROCESS));

    // Syscall number; x32 ABI numbers share the x86_64 arch token
    f.push(SockFilter::stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_SYSCALL_NR));
    f.push(SockFilter::jump(BPF_JMP | BPF_JGE | BPF_K, X32_SYSCALL_BIT, 0, 1));
    f.push(SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_KILL_PROCESS));

    let dispatch = [
        (libc::SYS_clone3, enosys),
        (libc::SYS_clone, clone_handler),
        (libc::SYS_socket, socket_handler),
        (libc::SYS_ioctl, ioctl_handler),
    ];
    for (nr, target) in dispatch {
        let at = f.len();
        f.push(SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, nr as u32, offset(at, target)?, 0));
    }

    for &nr in denied {
        let at = f.len();
        f.push(SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, nr as u32, offset(at, eperm)?, 0));
    }

    let ret_allow = SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW);
    let ret_eperm = SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_ERRNO | libc::EPERM as u32);
    let ret_enosys = SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_ERRNO | libc::ENOSYS as u32);

    f.push(ret_allow);
    f.push(ret_eperm);
    f.push(ret_enosys);

    // clone: flags in args[0]
    f.push(SockFilter::stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_ARGS_0));
    f.push(SockFilter::jump(BPF_JMP | BPF_JSET | BPF_K, BLOCKED_CLONE_FLAGS, 1, 0));
    f.push(ret_allow);
    f.push(ret_eperm);

    // socket: domain in args[0], type (with SOCK_NONBLOCK/SOCK_CLOEXEC bits) in args[1]
    f.push(SockFilter::stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_ARGS_0));
    f.push(SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, AF_NETLINK, 4, 0));
    f.push(SockFilter::stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_ARGS_1));
    f.push(SockFilter::stmt(BPF_ALU | BPF_AND | BPF_K, SOCK_TYPE_MASK));
    f.push(SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, SOCK_RAW, 1, 0));
    f.push(ret_allow);
    f.push(ret_eperm);

    // ioctl: request in args[1]
    f.push(SockFilter::stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_ARGS_1));
    f.push(SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, TIOCSTI, 3, 0));
    f.push(SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, TIOCSETD, 2, 0));
    f.push(SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, TIOCLINUX, 1, 0));
    f.push(ret_allow);
    f.push(ret_eperm);

    debug_assert_eq!(f.len(), total);
    Ok(f)
}

/// Install `filter` on the calling thread. Irreversible.
pub fn install_filter(filter: &[SockFilter]) -> Result<()> {
    let len = u16::try_from(filter.len())
        .map_err(|_| ExecError::Seccomp("filter too long".to_string()))?;
    let prog = SockFprog {
        len,
        filter: filter.as_ptr(),
    };

    // SAFETY: PR_SET_NO_NEW_PRIVS is idempotent; seccomp(2) requires it for unprivileged callers.
    if unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1 as libc::c_ulong, 0, 0, 0) } != 0 {
        return Err(ExecError::Seccomp(format!(
            "PR_SET_NO_NEW_PRIVS failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    // SAFETY: prog points at `filter`, which outlives the call; the kernel copies it.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_seccomp,
            SECCOMP_SET_MODE_FILTER,
            0 as libc::c_ulong,
            &prog as *const SockFprog,
        )
    };
    if rc != 0 {
        return Err(ExecError::Seccomp(format!(
            "seccomp(SET_MODE_FILTER) failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Build and install the default payload filter.
pub fn apply_default_filter() -> Result<()> {
    let filter = build_filter(&denied_syscalls())?;
    install_filter(&filter)
}

pub fn seccomp_available() -> bool {
    // SAFETY: PR_GET_SECCOMP only reads the current mode.
    unsafe { libc::prctl(libc::PR_GET_SECCOMP, 0, 0, 0, 0) >= 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ret_value(f: &SockFilter) -> Option<u32> {
        (f.code == BPF_RET | BPF_K).then_some(f.k)
    }

    /// Follow the true branch of the jump at `at`.
    fn target_of(filter: &[SockFilter], at: usize) -> &SockFilter {
        &filter[at + 1 + filter[at].jt as usize]
    }

    #[test]
    fn filter_structure() {
        let denied = [libc::SYS_mount, libc::SYS_ptrace];
        let filter = build_filter(&denied).unwrap();
        // 10 header + 2 denied + 3 returns + 4 clone + 7 socket + 6 ioctl
        assert_eq!(filter.len(), 32);
    }

    #[test]
    fn foreign_arch_is_killed() {
        let filter = build_filter(&denied_syscalls()).unwrap();
        assert_eq!(filter[1].k, AUDIT_ARCH_NATIVE);
        assert_eq!(ret_value(&filter[2]), Some(SECCOMP_RET_KILL_PROCESS));
    }

    #[test]
    fn clone3_returns_enosys() {
        let filter = build_filter(&denied_syscalls()).unwrap();
        assert_eq!(filter[6].k, libc::SYS_clone3 as u32);
        assert_eq!(
            ret_value(target_of(&filter, 6)),
            Some(SECCOMP_RET_ERRNO | libc::ENOSYS as u32)
        );
    }

    #[test]
    fn denied_syscalls_return_eperm() {
        let denied = denied_syscalls();
        let filter = build_filter(&denied).unwrap();
        for i in 0..denied.len() {
            let at = 10 + i;
            assert_eq!(filter[at].k, denied[i] as u32);
            assert_eq!(
                ret_value(target_of(&filter, at)),
                Some(SECCOMP_RET_ERRNO | libc::EPERM as u32)
            );
        }
    }

    #[test]
    fn clone_handler_checks_namespace_flags() {
        let filter = build_filter(&denied_syscalls()).unwrap();
        assert_eq!(filter[7].k, libc::SYS_clone as u32);
        let handler = 7 + 1 + filter[7].jt as usize;
        assert_eq!(filter[handler].k, OFFSET_ARGS_0);
        assert_eq!(filter[handler + 1].code, BPF_JMP | BPF_JSET | BPF_K);
        assert_eq!(filter[handler + 1].k, BLOCKED_CLONE_FLAGS);
    }

    #[test]
    fn socket_handler_masks_type_flags() {
        let filter = build_filter(&denied_syscalls()).unwrap();
        assert_eq!(filter[8].k, libc::SYS_socket as u32);
        let handler = 8 + 1 + filter[8].jt as usize;
        assert_eq!(filter[handler + 3].code, BPF_ALU | BPF_AND | BPF_K);
        // netlink branch lands on EPERM
        assert_eq!(
            ret_value(target_of(&filter, handler + 1)),
            Some(SECCOMP_RET_ERRNO | libc::EPERM as u32)
        );
    }

    #[test]
    fn ioctl_handler_blocks_tty_injection() {
        let filter = build_filter(&denied_syscalls()).unwrap();
        assert_eq!(filter[9].k, libc::SYS_ioctl as u32);
        let handler = 9 + 1 + filter[9].jt as usize;
        for at in handler + 1..handler + 4 {
            assert_eq!(
                ret_value(target_of(&filter, at)),
                Some(SECCOMP_RET_ERRNO | libc::EPERM as u32)
            );
        }
    }

    #[test]
    fn blocked_clone_flags_mask() {
        assert_ne!(BLOCKED_CLONE_FLAGS & CLONE_NEWUSER, 0);
        assert_ne!(BLOCKED_CLONE_FLAGS & CLONE_NEWNET, 0);
        assert_eq!(BLOCKED_CLONE_FLAGS & 0x0000_0100, 0); // CLONE_VM stays allowed
    }
}
