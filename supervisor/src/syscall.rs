use core::fmt::{Display, Formatter};

// AUDIT_ARCH_* values from the seccomp_data arch field.
const AUDIT_ARCH_X86_64: u32 = 0xC000_003E;
const AUDIT_ARCH_AARCH64: u32 = 0xC000_00B7;
const AUDIT_ARCH_PPC64LE: u32 = 0xC000_0015;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuArch {
    X8664,
    Aarch64,
    Ppc64Le,
    Unknown,
}

impl CpuArch {
    pub fn host() -> Self {
        #[cfg(target_arch = "x86_64")]
        {
            CpuArch::X8664
        }
        #[cfg(target_arch = "aarch64")]
        {
            CpuArch::Aarch64
        }
        #[cfg(target_arch = "powerpc64")]
        {
            CpuArch::Ppc64Le
        }
        #[cfg(not(any(
            target_arch = "x86_64",
            target_arch = "aarch64",
            target_arch = "powerpc64"
        )))]
        {
            CpuArch::Unknown
        }
    }

    pub fn from_audit(arch: u32) -> Self {
        match arch {
            AUDIT_ARCH_X86_64 => CpuArch::X8664,
            AUDIT_ARCH_AARCH64 => CpuArch::Aarch64,
            AUDIT_ARCH_PPC64LE => CpuArch::Ppc64Le,
            _ => CpuArch::Unknown,
        }
    }
}

impl Display for CpuArch {
    fn fmt(&self, f: &mut Formatter) -> core::fmt::Result {
        let name = match self {
            CpuArch::X8664 => "x86_64",
            CpuArch::Aarch64 => "aarch64",
            CpuArch::Ppc64Le => "ppc64le",
            CpuArch::Unknown => "unknown",
        };
        write!(f, "{}", name)
    }
}

/// A single observed syscall: number, arguments and the context it was
/// issued from. Snapshots are immutable once taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Syscall {
    arch: CpuArch,
    nr: u64,
    args: [u64; 6],
    pid: libc::pid_t,
    stack_pointer: u64,
    instruction_pointer: u64,
}

impl Syscall {
    pub fn new(
        arch: CpuArch,
        nr: u64,
        args: [u64; 6],
        pid: libc::pid_t,
        stack_pointer: u64,
        instruction_pointer: u64,
    ) -> Self {
        Self {
            arch,
            nr,
            args,
            pid,
            stack_pointer,
            instruction_pointer,
        }
    }

    pub fn arch(&self) -> CpuArch {
        self.arch
    }

    pub fn nr(&self) -> u64 {
        self.nr
    }

    pub fn args(&self) -> [u64; 6] {
        self.args
    }

    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }

    pub fn stack_pointer(&self) -> u64 {
        self.stack_pointer
    }

    pub fn instruction_pointer(&self) -> u64 {
        self.instruction_pointer
    }

    /// Best-effort name of the syscall on the host architecture.
    pub fn name(&self) -> Option<&'static str> {
        if self.arch != CpuArch::host() {
            return None;
        }
        syscall_name(self.nr)
    }
}

impl Display for Syscall {
    fn fmt(&self, f: &mut Formatter) -> core::fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}(", name)?,
            None => write!(f, "syscall#{}/{}(", self.nr, self.arch)?,
        }
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{:#x}", arg)?;
        }
        write!(
            f,
            ") pid={} ip={:#x} sp={:#x}",
            self.pid, self.instruction_pointer, self.stack_pointer
        )
    }
}

// A small table covering the syscalls that show up in violation reports in
// practice. Anything else is rendered by number.
pub(crate) fn syscall_name(nr: u64) -> Option<&'static str> {
    let nr = nr as i64;
    let name = match nr {
        libc::SYS_read => "read",
        libc::SYS_write => "write",
        libc::SYS_close => "close",
        libc::SYS_openat => "openat",
        libc::SYS_mmap => "mmap",
        libc::SYS_mprotect => "mprotect",
        libc::SYS_munmap => "munmap",
        libc::SYS_brk => "brk",
        libc::SYS_ioctl => "ioctl",
        libc::SYS_socket => "socket",
        libc::SYS_connect => "connect",
        libc::SYS_bind => "bind",
        libc::SYS_listen => "listen",
        libc::SYS_accept => "accept",
        libc::SYS_sendto => "sendto",
        libc::SYS_recvfrom => "recvfrom",
        libc::SYS_sendmsg => "sendmsg",
        libc::SYS_recvmsg => "recvmsg",
        libc::SYS_clone => "clone",
        libc::SYS_execve => "execve",
        libc::SYS_exit => "exit",
        libc::SYS_exit_group => "exit_group",
        libc::SYS_wait4 => "wait4",
        libc::SYS_kill => "kill",
        libc::SYS_tgkill => "tgkill",
        libc::SYS_ptrace => "ptrace",
        libc::SYS_bpf => "bpf",
        libc::SYS_seccomp => "seccomp",
        libc::SYS_prctl => "prctl",
        libc::SYS_setns => "setns",
        libc::SYS_unshare => "unshare",
        libc::SYS_mount => "mount",
        libc::SYS_umount2 => "umount2",
        libc::SYS_pivot_root => "pivot_root",
        libc::SYS_chroot => "chroot",
        libc::SYS_reboot => "reboot",
        libc::SYS_init_module => "init_module",
        libc::SYS_delete_module => "delete_module",
        libc::SYS_kexec_load => "kexec_load",
        libc::SYS_process_vm_readv => "process_vm_readv",
        libc::SYS_process_vm_writev => "process_vm_writev",
        libc::SYS_perf_event_open => "perf_event_open",
        libc::SYS_getpid => "getpid",
        libc::SYS_getppid => "getppid",
        libc::SYS_gettid => "gettid",
        libc::SYS_getuid => "getuid",
        libc::SYS_geteuid => "geteuid",
        libc::SYS_setuid => "setuid",
        libc::SYS_setgid => "setgid",
        libc::SYS_capset => "capset",
        libc::SYS_capget => "capget",
        #[cfg(any(target_arch = "x86_64", target_arch = "powerpc64"))]
        libc::SYS_open => "open",
        #[cfg(any(target_arch = "x86_64", target_arch = "powerpc64"))]
        libc::SYS_fork => "fork",
        #[cfg(any(target_arch = "x86_64", target_arch = "powerpc64"))]
        libc::SYS_vfork => "vfork",
        #[cfg(any(target_arch = "x86_64", target_arch = "powerpc64"))]
        libc::SYS_access => "access",
        #[cfg(any(target_arch = "x86_64", target_arch = "powerpc64"))]
        libc::SYS_unlink => "unlink",
        _ => return None,
    };
    Some(name)
}
