use crate::error::SupervisorError;
use crate::syscall::{CpuArch, Syscall};
use crate::util::last_os_error_code;
use core::mem;
use libc::c_void;

const NT_PRSTATUS: libc::c_ulong = 1;

// General-purpose register block as exported by PTRACE_GETREGSET with
// NT_PRSTATUS. Layouts mirror the kernel's user_regs_struct / pt_regs for
// each architecture.

#[cfg(target_arch = "x86_64")]
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct UserRegs {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub orig_rax: u64,
    pub rip: u64,
    pub cs: u64,
    pub eflags: u64,
    pub rsp: u64,
    pub ss: u64,
    pub fs_base: u64,
    pub gs_base: u64,
    pub ds: u64,
    pub es: u64,
    pub fs: u64,
    pub gs: u64,
}

#[cfg(target_arch = "aarch64")]
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct UserRegs {
    pub regs: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub pstate: u64,
}

#[cfg(target_arch = "powerpc64")]
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct UserRegs {
    pub gpr: [u64; 32],
    pub nip: u64,
    pub msr: u64,
    pub orig_gpr3: u64,
    pub ctr: u64,
    pub link: u64,
    pub xer: u64,
    pub ccr: u64,
    pub softe: u64,
    pub trap: u64,
    pub dar: u64,
    pub dsisr: u64,
    pub result: u64,
}

/// A register snapshot of a stopped tracee. Captured once, never mutated;
/// decoding the syscall slots allocates nothing.
#[derive(Debug, Clone, Copy)]
pub struct Regs {
    pid: libc::pid_t,
    arch: CpuArch,
    user: UserRegs,
}

impl Regs {
    /// Reads the register set of a ptrace-stopped process. A short
    /// register block (a tracee running in a compat personality) decodes
    /// as an unknown architecture.
    pub fn fetch(pid: libc::pid_t) -> Result<Self, SupervisorError> {
        let mut user: UserRegs = unsafe { mem::zeroed() };
        let mut iov = libc::iovec {
            iov_base: &mut user as *mut UserRegs as *mut c_void,
            iov_len: mem::size_of::<UserRegs>(),
        };
        let res = unsafe {
            libc::ptrace(
                libc::PTRACE_GETREGSET,
                pid,
                NT_PRSTATUS,
                &mut iov as *mut libc::iovec,
            )
        };
        if res != 0 {
            return Err(SupervisorError::OsOperationFailed {
                description: "ptrace(PTRACE_GETREGSET)",
                os_code: last_os_error_code(),
            });
        }
        let arch = if iov.iov_len == mem::size_of::<UserRegs>() {
            CpuArch::host()
        } else {
            CpuArch::Unknown
        };
        Ok(Self { pid, arch, user })
    }

    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }

    pub fn arch(&self) -> CpuArch {
        self.arch
    }

    pub fn syscall_number(&self) -> u64 {
        #[cfg(target_arch = "x86_64")]
        {
            self.user.orig_rax
        }
        #[cfg(target_arch = "aarch64")]
        {
            self.user.regs[8]
        }
        #[cfg(target_arch = "powerpc64")]
        {
            self.user.gpr[0]
        }
    }

    pub fn syscall_args(&self) -> [u64; 6] {
        #[cfg(target_arch = "x86_64")]
        {
            [
                self.user.rdi,
                self.user.rsi,
                self.user.rdx,
                self.user.r10,
                self.user.r8,
                self.user.r9,
            ]
        }
        #[cfg(target_arch = "aarch64")]
        {
            [
                self.user.regs[0],
                self.user.regs[1],
                self.user.regs[2],
                self.user.regs[3],
                self.user.regs[4],
                self.user.regs[5],
            ]
        }
        #[cfg(target_arch = "powerpc64")]
        {
            // gpr[3] is clobbered by the return value once the syscall
            // completes, orig_gpr3 always holds the first argument.
            [
                self.user.orig_gpr3,
                self.user.gpr[4],
                self.user.gpr[5],
                self.user.gpr[6],
                self.user.gpr[7],
                self.user.gpr[8],
            ]
        }
    }

    pub fn return_value(&self) -> u64 {
        #[cfg(target_arch = "x86_64")]
        {
            self.user.rax
        }
        #[cfg(target_arch = "aarch64")]
        {
            self.user.regs[0]
        }
        #[cfg(target_arch = "powerpc64")]
        {
            self.user.gpr[3]
        }
    }

    pub fn instruction_pointer(&self) -> u64 {
        #[cfg(target_arch = "x86_64")]
        {
            self.user.rip
        }
        #[cfg(target_arch = "aarch64")]
        {
            self.user.pc
        }
        #[cfg(target_arch = "powerpc64")]
        {
            self.user.nip
        }
    }

    pub fn stack_pointer(&self) -> u64 {
        #[cfg(target_arch = "x86_64")]
        {
            self.user.rsp
        }
        #[cfg(target_arch = "aarch64")]
        {
            self.user.sp
        }
        #[cfg(target_arch = "powerpc64")]
        {
            self.user.gpr[1]
        }
    }

    /// The frame chain anchor used by the stack unwinder: rbp on x86_64,
    /// x29 on aarch64, the back-chain stack pointer on ppc64le.
    pub fn frame_pointer(&self) -> u64 {
        #[cfg(target_arch = "x86_64")]
        {
            self.user.rbp
        }
        #[cfg(target_arch = "aarch64")]
        {
            self.user.regs[29]
        }
        #[cfg(target_arch = "powerpc64")]
        {
            self.user.gpr[1]
        }
    }

    pub fn to_syscall(&self) -> Syscall {
        Syscall::new(
            self.arch,
            self.syscall_number(),
            self.syscall_args(),
            self.pid,
            self.stack_pointer(),
            self.instruction_pointer(),
        )
    }

    #[cfg(test)]
    pub(crate) fn fake(pid: libc::pid_t, user: UserRegs) -> Self {
        Self {
            pid,
            arch: CpuArch::host(),
            user,
        }
    }
}
