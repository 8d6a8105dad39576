//! Seccomp plumbing shared by both monitor variants: return-action
//! constants, the user-notification ioctl surface, and the filter rewrite
//! turning a trace policy into a user-notify policy.

use crate::error::SupervisorError;
use crate::util::last_os_error_code;
use core::mem;
use libc::{c_int, sock_filter};

pub const SECCOMP_RET_KILL: u32 = 0x0000_0000;
pub const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;
pub const SECCOMP_RET_USER_NOTIF: u32 = 0x7fc0_0000;
pub const SECCOMP_RET_TRACE: u32 = 0x7ff0_0000;
pub const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;
pub const SECCOMP_RET_ACTION_FULL: u32 = 0xffff_0000;
pub const SECCOMP_RET_DATA: u32 = 0x0000_ffff;

pub const SECCOMP_USER_NOTIF_FLAG_CONTINUE: u32 = 1;
const SECCOMP_GET_NOTIF_SIZES: libc::c_long = 3;

// Classic BPF opcode pieces, enough to assemble seccomp filters.
pub const BPF_LD: u16 = 0x00;
pub const BPF_W: u16 = 0x00;
pub const BPF_ABS: u16 = 0x20;
pub const BPF_JMP: u16 = 0x05;
pub const BPF_JEQ: u16 = 0x10;
pub const BPF_K: u16 = 0x00;
pub const BPF_RET: u16 = 0x06;

pub fn bpf_stmt(code: u16, k: u32) -> sock_filter {
    sock_filter {
        code,
        jt: 0,
        jf: 0,
        k,
    }
}

pub fn bpf_jump(code: u16, k: u32, jt: u8, jf: u8) -> sock_filter {
    sock_filter { code, jt, jf, k }
}

/// Byte offset of the syscall number in struct seccomp_data.
pub const SECCOMP_DATA_NR_OFFSET: u32 = 0;

// ioctl request encoding. The direction/size packing differs on powerpc.
#[cfg(not(target_arch = "powerpc64"))]
mod ioc {
    pub const WRITE: u64 = 1;
    pub const READ: u64 = 2;
    pub const SIZE_SHIFT: u64 = 16;
    pub const DIR_SHIFT: u64 = 30;
}

#[cfg(target_arch = "powerpc64")]
mod ioc {
    pub const WRITE: u64 = 4;
    pub const READ: u64 = 2;
    pub const SIZE_SHIFT: u64 = 16;
    pub const DIR_SHIFT: u64 = 29;
}

const SECCOMP_IOC_MAGIC: u64 = b'!' as u64;

const fn seccomp_ioc(dir: u64, nr: u64, size: u64) -> u64 {
    (dir << ioc::DIR_SHIFT) | (size << ioc::SIZE_SHIFT) | (SECCOMP_IOC_MAGIC << 8) | nr
}

pub const SECCOMP_IOCTL_NOTIF_RECV: u64 = seccomp_ioc(
    ioc::READ | ioc::WRITE,
    0,
    mem::size_of::<SeccompNotif>() as u64,
);
pub const SECCOMP_IOCTL_NOTIF_SEND: u64 = seccomp_ioc(
    ioc::READ | ioc::WRITE,
    1,
    mem::size_of::<SeccompNotifResp>() as u64,
);
pub const SECCOMP_IOCTL_NOTIF_ID_VALID: u64 =
    seccomp_ioc(ioc::WRITE, 2, mem::size_of::<u64>() as u64);
#[allow(dead_code)]
pub const SECCOMP_IOCTL_NOTIF_ADDFD: u64 = seccomp_ioc(ioc::WRITE, 3, 24);

/// Mirrors kernel struct seccomp_data.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SeccompData {
    pub nr: i32,
    pub arch: u32,
    pub instruction_pointer: u64,
    pub args: [u64; 6],
}

/// Mirrors kernel struct seccomp_notif.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SeccompNotif {
    pub id: u64,
    pub pid: u32,
    pub flags: u32,
    pub data: SeccompData,
}

/// Mirrors kernel struct seccomp_notif_resp.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SeccompNotifResp {
    pub id: u64,
    pub val: i64,
    pub error: i32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct SeccompNotifSizes {
    seccomp_notif: u16,
    seccomp_notif_resp: u16,
    seccomp_data: u16,
}

fn seccomp_syscall(operation: libc::c_long, flags: libc::c_long, args: *mut libc::c_void) -> i64 {
    unsafe { libc::syscall(libc::SYS_seccomp, operation, flags, args) as i64 }
}

/// Size-probed, 8-aligned buffers for the notification ioctls. The kernel
/// may use larger structures than the ones this build knows about, so the
/// probed sizes win when they are bigger.
pub(crate) struct NotifBuffers {
    req_words: Vec<u64>,
    resp_words: Vec<u64>,
}

impl NotifBuffers {
    pub fn new() -> Result<Self, SupervisorError> {
        let mut sizes = SeccompNotifSizes::default();
        if seccomp_syscall(
            SECCOMP_GET_NOTIF_SIZES,
            0,
            &mut sizes as *mut SeccompNotifSizes as *mut libc::c_void,
        ) != 0
        {
            return Err(SupervisorError::KernelFeatureUnavailable {
                description: "seccomp(SECCOMP_GET_NOTIF_SIZES)",
            });
        }
        let req_bytes = usize::max(sizes.seccomp_notif as usize, mem::size_of::<SeccompNotif>());
        let resp_bytes = usize::max(
            sizes.seccomp_notif_resp as usize,
            mem::size_of::<SeccompNotifResp>(),
        );
        Ok(Self {
            req_words: vec![0u64; (req_bytes + 7) / 8],
            resp_words: vec![0u64; (resp_bytes + 7) / 8],
        })
    }

    /// Receives one pending notification. The error value is the raw errno
    /// (ENOENT means the requesting task died in the meantime).
    pub fn recv(&mut self, fd: c_int) -> Result<SeccompNotif, i64> {
        // The kernel requires the request buffer to be zeroed.
        self.req_words.iter_mut().for_each(|w| *w = 0);
        let res = unsafe {
            libc::ioctl(
                fd,
                SECCOMP_IOCTL_NOTIF_RECV as _,
                self.req_words.as_mut_ptr(),
            )
        };
        if res != 0 {
            return Err(last_os_error_code());
        }
        Ok(unsafe { core::ptr::read(self.req_words.as_ptr() as *const SeccompNotif) })
    }

    pub fn send(&mut self, fd: c_int, resp: &SeccompNotifResp) -> Result<(), i64> {
        self.resp_words.iter_mut().for_each(|w| *w = 0);
        unsafe {
            core::ptr::write(self.resp_words.as_mut_ptr() as *mut SeccompNotifResp, *resp);
        }
        let res = unsafe {
            libc::ioctl(
                fd,
                SECCOMP_IOCTL_NOTIF_SEND as _,
                self.resp_words.as_ptr(),
            )
        };
        if res != 0 {
            return Err(last_os_error_code());
        }
        Ok(())
    }
}

/// Checks that a notification id still refers to a live request. Guards
/// the gap between receiving a notification and acting on it.
pub(crate) fn notif_id_valid(fd: c_int, id: u64) -> bool {
    unsafe { libc::ioctl(fd, SECCOMP_IOCTL_NOTIF_ID_VALID as _, &id as *const u64) == 0 }
}

/// Rewrites a trace-oriented policy for the notify monitor: every
/// BPF_RET|BPF_K instruction returning RET_KILL or RET_TRACE (with any
/// data bits) becomes RET_USER_NOTIF, everything else is untouched.
pub(crate) fn rewrite_filter_for_user_notif(filter: &[sock_filter]) -> Vec<sock_filter> {
    filter
        .iter()
        .map(|insn| {
            let is_ret = insn.code == (BPF_RET | BPF_K);
            let action = insn.k & SECCOMP_RET_ACTION_FULL;
            if is_ret && (insn.k == SECCOMP_RET_KILL || action == SECCOMP_RET_TRACE) {
                sock_filter {
                    code: insn.code,
                    jt: insn.jt,
                    jf: insn.jf,
                    k: SECCOMP_RET_USER_NOTIF,
                }
            } else {
                *insn
            }
        })
        .collect()
}
