//! Best-effort stack traces of a stopped sandboxee: a frame-pointer walk
//! through the tracee's memory, symbolized to module+offset using
//! /proc/pid/maps. Collection failures are reported, never fatal.

use crate::error::SupervisorError;
use crate::regs::Regs;
use crate::util::last_os_error_code;
use core::mem;
use libc::c_void;
use log::debug;

const MAX_FRAMES: usize = 64;

#[derive(Debug)]
struct MapEntry {
    start: u64,
    end: u64,
    offset: u64,
    path: String,
}

fn parse_maps(pid: libc::pid_t) -> Result<Vec<MapEntry>, SupervisorError> {
    let content = std::fs::read_to_string(format!("/proc/{}/maps", pid)).map_err(|e| {
        SupervisorError::OsOperationFailed {
            description: "read(/proc/pid/maps)",
            os_code: e.raw_os_error().unwrap_or(0) as i64,
        }
    })?;
    let mut entries = Vec::new();
    for line in content.lines() {
        // ADDR_START-ADDR_END PERMS OFFSET DEV INODE PATH
        let mut fields = line.split_whitespace();
        let range = match fields.next() {
            Some(r) => r,
            None => continue,
        };
        let perms = fields.next().unwrap_or("");
        let offset = fields.next().unwrap_or("0");
        let _dev = fields.next();
        let _inode = fields.next();
        let path = fields.next().unwrap_or("").to_owned();
        if !perms.contains('x') {
            continue;
        }
        let (start, end) = match range.split_once('-') {
            Some(pair) => pair,
            None => continue,
        };
        let (start, end, offset) = match (
            u64::from_str_radix(start, 16),
            u64::from_str_radix(end, 16),
            u64::from_str_radix(offset, 16),
        ) {
            (Ok(s), Ok(e), Ok(o)) => (s, e, o),
            _ => continue,
        };
        entries.push(MapEntry {
            start,
            end,
            offset,
            path,
        });
    }
    Ok(entries)
}

// Reads one word of the tracee's memory without going through ptrace
// PEEKDATA, one syscall per word is enough at 64 frames max.
fn read_word(pid: libc::pid_t, addr: u64) -> Option<u64> {
    if addr == 0 || addr % mem::size_of::<u64>() as u64 != 0 {
        return None;
    }
    let mut word: u64 = 0;
    let local = libc::iovec {
        iov_base: &mut word as *mut u64 as *mut c_void,
        iov_len: mem::size_of::<u64>(),
    };
    let remote = libc::iovec {
        iov_base: addr as *mut c_void,
        iov_len: mem::size_of::<u64>(),
    };
    let res = unsafe { libc::process_vm_readv(pid, &local, 1, &remote, 1, 0) };
    if res == mem::size_of::<u64>() as isize {
        Some(word)
    } else {
        None
    }
}

fn symbolize(maps: &[MapEntry], addr: u64) -> String {
    for entry in maps {
        if addr >= entry.start && addr < entry.end {
            let name = if entry.path.is_empty() {
                "anonymous"
            } else {
                &entry.path
            };
            return format!("{}+{:#x}", name, addr - entry.start + entry.offset);
        }
    }
    format!("{:#x}", addr)
}

/// Unwinds the stack of a ptrace-stopped process starting from a register
/// snapshot. x86_64 and aarch64 walk the saved frame-pointer chain
/// ([fp] = previous fp, [fp+8] = return address); ppc64le follows the
/// stack back-chain with the saved LR at +16.
pub(crate) fn collect_stack_trace(
    pid: libc::pid_t,
    regs: &Regs,
) -> Result<Vec<String>, SupervisorError> {
    let maps = parse_maps(pid)?;
    let mut frames = Vec::new();
    frames.push(symbolize(&maps, regs.instruction_pointer()));

    #[cfg(not(target_arch = "powerpc64"))]
    {
        let mut fp = regs.frame_pointer();
        for _ in 0..MAX_FRAMES {
            let ret = match read_word(pid, fp.wrapping_add(8)) {
                Some(addr) if addr != 0 => addr,
                _ => break,
            };
            frames.push(symbolize(&maps, ret));
            fp = match read_word(pid, fp) {
                // Frame pointers must move up the stack, anything else is
                // a corrupt or finished chain.
                Some(next) if next > fp => next,
                _ => break,
            };
        }
    }

    #[cfg(target_arch = "powerpc64")]
    {
        let mut sp = regs.stack_pointer();
        for _ in 0..MAX_FRAMES {
            let back_chain = match read_word(pid, sp) {
                Some(next) if next > sp => next,
                _ => break,
            };
            match read_word(pid, back_chain.wrapping_add(16)) {
                Some(lr) if lr != 0 => frames.push(symbolize(&maps, lr)),
                _ => break,
            }
            sp = back_chain;
        }
    }

    Ok(frames)
}

/// Attaches to a running process, fetches its registers and unwinds, then
/// detaches. Used by the notify monitor, which has no ptrace relationship
/// with the sandboxee otherwise.
pub(crate) fn collect_via_attach(pid: libc::pid_t) -> Result<Vec<String>, SupervisorError> {
    if unsafe { libc::ptrace(libc::PTRACE_ATTACH, pid, 0, 0) } != 0 {
        return Err(SupervisorError::OsOperationFailed {
            description: "ptrace(PTRACE_ATTACH)",
            os_code: last_os_error_code(),
        });
    }
    let mut wstatus: libc::c_int = 0;
    let res = unsafe { libc::waitpid(pid, &mut wstatus, libc::WUNTRACED) };
    let trace = if res == pid && libc::WIFSTOPPED(wstatus) {
        Regs::fetch(pid).and_then(|regs| collect_stack_trace(pid, &regs))
    } else {
        Err(SupervisorError::OsOperationFailed {
            description: "waitpid() for attach stop",
            os_code: last_os_error_code(),
        })
    };
    if unsafe { libc::ptrace(libc::PTRACE_DETACH, pid, 0, 0) } != 0 {
        debug!("could not detach from pid {} after unwinding", pid);
    }
    trace
}

/// The short command name of a process, from /proc/pid/comm.
pub(crate) fn read_prog_name(pid: libc::pid_t) -> Option<String> {
    std::fs::read_to_string(format!("/proc/{}/comm", pid))
        .ok()
        .map(|s| s.trim_end().to_owned())
        .filter(|s| !s.is_empty())
}
