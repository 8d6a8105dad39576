// Shared setup and child-process plumbing used by all integration tests.

use cordon_comms::Comms;
use cordon_policy::Handle;
use cordon_supervisor::seccomp::{
    bpf_jump, bpf_stmt, BPF_ABS, BPF_JEQ, BPF_JMP, BPF_K, BPF_LD, BPF_RET, BPF_W,
    SECCOMP_DATA_NR_OFFSET, SECCOMP_RET_ALLOW, SECCOMP_RET_USER_NOTIF,
};
use cordon_supervisor::SANDBOX_READY;
use libc::{c_int, c_void, sock_filter};
use simple_logger::SimpleLogger;
use std::net::Ipv4Addr;
use std::sync::Once;

static INIT_LOGGING: Once = Once::new();

pub fn common_test_setup() {
    INIT_LOGGING.call_once(|| {
        SimpleLogger::new()
            .with_level(log::LevelFilter::Debug)
            .init()
            .expect("unable to initialize logging");
    });
    std::env::set_var("RUST_BACKTRACE", "full");
}

/// A connected pair of comms endpoints over a local stream socketpair.
pub fn comms_pair() -> (Comms, Comms) {
    let mut socks: [c_int; 2] = [-1, -1];
    let res = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
            0,
            socks.as_mut_ptr(),
        )
    };
    assert_eq!(res, 0, "socketpair() failed");
    let a = unsafe { Handle::from_raw(socks[0] as u64) }.unwrap();
    let b = unsafe { Handle::from_raw(socks[1] as u64) }.unwrap();
    (Comms::from_handle(a), Comms::from_handle(b))
}

/// Plays the sandboxee's half of the bring-up sequence: consumes the
/// policy, confirms readiness, receives the forwarded IPC endpoints and
/// the working directory. Returns the policy bytes and the received
/// endpoints.
pub fn fake_sandboxee_handshake(comms: &mut Comms) -> (Vec<u8>, Vec<(String, Handle)>) {
    let policy = comms.recv_bytes().expect("policy bytes");
    comms.send_u32(SANDBOX_READY).expect("ready token");
    let count = comms.recv_u64().expect("ipc endpoint count");
    let mut endpoints = Vec::new();
    for _ in 0..count {
        let name = comms.recv_string().expect("ipc endpoint name");
        let fd = comms.recv_fd().expect("ipc endpoint fd");
        endpoints.push((name, fd));
    }
    let _cwd = comms.recv_string().expect("cwd");
    (policy, endpoints)
}

/// Raw sockaddr_in bytes as the sandboxee would hand them to the network
/// proxy.
pub fn sockaddr_v4_bytes(ip: Ipv4Addr, port: u16) -> Vec<u8> {
    let mut sin: libc::sockaddr_in = unsafe { core::mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_port = port.to_be();
    sin.sin_addr.s_addr = u32::from(ip).to_be();
    let ptr = &sin as *const libc::sockaddr_in as *const u8;
    unsafe { core::slice::from_raw_parts(ptr, core::mem::size_of::<libc::sockaddr_in>()) }.to_vec()
}

/// A filter routing exactly one syscall to the user-notify listener and
/// allowing everything else.
pub fn notif_filter_for(sysno: i64) -> Vec<sock_filter> {
    vec![
        bpf_stmt(BPF_LD | BPF_W | BPF_ABS, SECCOMP_DATA_NR_OFFSET),
        bpf_jump(BPF_JMP | BPF_JEQ | BPF_K, sysno as u32, 0, 1),
        bpf_stmt(BPF_RET | BPF_K, SECCOMP_RET_USER_NOTIF),
        bpf_stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW),
    ]
}

// Minimal SCM_RIGHTS plumbing for the forked test child: must stay free
// of allocations, the child runs between fork() and _exit() in a
// multi-threaded test binary.
const CMSG_SPACE_ONE_FD: usize =
    unsafe { libc::CMSG_SPACE(core::mem::size_of::<c_int>() as u32) } as usize;

pub fn send_fd_raw(sock: c_int, fd: c_int) -> bool {
    let payload = [0u8; 1];
    let msg_iovec = libc::iovec {
        iov_base: payload.as_ptr() as *mut c_void,
        iov_len: payload.len(),
    };
    let mut cbuf = [0u8; CMSG_SPACE_ONE_FD];
    let msg = libc::msghdr {
        msg_name: core::ptr::null_mut(),
        msg_namelen: 0,
        msg_iov: &msg_iovec as *const libc::iovec as *mut libc::iovec,
        msg_iovlen: 1,
        msg_control: cbuf.as_mut_ptr() as *mut c_void,
        msg_controllen: CMSG_SPACE_ONE_FD,
        msg_flags: 0,
    };
    unsafe {
        let cmsghdr = libc::CMSG_FIRSTHDR(&msg as *const libc::msghdr);
        let (clevel, ctype) = (libc::SOL_SOCKET, libc::SCM_RIGHTS);
        let clen = libc::CMSG_LEN(core::mem::size_of::<c_int>() as u32) as usize;
        core::ptr::copy_nonoverlapping(&clevel, &mut (*cmsghdr).cmsg_level, 1);
        core::ptr::copy_nonoverlapping(&ctype, &mut (*cmsghdr).cmsg_type, 1);
        core::ptr::copy_nonoverlapping(&clen, &mut (*cmsghdr).cmsg_len, 1);
        core::ptr::copy_nonoverlapping(&fd, libc::CMSG_DATA(cmsghdr) as *mut c_int, 1);
        libc::sendmsg(sock, &msg as *const libc::msghdr, libc::MSG_NOSIGNAL) == 1
    }
}

pub fn recv_fd_raw(sock: c_int) -> Option<Handle> {
    let mut payload = [0u8; 1];
    let msg_iovec = libc::iovec {
        iov_base: payload.as_mut_ptr() as *mut c_void,
        iov_len: payload.len(),
    };
    let mut cbuf = [0u8; CMSG_SPACE_ONE_FD];
    let mut msg = libc::msghdr {
        msg_name: core::ptr::null_mut(),
        msg_namelen: 0,
        msg_iov: &msg_iovec as *const libc::iovec as *mut libc::iovec,
        msg_iovlen: 1,
        msg_control: cbuf.as_mut_ptr() as *mut c_void,
        msg_controllen: CMSG_SPACE_ONE_FD,
        msg_flags: 0,
    };
    unsafe {
        let res = libc::recvmsg(
            sock,
            &mut msg as *mut libc::msghdr,
            libc::MSG_NOSIGNAL | libc::MSG_CMSG_CLOEXEC,
        );
        if res < 0 {
            return None;
        }
        let cmsghdr = libc::CMSG_FIRSTHDR(&msg as *const libc::msghdr);
        if cmsghdr.is_null() {
            return None;
        }
        let mut fd: c_int = -1;
        core::ptr::copy_nonoverlapping(libc::CMSG_DATA(cmsghdr) as *const c_int, &mut fd, 1);
        Handle::from_raw(fd as u64).ok()
    }
}

/// What the forked test child does after installing its filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildAction {
    ExitZero,
    /// Issues ptrace(2), which the filter routes to the listener.
    TriggerBlockedSyscall,
    /// Issues getppid(2) (routed to the listener) and exits 0 when the
    /// kernel executed it for real.
    TriggerAllowedSyscall,
    SleepForever,
}

pub struct UnotifyChild {
    pub pid: libc::pid_t,
    pub notify_fd: Handle,
    pub status_fd: Handle,
    reaper: Option<std::thread::JoinHandle<()>>,
}

impl UnotifyChild {
    pub fn join_reaper(&mut self) {
        if let Some(reaper) = self.reaper.take() {
            let _ = reaper.join();
        }
    }
}

impl Drop for UnotifyChild {
    fn drop(&mut self) {
        unsafe { libc::kill(self.pid, libc::SIGKILL) };
        self.join_reaper();
    }
}

/// Forks a child that installs `filter` with SECCOMP_FILTER_FLAG_NEW_LISTENER,
/// passes the listener back, and performs `action`. A reaper thread plays
/// the executor's part: it waits for the child and writes the
/// {code, status, rusage} record into the status pipe.
pub fn spawn_unotify_child(filter: &[sock_filter], action: ChildAction) -> UnotifyChild {
    // fd transfer channel
    let mut socks: [c_int; 2] = [-1, -1];
    assert_eq!(
        unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, socks.as_mut_ptr()) },
        0
    );
    // status pipe
    let mut pipe_fds: [c_int; 2] = [-1, -1];
    assert_eq!(unsafe { libc::pipe(pipe_fds.as_mut_ptr()) }, 0);

    let fprog = libc::sock_fprog {
        len: filter.len() as u16,
        filter: filter.as_ptr() as *mut sock_filter,
    };

    let pid = unsafe { libc::fork() };
    assert!(pid >= 0, "fork() failed");
    if pid == 0 {
        // Child: raw syscalls only from here to _exit().
        unsafe {
            libc::close(socks[0]);
            libc::close(pipe_fds[0]);
            libc::close(pipe_fds[1]);
            if libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) != 0 {
                libc::_exit(10);
            }
            const SECCOMP_SET_MODE_FILTER: libc::c_long = 1;
            const SECCOMP_FILTER_FLAG_NEW_LISTENER: libc::c_long = 1 << 3;
            let listener = libc::syscall(
                libc::SYS_seccomp,
                SECCOMP_SET_MODE_FILTER,
                SECCOMP_FILTER_FLAG_NEW_LISTENER,
                &fprog as *const libc::sock_fprog,
            );
            if listener < 0 {
                libc::_exit(11);
            }
            if !send_fd_raw(socks[1], listener as c_int) {
                libc::_exit(12);
            }
            match action {
                ChildAction::ExitZero => libc::_exit(0),
                ChildAction::TriggerBlockedSyscall => {
                    libc::syscall(libc::SYS_ptrace, 0, 0, 0, 0);
                    // Only reached if the supervisor let it through.
                    libc::_exit(13);
                }
                ChildAction::TriggerAllowedSyscall => {
                    let res = libc::syscall(libc::SYS_getppid);
                    libc::_exit(if res > 0 { 0 } else { 14 });
                }
                ChildAction::SleepForever => loop {
                    libc::pause();
                },
            }
        }
    }

    // Parent
    unsafe { libc::close(socks[1]) };
    let transfer = unsafe { Handle::from_raw(socks[0] as u64) }.unwrap();
    let notify_fd = recv_fd_raw(transfer.as_raw()).expect("listener fd from child");
    drop(transfer);

    let status_read = unsafe { Handle::from_raw(pipe_fds[0] as u64) }.unwrap();
    let status_write = unsafe { Handle::from_raw(pipe_fds[1] as u64) }.unwrap();

    // Reaper thread: the executor's side of the status pipe contract.
    let reaper = std::thread::spawn(move || {
        let mut status: c_int = 0;
        let mut usage: libc::rusage = unsafe { core::mem::zeroed() };
        let res = unsafe { libc::wait4(pid, &mut status, 0, &mut usage) };
        if res != pid {
            return;
        }
        let code: c_int = if libc::WIFEXITED(status) {
            libc::CLD_EXITED
        } else if libc::WCOREDUMP(status) {
            libc::CLD_DUMPED
        } else {
            libc::CLD_KILLED
        };
        let payload: c_int = if libc::WIFEXITED(status) {
            libc::WEXITSTATUS(status)
        } else {
            libc::WTERMSIG(status)
        };
        let mut record = Vec::with_capacity(
            2 * core::mem::size_of::<c_int>() + core::mem::size_of::<libc::rusage>(),
        );
        record.extend_from_slice(&code.to_ne_bytes());
        record.extend_from_slice(&payload.to_ne_bytes());
        let usage_bytes = unsafe {
            core::slice::from_raw_parts(
                &usage as *const libc::rusage as *const u8,
                core::mem::size_of::<libc::rusage>(),
            )
        };
        record.extend_from_slice(usage_bytes);
        let res = unsafe {
            libc::write(
                status_write.as_raw(),
                record.as_ptr() as *const c_void,
                record.len(),
            )
        };
        assert_eq!(res, record.len() as isize, "status pipe write");
        drop(status_write);
    });

    UnotifyChild {
        pid,
        notify_fd,
        status_fd: status_read,
        reaper: Some(reaper),
    }
}
