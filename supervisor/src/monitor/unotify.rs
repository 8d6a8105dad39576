//! The notify-based monitor: the sandboxee's filter returns
//! SECCOMP_RET_USER_NOTIF for brokered syscalls, the supervisor answers
//! them over the listener descriptor and learns about the child's exit
//! through the status pipe.

use super::{MonitorShared, WakerState};
use crate::executor::Process;
use crate::network_proxy::ProxyStatus;
use crate::notify::{Notify, ViolationKind};
use crate::seccomp::{self, NotifBuffers, SeccompNotifResp, SECCOMP_USER_NOTIF_FLAG_CONTINUE};
use crate::stack_trace;
use crate::syscall::{CpuArch, Syscall};
use crate::util::{last_os_error_code, now_unix_millis};
use crate::verdict::{reason, FinalStatus, ResourceUsage};
use cordon_policy::{Handle, Policy};
use libc::{c_int, pid_t};
use log::{debug, error, info, warn};
use std::sync::atomic::Ordering;
use std::sync::Arc;

// Upper bound on one poll() sleep; deadline and latch checks run at least
// this often even with no descriptor activity.
const MIN_WAKEUP_MSEC: i64 = 30_000;

// How long the status pipe may take to deliver the exit record once the
// child is known to be dead.
const STATUS_PIPE_TIMEOUT_MSEC: i64 = 1_000;

pub(super) fn run(
    shared: &MonitorShared,
    mut process: Process,
    policy: Arc<Policy>,
    notify: &mut dyn Notify,
    proxy_status: Option<Arc<ProxyStatus>>,
) {
    let notify_fd = match process.notify_fd.take() {
        Some(fd) => fd,
        None => {
            error!("notify monitor launched without a seccomp listener descriptor");
            shared.set_exit_status(FinalStatus::SetupError, reason::FAILED_NOTIFY);
            shared.setup.notify();
            return;
        }
    };
    let status_fd = match process.status_fd.take() {
        Some(fd) => fd,
        None => {
            error!("notify monitor launched without a status pipe");
            shared.set_exit_status(FinalStatus::SetupError, reason::FAILED_NOTIFY);
            shared.setup.notify();
            return;
        }
    };
    let bufs = match NotifBuffers::new() {
        Ok(bufs) => bufs,
        Err(e) => {
            error!("cannot size user-notify buffers: {}", e);
            shared.set_exit_status(FinalStatus::SetupError, reason::FAILED_NOTIFY);
            shared.setup.notify();
            return;
        }
    };
    let event_raw = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if event_raw < 0 {
        error!("eventfd() failed with error {}", last_os_error_code());
        shared.set_exit_status(FinalStatus::SetupError, reason::FAILED_NOTIFY);
        shared.setup.notify();
        return;
    }
    let event_fd = unsafe { Handle::from_raw(event_raw as u64) }.unwrap();
    let event_raw = event_fd.as_raw();
    shared.install_waker(WakerState::Eventfd(event_fd));
    shared.setup.notify();

    let mut monitor = UnotifyMonitor {
        shared,
        main_pid: process.main_pid,
        init_pid: process.init_pid,
        policy,
        notify,
        proxy_status,
        bufs,
        notify_fd,
        status_fd,
        event_raw,
        external_kill: false,
        timed_out: false,
        network_violation: false,
    };
    monitor.run();
    drop(process);
}

struct UnotifyMonitor<'a> {
    shared: &'a MonitorShared,
    main_pid: pid_t,
    init_pid: pid_t,
    policy: Arc<Policy>,
    notify: &'a mut dyn Notify,
    proxy_status: Option<Arc<ProxyStatus>>,
    bufs: NotifBuffers,
    notify_fd: Handle,
    status_fd: Handle,
    event_raw: c_int,
    external_kill: bool,
    timed_out: bool,
    network_violation: bool,
}

impl<'a> UnotifyMonitor<'a> {
    fn run(&mut self) {
        while self.shared.verdict_pending() {
            let deadline = self.shared.deadline_millis.load(Ordering::Relaxed);
            let remaining_msec = deadline - now_unix_millis();
            if deadline != 0 && remaining_msec <= 0 {
                info!("pid {} hit the wall-time deadline", self.main_pid);
                self.timed_out = true;
                self.maybe_collect_stack_trace();
                self.kill_sandboxee();
                self.set_exit_status_from_status_pipe();
                break;
            }

            if self.shared.external_kill_request.swap(false, Ordering::AcqRel) {
                info!("external kill requested for pid {}", self.main_pid);
                self.external_kill = true;
                self.kill_sandboxee();
                self.set_exit_status_from_status_pipe();
                break;
            }

            if self.shared.dump_stack_request.swap(false, Ordering::AcqRel) {
                match stack_trace::collect_via_attach(self.main_pid) {
                    Ok(frames) => {
                        info!("stack trace of pid {}: {}", self.main_pid, frames.join(" -> "))
                    }
                    Err(e) => warn!("could not collect stack trace: {}", e),
                }
            }

            let network_violation = self
                .proxy_status
                .as_ref()
                .map(|status| status.violation_occurred())
                .unwrap_or(false);
            if network_violation && !self.network_violation {
                self.network_violation = true;
                let msg = self
                    .proxy_status
                    .as_ref()
                    .map(|status| status.violation_msg())
                    .unwrap_or_default();
                warn!("network violation reported by proxy: {}", msg);
                self.notify.on_network_violation(&msg);
                self.maybe_collect_stack_trace();
                self.kill_sandboxee();
                self.set_exit_status_from_status_pipe();
                break;
            }

            let mut timeout_msec = MIN_WAKEUP_MSEC;
            if deadline != 0 && remaining_msec > 0 {
                timeout_msec = timeout_msec.min(remaining_msec);
            }
            let mut pfds = [
                libc::pollfd {
                    fd: self.status_fd.as_raw(),
                    events: libc::POLLIN,
                    revents: 0,
                },
                libc::pollfd {
                    fd: self.notify_fd.as_raw(),
                    events: libc::POLLIN,
                    revents: 0,
                },
                libc::pollfd {
                    fd: self.event_raw,
                    events: libc::POLLIN,
                    revents: 0,
                },
            ];
            let ret = unsafe {
                libc::poll(
                    pfds.as_mut_ptr(),
                    pfds.len() as libc::nfds_t,
                    timeout_msec as c_int,
                )
            };
            if ret == 0 {
                continue;
            }
            if ret == -1 {
                let err = last_os_error_code() as c_int;
                if err == libc::EINTR {
                    continue;
                }
                error!("poll() failed with error {}", err);
                self.shared
                    .set_exit_status(FinalStatus::InternalError, reason::FAILED_MONITOR);
                break;
            }
            if pfds[2].revents & libc::POLLIN != 0 {
                let mut value: u64 = 0;
                unsafe {
                    libc::read(
                        self.event_raw,
                        &mut value as *mut u64 as *mut libc::c_void,
                        core::mem::size_of::<u64>(),
                    );
                }
                continue;
            }
            if pfds[0].revents & libc::POLLIN != 0 {
                self.set_exit_status_from_status_pipe();
                break;
            }
            if pfds[0].revents & libc::POLLHUP != 0 {
                error!("status pipe closed without delivering an exit record");
                self.shared
                    .set_exit_status(FinalStatus::InternalError, reason::FAILED_MONITOR);
                break;
            }
            if pfds[1].revents & libc::POLLIN != 0 {
                self.handle_unotify();
            }
        }
        self.kill_init();
    }

    fn handle_unotify(&mut self) {
        let req = match self.bufs.recv(self.notify_fd.as_raw()) {
            Ok(req) => req,
            Err(err) if err as c_int == libc::ENOENT => {
                // The requesting task died before we picked up the event.
                debug!("user-notify recv returned ENOENT");
                return;
            }
            Err(err) => {
                error!("user-notify recv failed with error {}", err);
                self.shared
                    .set_exit_status(FinalStatus::InternalError, reason::FAILED_NOTIFY);
                return;
            }
        };
        let syscall = Syscall::new(
            CpuArch::from_audit(req.data.arch),
            req.data.nr as u64,
            req.data.args,
            req.pid as pid_t,
            0,
            req.data.instruction_pointer,
        );
        debug!("user-notify event: {}", syscall);

        if syscall.arch() != CpuArch::host() {
            self.handle_violation(syscall, ViolationKind::ArchitectureSwitch);
            return;
        }
        if let Some(errno) = self.policy.notify_errno(syscall.nr()) {
            self.respond(req.id, 0, -errno, 0);
            return;
        }
        if self.policy.allows_on_notify(syscall.nr()) {
            // The request may have died while we were deciding; responding
            // to a stale id would error out, so re-validate first.
            if seccomp::notif_id_valid(self.notify_fd.as_raw(), req.id) {
                self.respond(req.id, 0, 0, SECCOMP_USER_NOTIF_FLAG_CONTINUE);
            }
            return;
        }
        self.handle_violation(syscall, ViolationKind::Syscall);
    }

    fn respond(&mut self, id: u64, val: i64, error: i32, flags: u32) {
        let resp = SeccompNotifResp {
            id,
            val,
            error,
            flags,
        };
        match self.bufs.send(self.notify_fd.as_raw(), &resp) {
            Ok(()) => {}
            Err(err) if err as c_int == libc::ENOENT => {
                debug!("user-notify send raced with task death");
            }
            Err(err) => {
                if err as c_int == libc::EINVAL && flags == SECCOMP_USER_NOTIF_FLAG_CONTINUE {
                    error!(
                        "user-notify send rejected; the kernel likely lacks \
                         SECCOMP_USER_NOTIF_FLAG_CONTINUE support"
                    );
                }
                self.shared
                    .set_exit_status(FinalStatus::InternalError, reason::FAILED_NOTIFY);
            }
        }
    }

    fn handle_violation(&mut self, syscall: Syscall, kind: ViolationKind) {
        error!("SANDBOX VIOLATION: {}", syscall);
        if kind == ViolationKind::ArchitectureSwitch {
            error!(
                "the process issued a syscall under a foreign architecture \
                 personality; the policy was compiled for {}",
                CpuArch::host()
            );
        }
        self.notify.on_syscall_violation(&syscall, kind);
        self.maybe_collect_stack_trace();
        {
            let mut verdict = self.shared.verdict.lock().unwrap();
            verdict.set_syscall(syscall);
            if let Some(name) = stack_trace::read_prog_name(self.main_pid) {
                verdict.set_prog_name(name);
            }
        }
        self.shared
            .set_exit_status(FinalStatus::Violation, syscall.nr() as i64);
        self.kill_sandboxee();
    }

    fn maybe_collect_stack_trace(&mut self) {
        if !self.policy.collect_stacktrace_on_violation() {
            return;
        }
        match stack_trace::collect_via_attach(self.main_pid) {
            Ok(frames) => {
                self.shared.verdict.lock().unwrap().set_stack_trace(frames);
            }
            Err(e) => debug!("stack trace collection failed: {}", e),
        }
    }

    // Reads {code, status, rusage} written by the executor's reaper when
    // the main pid died. Bounded wait: the child being gone does not
    // guarantee the record is already in flight.
    fn set_exit_status_from_status_pipe(&mut self) {
        let mut record = vec![0u8; 2 * core::mem::size_of::<c_int>() + core::mem::size_of::<libc::rusage>()];
        let mut filled = 0usize;
        let give_up_at = now_unix_millis() + STATUS_PIPE_TIMEOUT_MSEC;
        while filled < record.len() {
            let remaining = give_up_at - now_unix_millis();
            if remaining <= 0 {
                break;
            }
            let mut pfd = libc::pollfd {
                fd: self.status_fd.as_raw(),
                events: libc::POLLIN,
                revents: 0,
            };
            let ret = unsafe { libc::poll(&mut pfd, 1, remaining as c_int) };
            if ret == -1 && last_os_error_code() as c_int != libc::EINTR {
                break;
            }
            if ret <= 0 {
                continue;
            }
            let res = unsafe {
                libc::read(
                    self.status_fd.as_raw(),
                    record[filled..].as_mut_ptr() as *mut libc::c_void,
                    record.len() - filled,
                )
            };
            if res < 0 {
                if last_os_error_code() as c_int == libc::EINTR {
                    continue;
                }
                break;
            }
            if res == 0 {
                break;
            }
            filled += res as usize;
        }
        if filled < record.len() {
            error!(
                "status pipe delivered {} of {} expected bytes",
                filled,
                record.len()
            );
            self.shared
                .set_exit_status(FinalStatus::InternalError, reason::FAILED_MONITOR);
            return;
        }
        let mut code_bytes = [0u8; core::mem::size_of::<c_int>()];
        code_bytes.copy_from_slice(&record[..core::mem::size_of::<c_int>()]);
        let code = c_int::from_ne_bytes(code_bytes);
        let mut status_bytes = [0u8; core::mem::size_of::<c_int>()];
        status_bytes
            .copy_from_slice(&record[core::mem::size_of::<c_int>()..2 * core::mem::size_of::<c_int>()]);
        let status = c_int::from_ne_bytes(status_bytes);
        let usage: libc::rusage = unsafe {
            core::ptr::read_unaligned(
                record[2 * core::mem::size_of::<c_int>()..].as_ptr() as *const libc::rusage
            )
        };
        self.shared
            .verdict
            .lock()
            .unwrap()
            .set_sandboxee_usage(ResourceUsage::from_rusage(&usage));

        if code == libc::CLD_EXITED {
            self.shared.set_exit_status(FinalStatus::Ok, status as i64);
        } else if code == libc::CLD_KILLED || code == libc::CLD_DUMPED {
            if self.network_violation {
                let msg = self
                    .proxy_status
                    .as_ref()
                    .map(|s| s.violation_msg())
                    .unwrap_or_default();
                self.shared
                    .verdict
                    .lock()
                    .unwrap()
                    .set_network_violation_msg(msg);
                self.shared
                    .set_exit_status(FinalStatus::Violation, reason::VIOLATION_NETWORK);
            } else if self.external_kill {
                self.shared.set_exit_status(FinalStatus::ExternalKill, 0);
            } else if self.timed_out {
                self.shared.set_exit_status(FinalStatus::Timeout, 0);
            } else {
                self.shared
                    .set_exit_status(FinalStatus::Signaled, status as i64);
            }
        } else {
            self.shared
                .set_exit_status(FinalStatus::InternalError, reason::FAILED_MONITOR);
        }
    }

    fn kill_sandboxee(&mut self) {
        debug!("sending SIGKILL to pid {}", self.main_pid);
        if unsafe { libc::kill(self.main_pid, libc::SIGKILL) } != 0 {
            let err = last_os_error_code();
            if err as c_int != libc::ESRCH {
                error!("kill(SIGKILL, {}) failed with error {}", self.main_pid, err);
            }
        }
    }

    // A sandboxee running under its own PID namespace leaves an init-like
    // PID 1 behind; reap it along with the namespace.
    fn kill_init(&mut self) {
        if self.init_pid <= 0 {
            return;
        }
        debug!("sending SIGKILL to namespace init pid {}", self.init_pid);
        if unsafe { libc::kill(self.init_pid, libc::SIGKILL) } != 0 {
            let err = last_os_error_code();
            if err as c_int != libc::ESRCH {
                error!(
                    "kill(SIGKILL, {}) failed with error {}",
                    self.init_pid, err
                );
            }
        }
    }
}
