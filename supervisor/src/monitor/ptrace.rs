//! The trace-based monitor: PTRACE_SEIZE on the sandboxee, seccomp
//! RET_TRACE events delivered as ptrace stops, per-pid syscall tracking
//! across the whole descendant tree.

use super::{MonitorShared, WAKE_SIGNAL};
use crate::executor::Process;
use crate::network_proxy::ProxyStatus;
use crate::notify::{Notify, ViolationKind};
use crate::regs::Regs;
use crate::stack_trace;
use crate::syscall::{CpuArch, Syscall};
use crate::util::{last_os_error_code, now_unix_millis};
use crate::verdict::{reason, FinalStatus, ResourceUsage};
use cordon_policy::Policy;
use libc::{c_int, c_ulong, pid_t};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

// waitpid() flag covering clone children as well.
const WALL: c_int = 0x4000_0000;

// Group-stop / PTRACE_INTERRUPT stops under PTRACE_SEIZE.
const PTRACE_EVENT_STOP: c_int = 128;

// Wakeup period for sigtimedwait(), bounds the latency of deadline and
// latch checks when no signal arrives.
const WAKE_UP_PERIOD_NSEC: libc::c_long = 500_000_000;

// Per-pid tracking state, created on attach or on a NEW_PROCESS event and
// erased on the EXIT event.
#[derive(Debug, Default)]
struct TracedProcess {
    syscall_in_progress: Option<Syscall>,
    attached: bool,
}

// Main-pid lifecycle. Draining means the main pid has left the trace map
// and the monitor only waits for stragglers to be reaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MainState {
    AwaitingExecve,
    ActiveMonitoring,
    Draining,
    Done,
}

pub(super) fn run(
    shared: &MonitorShared,
    process: Process,
    policy: Arc<Policy>,
    notify: &mut dyn Notify,
    proxy_status: Option<Arc<ProxyStatus>>,
) {
    let mut monitor = PtraceMonitor {
        shared,
        main_pid: process.main_pid,
        policy,
        notify,
        proxy_status,
        tracked: HashMap::new(),
        state: if process.awaiting_execve {
            MainState::AwaitingExecve
        } else {
            MainState::ActiveMonitoring
        },
        main_wait_status: None,
        reaped_main: false,
        external_kill: false,
        timed_out: false,
        network_violation: false,
        should_dump_stack: false,
        sigset: unsafe { core::mem::zeroed() },
    };
    monitor.run();
    // keep the process record (and its descriptors) alive for the whole
    // monitoring session
    drop(process);
}

struct PtraceMonitor<'a> {
    shared: &'a MonitorShared,
    main_pid: pid_t,
    policy: Arc<Policy>,
    notify: &'a mut dyn Notify,
    proxy_status: Option<Arc<ProxyStatus>>,
    tracked: HashMap<pid_t, TracedProcess>,
    state: MainState,
    main_wait_status: Option<c_int>,
    reaped_main: bool,
    external_kill: bool,
    timed_out: bool,
    network_violation: bool,
    should_dump_stack: bool,
    sigset: libc::sigset_t,
}

impl<'a> PtraceMonitor<'a> {
    fn run(&mut self) {
        if !self.init_setup_signals() {
            self.shared
                .set_exit_status(FinalStatus::SetupError, reason::FAILED_SIGNALS);
            self.shared.setup.notify();
            return;
        }
        let tid = unsafe { libc::syscall(libc::SYS_gettid) } as pid_t;
        self.shared
            .install_waker(super::WakerState::ThreadSignal { tid });
        if !self.init_ptrace_attach() {
            self.shared
                .set_exit_status(FinalStatus::SetupError, reason::FAILED_ATTACH);
            self.shared.setup.notify();
            return;
        }
        self.shared.setup.notify();

        while self.state != MainState::Done {
            self.check_latches();
            if self.state == MainState::Done {
                break;
            }
            self.wait_for_events();
            self.drain_wait_events();
        }
    }

    // Blocks SIGCHLD and the wake signal on this thread so both are only
    // observable through sigtimedwait().
    fn init_setup_signals(&mut self) -> bool {
        unsafe {
            if libc::sigemptyset(&mut self.sigset) != 0
                || libc::sigaddset(&mut self.sigset, libc::SIGCHLD) != 0
                || libc::sigaddset(&mut self.sigset, WAKE_SIGNAL) != 0
            {
                return false;
            }
            libc::pthread_sigmask(libc::SIG_BLOCK, &self.sigset, core::ptr::null_mut()) == 0
        }
    }

    fn init_ptrace_attach(&mut self) -> bool {
        let options: c_ulong = (libc::PTRACE_O_TRACESECCOMP
            | libc::PTRACE_O_TRACEFORK
            | libc::PTRACE_O_TRACEVFORK
            | libc::PTRACE_O_TRACECLONE
            | libc::PTRACE_O_TRACEEXEC
            | libc::PTRACE_O_TRACEEXIT
            | libc::PTRACE_O_EXITKILL
            | libc::PTRACE_O_TRACESYSGOOD) as c_ulong;
        self.tracked.insert(self.main_pid, TracedProcess::default());
        let res = unsafe { libc::ptrace(libc::PTRACE_SEIZE, self.main_pid, 0, options) };
        if res != 0 {
            error!(
                "ptrace(PTRACE_SEIZE, {}) failed with error {}",
                self.main_pid,
                last_os_error_code()
            );
            self.tracked.remove(&self.main_pid);
            return false;
        }
        if let Some(entry) = self.tracked.get_mut(&self.main_pid) {
            entry.attached = true;
        }
        debug!("seized pid {}", self.main_pid);
        true
    }

    fn wait_for_events(&mut self) {
        let timeout = libc::timespec {
            tv_sec: 0,
            tv_nsec: WAKE_UP_PERIOD_NSEC,
        };
        let res = unsafe { libc::sigtimedwait(&self.sigset, core::ptr::null_mut(), &timeout) };
        if res == -1 {
            let err = last_os_error_code() as c_int;
            if err != libc::EAGAIN && err != libc::EINTR {
                warn!("sigtimedwait() failed with error {}", err);
            }
        }
    }

    fn drain_wait_events(&mut self) {
        loop {
            let mut status: c_int = 0;
            let mut usage: libc::rusage = unsafe { core::mem::zeroed() };
            let pid = unsafe {
                libc::wait4(-1, &mut status, libc::WNOHANG | WALL, &mut usage)
            };
            if pid <= 0 {
                break;
            }
            self.dispatch(pid, status, &usage);
            if self.state == MainState::Done {
                break;
            }
        }
    }

    fn dispatch(&mut self, pid: pid_t, status: c_int, usage: &libc::rusage) {
        if libc::WIFEXITED(status) || libc::WIFSIGNALED(status) {
            self.handle_reaped(pid, status, usage);
            return;
        }
        if !libc::WIFSTOPPED(status) {
            return;
        }
        let stopsig = libc::WSTOPSIG(status);
        let event = (status >> 16) & 0xff;
        match event {
            libc::PTRACE_EVENT_SECCOMP => self.event_seccomp(pid),
            libc::PTRACE_EVENT_EXIT => self.event_exit(pid),
            libc::PTRACE_EVENT_FORK | libc::PTRACE_EVENT_VFORK | libc::PTRACE_EVENT_CLONE => {
                self.event_new_process(pid)
            }
            libc::PTRACE_EVENT_EXEC => self.event_exec(pid),
            PTRACE_EVENT_STOP => self.event_group_stop(pid, stopsig),
            0 => {
                if stopsig == (libc::SIGTRAP | 0x80) {
                    self.event_syscall_exit(pid);
                } else {
                    self.event_signal_stop(pid, stopsig);
                }
            }
            other => {
                debug!("unhandled ptrace event {} for pid {}", other, pid);
                self.cont(pid, 0);
            }
        }
    }

    // A tracee was reaped for real. The monitor reaches its terminal state
    // once the trace map is empty and the main pid is gone.
    fn handle_reaped(&mut self, pid: pid_t, status: c_int, usage: &libc::rusage) {
        debug!("pid {} reaped with status {:#x}", pid, status);
        self.tracked.remove(&pid);
        if pid == self.main_pid {
            self.reaped_main = true;
            if self.main_wait_status.is_none() {
                self.main_wait_status = Some(status);
            }
            self.shared
                .verdict
                .lock()
                .unwrap()
                .set_sandboxee_usage(ResourceUsage::from_rusage(usage));
            self.state = MainState::Draining;
        }
        if self.reaped_main && self.tracked.is_empty() {
            self.finalize();
        }
    }

    fn event_seccomp(&mut self, pid: pid_t) {
        let mut event_msg: c_ulong = 0;
        if unsafe { libc::ptrace(libc::PTRACE_GETEVENTMSG, pid, 0, &mut event_msg) } != 0 {
            warn!("ptrace(PTRACE_GETEVENTMSG) failed for pid {}", pid);
            self.cont(pid, 0);
            return;
        }
        let regs = match Regs::fetch(pid) {
            Ok(regs) => regs,
            Err(e) => {
                error!("cannot read registers of pid {}: {}", pid, e);
                self.shared
                    .set_exit_status(FinalStatus::InternalError, reason::FAILED_FETCH);
                self.kill_sandboxee();
                self.cont(pid, 0);
                return;
            }
        };
        let syscall = regs.to_syscall();
        debug!(
            "seccomp event for pid {} (data {:#x}): {}",
            pid, event_msg, syscall
        );
        if self.state == MainState::AwaitingExecve {
            // Everything up to the initial execve belongs to the executor,
            // not the sandboxee.
            self.cont(pid, 0);
            return;
        }
        if syscall.arch() != CpuArch::host() {
            self.action_process_violation(&regs, syscall, ViolationKind::ArchitectureSwitch);
            return;
        }
        if self.policy.inspect_after_return(syscall.nr()) {
            if let Some(entry) = self.tracked.get_mut(&pid) {
                entry.syscall_in_progress = Some(syscall);
            }
            // Resume until the syscall-exit stop to read the result.
            if unsafe { libc::ptrace(libc::PTRACE_SYSCALL, pid, 0, 0) } != 0 {
                debug!("ptrace(PTRACE_SYSCALL) failed for pid {}", pid);
            }
            return;
        }
        self.action_process_violation(&regs, syscall, ViolationKind::Syscall);
    }

    fn event_syscall_exit(&mut self, pid: pid_t) {
        let in_progress = self
            .tracked
            .get_mut(&pid)
            .and_then(|entry| entry.syscall_in_progress.take());
        if let Some(syscall) = in_progress {
            match Regs::fetch(pid) {
                Ok(regs) => {
                    self.notify
                        .on_syscall_exit(&syscall, regs.return_value() as i64);
                }
                // A tracee killed between enter and exit stop is a dropped
                // entry, the return value is never guessed.
                Err(e) => debug!("no syscall-exit registers for pid {}: {}", pid, e),
            }
        }
        self.cont(pid, 0);
    }

    fn event_exit(&mut self, pid: pid_t) {
        let mut event_msg: c_ulong = 0;
        if unsafe { libc::ptrace(libc::PTRACE_GETEVENTMSG, pid, 0, &mut event_msg) } == 0 {
            if pid == self.main_pid {
                self.main_wait_status = Some(event_msg as c_int);
            }
        }
        debug!("pid {} entered exit stop (status {:#x})", pid, event_msg);
        self.tracked.remove(&pid);
        if pid == self.main_pid {
            self.state = MainState::Draining;
        }
        self.cont(pid, 0);
    }

    fn event_new_process(&mut self, pid: pid_t) {
        let mut event_msg: c_ulong = 0;
        if unsafe { libc::ptrace(libc::PTRACE_GETEVENTMSG, pid, 0, &mut event_msg) } != 0 {
            warn!("cannot read new-process pid from event on pid {}", pid);
            self.cont(pid, 0);
            return;
        }
        let new_pid = event_msg as pid_t;
        debug!("pid {} spawned pid {}", pid, new_pid);
        // The kernel attached the child for us (TRACEFORK and friends).
        self.tracked.insert(
            new_pid,
            TracedProcess {
                syscall_in_progress: None,
                attached: true,
            },
        );
        self.cont(pid, 0);
    }

    fn event_exec(&mut self, pid: pid_t) {
        debug!("pid {} performed execve", pid);
        if pid == self.main_pid && self.state == MainState::AwaitingExecve {
            self.state = MainState::ActiveMonitoring;
        }
        self.cont(pid, 0);
    }

    fn event_group_stop(&mut self, pid: pid_t, stopsig: c_int) {
        if self.should_dump_stack && pid == self.main_pid {
            self.should_dump_stack = false;
            match Regs::fetch(pid).and_then(|regs| stack_trace::collect_stack_trace(pid, &regs)) {
                Ok(frames) => info!("stack trace of pid {}: {}", pid, frames.join(" -> ")),
                Err(e) => warn!("could not collect stack trace of pid {}: {}", pid, e),
            }
        }
        if stopsig == libc::SIGTRAP {
            // PTRACE_INTERRUPT-induced stop, plain continue.
            self.cont(pid, 0);
        } else {
            // Genuine group stop: keep the tracee stopped but listening,
            // suppressing it would fight the process's own job control.
            if unsafe { libc::ptrace(libc::PTRACE_LISTEN, pid, 0, 0) } != 0 {
                self.cont(pid, 0);
            }
        }
    }

    fn event_signal_stop(&mut self, pid: pid_t, stopsig: c_int) {
        debug!("forwarding signal {} to pid {}", stopsig, pid);
        self.notify.on_signal(stopsig, pid);
        self.cont(pid, stopsig);
    }

    fn check_latches(&mut self) {
        if let Some(proxy) = &self.proxy_status {
            if proxy.violation_occurred() && !self.network_violation {
                self.network_violation = true;
                let msg = proxy.violation_msg();
                warn!("network violation reported by proxy: {}", msg);
                self.notify.on_network_violation(&msg);
                self.kill_sandboxee();
            }
        }
        if self.shared.external_kill_request.swap(false, Ordering::AcqRel) {
            info!("external kill requested for pid {}", self.main_pid);
            self.external_kill = true;
            self.kill_sandboxee();
        }
        if self.shared.dump_stack_request.swap(false, Ordering::AcqRel) {
            self.should_dump_stack = true;
            self.interrupt_sandboxee();
        }
        let deadline = self.shared.deadline_millis.load(Ordering::Relaxed);
        if deadline != 0 && now_unix_millis() >= deadline && !self.timed_out {
            info!("pid {} hit the wall-time deadline", self.main_pid);
            self.timed_out = true;
            self.kill_sandboxee();
        }
    }

    fn action_process_violation(&mut self, regs: &Regs, syscall: Syscall, kind: ViolationKind) {
        error!("SANDBOX VIOLATION: {}", syscall);
        self.log_violation_explanation(&syscall, kind);
        self.notify.on_syscall_violation(&syscall, kind);
        {
            let mut verdict = self.shared.verdict.lock().unwrap();
            verdict.set_syscall(syscall);
            if let Some(name) = stack_trace::read_prog_name(self.main_pid) {
                verdict.set_prog_name(name);
            }
        }
        if self.policy.collect_stacktrace_on_violation() {
            match stack_trace::collect_stack_trace(regs.pid(), regs) {
                Ok(frames) => {
                    error!("stack trace: {}", frames.join(" -> "));
                    self.shared.verdict.lock().unwrap().set_stack_trace(frames);
                }
                Err(e) => warn!("stack trace collection failed: {}", e),
            }
        }
        self.shared
            .set_exit_status(FinalStatus::Violation, syscall.nr() as i64);
        self.kill_sandboxee();
    }

    fn log_violation_explanation(&self, syscall: &Syscall, kind: ViolationKind) {
        match kind {
            ViolationKind::ArchitectureSwitch => error!(
                "the process issued a syscall under a foreign architecture \
                 personality; the policy was compiled for {}",
                CpuArch::host()
            ),
            ViolationKind::Syscall => match syscall.name() {
                Some(name) => error!(
                    "syscall {} is forwarded by the policy but not marked for inspection",
                    name
                ),
                None => error!(
                    "syscall #{} is not covered by the policy's handled set",
                    syscall.nr()
                ),
            },
            ViolationKind::NetworkConnect => {}
        }
    }

    fn kill_sandboxee(&mut self) {
        debug!("killing pid {}", self.main_pid);
        unsafe {
            // PTRACE_KILL only acts on stopped tracees; the SIGKILL covers
            // the running case.
            libc::ptrace(libc::PTRACE_KILL, self.main_pid, 0, 0);
            if libc::kill(self.main_pid, libc::SIGKILL) != 0 {
                let err = last_os_error_code();
                if err as c_int != libc::ESRCH {
                    error!("kill(SIGKILL, {}) failed with error {}", self.main_pid, err);
                }
            }
        }
    }

    fn interrupt_sandboxee(&mut self) {
        if unsafe { libc::ptrace(libc::PTRACE_INTERRUPT, self.main_pid, 0, 0) } != 0 {
            warn!(
                "ptrace(PTRACE_INTERRUPT, {}) failed with error {}",
                self.main_pid,
                last_os_error_code()
            );
            self.should_dump_stack = false;
        }
    }

    fn cont(&mut self, pid: pid_t, signal: c_int) {
        if unsafe { libc::ptrace(libc::PTRACE_CONT, pid, 0, signal as c_ulong) } != 0 {
            let err = last_os_error_code();
            if err as c_int != libc::ESRCH {
                debug!("ptrace(PTRACE_CONT, {}) failed with error {}", pid, err);
            }
        }
    }

    // Called once the last tracked pid is gone; composes the final verdict
    // unless a violation already decided it.
    fn finalize(&mut self) {
        let status = self.main_wait_status.unwrap_or(0);
        if self.network_violation {
            if let Some(proxy) = &self.proxy_status {
                self.shared
                    .verdict
                    .lock()
                    .unwrap()
                    .set_network_violation_msg(proxy.violation_msg());
            }
            self.shared
                .set_exit_status(FinalStatus::Violation, reason::VIOLATION_NETWORK);
        } else if self.external_kill {
            self.shared.set_exit_status(FinalStatus::ExternalKill, 0);
        } else if self.timed_out {
            self.shared.set_exit_status(FinalStatus::Timeout, 0);
        } else if libc::WIFSIGNALED(status) {
            self.shared
                .set_exit_status(FinalStatus::Signaled, libc::WTERMSIG(status) as i64);
        } else if libc::WIFEXITED(status) {
            self.shared
                .set_exit_status(FinalStatus::Ok, libc::WEXITSTATUS(status) as i64);
        } else {
            self.shared
                .set_exit_status(FinalStatus::InternalError, reason::FAILED_MONITOR);
        }
        self.state = MainState::Done;
        debug!(
            "monitor finished: {}",
            self.shared.verdict.lock().unwrap().describe()
        );
    }
}
