//! Shared monitor lifecycle: the launch sequence handing policy, IPC
//! endpoints, working directory and resource limits to the sandboxee, the
//! verdict bookkeeping, and the public handle dispatching to the variant
//! event loops.

mod ptrace;
mod unotify;

use crate::error::SupervisorError;
use crate::executor::{Ipc, Limits, Process};
use crate::network_proxy::{AllowedHosts, NetworkProxyServer, ProxyStatus};
use crate::notify::Notify;
use crate::seccomp;
use crate::util::{now_unix_millis, raw_fatal};
use crate::verdict::{reason, FinalStatus, ResourceUsage, Verdict};
use cordon_comms::Comms;
use cordon_policy::{Handle, Policy};
use libc::c_int;
use log::{debug, error, warn};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Token sent by the sandboxee once it has installed the seccomp filter.
pub const SANDBOX_READY: u32 = 0x0A0B_0C01;

/// Signal used to wake the trace monitor out of sigtimedwait(). Masked on
/// the monitor thread and delivered with tgkill, so it never reaches any
/// other thread's default disposition.
pub(crate) const WAKE_SIGNAL: c_int = libc::SIGURG;

/// One-shot completion flag with blocking waiters.
pub struct Notification {
    fired: Mutex<bool>,
    cond: Condvar,
}

impl Notification {
    pub fn new() -> Self {
        Self {
            fired: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Idempotent; wakes every current and future waiter.
    pub fn notify(&self) {
        let mut fired = self.fired.lock().unwrap();
        *fired = true;
        self.cond.notify_all();
    }

    pub fn has_fired(&self) -> bool {
        *self.fired.lock().unwrap()
    }

    pub fn wait(&self) {
        let mut fired = self.fired.lock().unwrap();
        while !*fired {
            fired = self.cond.wait(fired).unwrap();
        }
    }

    /// Returns false if the timeout lapsed first.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut fired = self.fired.lock().unwrap();
        let deadline = std::time::Instant::now() + timeout;
        while !*fired {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self.cond.wait_timeout(fired, deadline - now).unwrap();
            fired = guard;
        }
        true
    }
}

impl Default for Notification {
    fn default() -> Self {
        Self::new()
    }
}

// How the asynchronous operations wake the monitor thread out of its
// blocking wait. Guarded by a mutex so a wake cannot race thread teardown.
pub(crate) enum WakerState {
    None,
    Eventfd(Handle),
    ThreadSignal { tid: libc::pid_t },
}

pub(crate) struct MonitorShared {
    pub verdict: Mutex<Verdict>,
    pub done: Notification,
    pub setup: Notification,
    /// Unix millis; 0 disarms the wall-time deadline.
    pub deadline_millis: AtomicI64,
    pub external_kill_request: AtomicBool,
    pub dump_stack_request: AtomicBool,
    waker: Mutex<WakerState>,
}

impl MonitorShared {
    fn new() -> Self {
        Self {
            verdict: Mutex::new(Verdict::new()),
            done: Notification::new(),
            setup: Notification::new(),
            deadline_millis: AtomicI64::new(0),
            external_kill_request: AtomicBool::new(false),
            dump_stack_request: AtomicBool::new(false),
            waker: Mutex::new(WakerState::None),
        }
    }

    pub fn set_exit_status(&self, status: FinalStatus, reason_code: i64) {
        self.verdict.lock().unwrap().set_exit_status(status, reason_code);
    }

    pub fn verdict_pending(&self) -> bool {
        self.verdict.lock().unwrap().final_status() == FinalStatus::Pending
    }

    pub(crate) fn install_waker(&self, waker: WakerState) {
        *self.waker.lock().unwrap() = waker;
    }

    pub(crate) fn clear_waker(&self) {
        *self.waker.lock().unwrap() = WakerState::None;
    }

    /// Wakes the monitor thread out of poll()/sigtimedwait(), whatever it
    /// is blocking in. Loses no wakeups during teardown: the waker is
    /// cleared under the same lock.
    pub fn wake(&self) {
        let waker = self.waker.lock().unwrap();
        match &*waker {
            WakerState::None => {}
            WakerState::Eventfd(fd) => {
                let value: u64 = 1;
                let res = unsafe {
                    libc::write(
                        fd.as_raw(),
                        &value as *const u64 as *const libc::c_void,
                        core::mem::size_of::<u64>(),
                    )
                };
                if res != core::mem::size_of::<u64>() as isize {
                    // An eventfd write can only fail if the descriptor is
                    // gone, which means the waker state is corrupt.
                    raw_fatal(format_args!("eventfd wakeup write failed"));
                }
            }
            WakerState::ThreadSignal { tid } => unsafe {
                libc::syscall(libc::SYS_tgkill, std::process::id() as c_int, *tid, WAKE_SIGNAL);
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorKind {
    /// ptrace + SECCOMP_RET_TRACE event loop.
    Ptrace,
    /// seccomp user-notify event loop with a status pipe.
    Unotify,
}

/// Everything the supervisor needs to take over a freshly executed
/// sandboxee. The process record and the notify hooks move into the
/// monitor; policy and allowlist stay shared and immutable.
pub struct MonitorOptions {
    pub kind: MonitorKind,
    pub process: Process,
    pub policy: Arc<Policy>,
    pub notify: Box<dyn Notify>,
    pub ipc: Ipc,
    pub limits: Limits,
    pub allowed_hosts: Option<Arc<AllowedHosts>>,
}

/// Client-side handle to a running (or finished) monitor.
pub struct Monitor {
    shared: Arc<MonitorShared>,
    thread: Option<JoinHandle<()>>,
    proxy_thread: Option<JoinHandle<()>>,
    main_pid: libc::pid_t,
}

impl Monitor {
    /// Runs the bring-up sequence and hands off to the variant event loop
    /// on a dedicated thread. Every failure mode still produces a monitor
    /// whose verdict is final and whose done-notification has fired.
    pub fn launch(mut options: MonitorOptions) -> Monitor {
        let shared = Arc::new(MonitorShared::new());
        let main_pid = options.process.main_pid;

        if let Some(wall_time) = options.limits.wall_time {
            if !wall_time.is_zero() {
                shared
                    .deadline_millis
                    .store(now_unix_millis() + wall_time.as_millis() as i64, Ordering::Relaxed);
            }
        }

        if let Err(code) = bring_up(&mut options) {
            shared.set_exit_status(FinalStatus::SetupError, code);
            let verdict = shared.verdict.lock().unwrap().clone();
            options.notify.on_done(&verdict);
            shared.done.notify();
            return Monitor {
                shared,
                thread: None,
                proxy_thread: None,
                main_pid,
            };
        }

        let proxy_pieces = options.allowed_hosts.take().and_then(|hosts| {
            match options.ipc.take_proxy_handle() {
                Some(handle) => Some((hosts, handle)),
                None => {
                    warn!("allowed hosts configured but no proxy channel was registered");
                    None
                }
            }
        });
        let (proxy_thread, proxy_status) = match proxy_pieces {
            Some((hosts, handle)) => {
                let status = Arc::new(ProxyStatus::new());
                let thread = spawn_proxy_thread(main_pid, hosts, handle, &shared, &status);
                (thread, Some(status))
            }
            None => (None, None),
        };

        let thread = {
            let shared = Arc::clone(&shared);
            let kind = options.kind;
            let process = options.process;
            let policy = Arc::clone(&options.policy);
            let notify = options.notify;
            let proxy_status = proxy_status.clone();
            std::thread::Builder::new()
                .name(format!("cordon-monitor-{}", main_pid))
                .spawn(move || {
                    monitor_thread_main(kind, shared, process, policy, notify, proxy_status)
                })
        };
        let thread = match thread {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!("cannot spawn monitor thread: {}", e);
                shared.set_exit_status(FinalStatus::SetupError, reason::FAILED_MONITOR);
                shared.done.notify();
                None
            }
        };
        if thread.is_some() {
            // Block until the event loop has installed its wake mechanism,
            // so kill()/set_wall_time_limit() are effective immediately.
            shared.setup.wait();
        }

        Monitor {
            shared,
            thread,
            proxy_thread,
            main_pid,
        }
    }

    pub fn pid(&self) -> libc::pid_t {
        self.main_pid
    }

    pub fn is_done(&self) -> bool {
        self.shared.done.has_fired()
    }

    /// Asynchronously requests the sandboxee's termination. Completion is
    /// observed through the done-notification.
    pub fn kill(&self) {
        self.shared
            .external_kill_request
            .store(true, Ordering::Release);
        self.shared.wake();
    }

    /// Asks the monitor to log the sandboxee's current stack trace.
    pub fn dump_stack_trace(&self) {
        self.shared.dump_stack_request.store(true, Ordering::Release);
        self.shared.wake();
    }

    /// Arms (or with a zero duration disarms) the wall-clock deadline.
    pub fn set_wall_time_limit(&self, limit: Duration) {
        if limit.is_zero() {
            debug!("disarming the wall-time deadline");
            self.shared.deadline_millis.store(0, Ordering::Relaxed);
        } else {
            let deadline = now_unix_millis() + limit.as_millis() as i64;
            debug!("arming the wall-time deadline at unix-millis {}", deadline);
            self.shared.deadline_millis.store(deadline, Ordering::Relaxed);
        }
        self.shared.wake();
    }

    /// Blocks until the verdict is final, or fails with DeadlineExceeded
    /// after `timeout` without touching the verdict.
    pub fn await_result_with_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Verdict, SupervisorError> {
        if !self.shared.done.wait_timeout(timeout) {
            return Err(SupervisorError::DeadlineExceeded);
        }
        self.join_monitor_thread();
        Ok(self.shared.verdict.lock().unwrap().clone())
    }

    /// Blocks without a timeout and returns the final verdict.
    pub fn await_result(&mut self) -> Verdict {
        self.shared.done.wait();
        self.join_monitor_thread();
        self.shared.verdict.lock().unwrap().clone()
    }

    fn join_monitor_thread(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        if let Some(thread) = self.proxy_thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        if self.thread.is_some() && !self.is_done() {
            self.kill();
            self.shared.done.wait();
        }
        self.join_monitor_thread();
    }
}

fn spawn_proxy_thread(
    main_pid: libc::pid_t,
    hosts: Arc<AllowedHosts>,
    handle: Handle,
    shared: &Arc<MonitorShared>,
    status: &Arc<ProxyStatus>,
) -> Option<JoinHandle<()>> {
    let wake_shared = Arc::clone(shared);
    let status = Arc::clone(status);
    let comms = Comms::from_handle(handle);
    let result = std::thread::Builder::new()
        .name(format!("cordon-proxy-{}", main_pid))
        .spawn(move || {
            let mut server = NetworkProxyServer::new(
                comms,
                hosts,
                status,
                Box::new(move || wake_shared.wake()),
            );
            server.run();
        });
    match result {
        Ok(handle) => Some(handle),
        Err(e) => {
            error!("cannot spawn network proxy thread: {}", e);
            None
        }
    }
}

// The five bring-up steps shared by both monitor variants. Runs on the
// caller thread; the sandboxee is expected to be blocked on its comms
// endpoint going through the same sequence.
fn bring_up(options: &mut MonitorOptions) -> Result<(), i64> {
    init_send_policy(options).map_err(|_| reason::FAILED_POLICY)?;
    wait_for_sandbox_ready(&mut options.process.comms).map_err(|_| reason::FAILED_READY)?;
    init_send_ipc(options).map_err(|_| reason::FAILED_IPC)?;
    init_send_cwd(&mut options.process.comms).map_err(|_| reason::FAILED_CWD)?;
    init_apply_limits(options).map_err(|_| reason::FAILED_LIMITS)?;
    Ok(())
}

fn init_send_policy(options: &mut MonitorOptions) -> Result<(), SupervisorError> {
    let bytes = match options.kind {
        MonitorKind::Ptrace => options.policy.filter_bytes().to_vec(),
        MonitorKind::Unotify => {
            let rewritten = seccomp::rewrite_filter_for_user_notif(options.policy.filter());
            let byte_len = rewritten.len() * core::mem::size_of::<libc::sock_filter>();
            let mut bytes = vec![0u8; byte_len];
            unsafe {
                core::ptr::copy_nonoverlapping(
                    rewritten.as_ptr() as *const u8,
                    bytes.as_mut_ptr(),
                    byte_len,
                );
            }
            bytes
        }
    };
    debug!("sending {} bytes of seccomp policy", bytes.len());
    options.process.comms.send_bytes(&bytes)?;
    Ok(())
}

fn wait_for_sandbox_ready(comms: &mut Comms) -> Result<(), SupervisorError> {
    let token = comms.recv_u32()?;
    if token != SANDBOX_READY {
        error!(
            "expected sandbox-ready token {:#x}, received {:#x}",
            SANDBOX_READY, token
        );
        return Err(SupervisorError::OsOperationFailed {
            description: "sandbox ready handshake",
            os_code: 0,
        });
    }
    debug!("sandboxee reports its filter is installed");
    Ok(())
}

fn init_send_ipc(options: &mut MonitorOptions) -> Result<(), SupervisorError> {
    let comms = &mut options.process.comms;
    options.ipc.send(comms)?;
    Ok(())
}

fn init_send_cwd(comms: &mut Comms) -> Result<(), SupervisorError> {
    let cwd = std::env::current_dir().map_err(|e| SupervisorError::OsOperationFailed {
        description: "getcwd()",
        os_code: e.raw_os_error().unwrap_or(0) as i64,
    })?;
    comms.send_string(&cwd.to_string_lossy())?;
    Ok(())
}

fn init_apply_limits(options: &mut MonitorOptions) -> Result<(), SupervisorError> {
    options.limits.apply(options.process.main_pid)
}

// Runs the variant event loop and guarantees the exactly-once completion
// contract: whatever happens inside (including a panic), the verdict is
// finalized, the on_done hook runs, and the done-notification fires.
fn monitor_thread_main(
    kind: MonitorKind,
    shared: Arc<MonitorShared>,
    process: Process,
    policy: Arc<Policy>,
    mut notify: Box<dyn Notify>,
    proxy_status: Option<Arc<ProxyStatus>>,
) {
    let result = catch_unwind(AssertUnwindSafe(|| match kind {
        MonitorKind::Ptrace => ptrace::run(&shared, process, policy, notify.as_mut(), proxy_status),
        MonitorKind::Unotify => {
            unotify::run(&shared, process, policy, notify.as_mut(), proxy_status)
        }
    }));
    if result.is_err() {
        error!("monitor thread panicked, finalizing the verdict");
        shared.set_exit_status(FinalStatus::InternalError, reason::FAILED_MONITOR);
    }
    // Backstop: a loop that somehow exited without deciding still must not
    // leave the verdict pending.
    if shared.verdict_pending() {
        shared.set_exit_status(FinalStatus::InternalError, reason::FAILED_MONITOR);
    }
    let mut usage: libc::rusage = unsafe { core::mem::zeroed() };
    if unsafe { libc::getrusage(libc::RUSAGE_THREAD, &mut usage) } == 0 {
        shared
            .verdict
            .lock()
            .unwrap()
            .set_monitor_usage(ResourceUsage::from_rusage(&usage));
    }
    shared.clear_waker();
    // In case the loop died before signalling readiness.
    shared.setup.notify();
    let verdict = shared.verdict.lock().unwrap().clone();
    notify.on_done(&verdict);
    shared.done.notify();
}
