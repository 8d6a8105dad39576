use crate::syscall::{CpuArch, Syscall};
use core::fmt::{Display, Formatter};
use log::debug;

/// Final classification of a supervised execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalStatus {
    /// The monitor has not finished yet.
    Pending,
    Ok,
    SetupError,
    Violation,
    Signaled,
    Timeout,
    ExternalKill,
    InternalError,
}

impl Display for FinalStatus {
    fn fmt(&self, f: &mut Formatter) -> core::fmt::Result {
        let name = match self {
            FinalStatus::Pending => "PENDING",
            FinalStatus::Ok => "OK",
            FinalStatus::SetupError => "SETUP_ERROR",
            FinalStatus::Violation => "VIOLATION",
            FinalStatus::Signaled => "SIGNALED",
            FinalStatus::Timeout => "TIMEOUT",
            FinalStatus::ExternalKill => "EXTERNAL_KILL",
            FinalStatus::InternalError => "INTERNAL_ERROR",
        };
        write!(f, "{}", name)
    }
}

/// Reason codes accompanying SETUP_ERROR / INTERNAL_ERROR verdicts, plus
/// the network marker for VIOLATION.
pub mod reason {
    pub const FAILED_POLICY: i64 = -1;
    pub const FAILED_READY: i64 = -2;
    pub const FAILED_IPC: i64 = -3;
    pub const FAILED_CWD: i64 = -4;
    pub const FAILED_LIMITS: i64 = -5;
    pub const FAILED_SIGNALS: i64 = -6;
    pub const FAILED_ATTACH: i64 = -7;
    pub const FAILED_NOTIFY: i64 = -8;
    pub const FAILED_MONITOR: i64 = -9;
    pub const FAILED_FETCH: i64 = -10;
    pub const FAILED_KILL: i64 = -11;
    /// A disallowed connect() brokered by the network proxy.
    pub const VIOLATION_NETWORK: i64 = -100;
}

/// Distilled rusage of the sandboxee or of the monitor thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceUsage {
    pub user_time_us: i64,
    pub system_time_us: i64,
    pub max_rss_kb: i64,
}

impl ResourceUsage {
    pub(crate) fn from_rusage(ru: &libc::rusage) -> Self {
        Self {
            user_time_us: ru.ru_utime.tv_sec * 1_000_000 + ru.ru_utime.tv_usec,
            system_time_us: ru.ru_stime.tv_sec * 1_000_000 + ru.ru_stime.tv_usec,
            max_rss_kb: ru.ru_maxrss,
        }
    }
}

/// The monitor's terminal record for one sandboxed execution. Written only
/// by the monitor thread; once `final_status` leaves PENDING the record is
/// frozen (later writes are dropped). Clients read it after the
/// done-notification fires.
#[derive(Debug, Clone)]
pub struct Verdict {
    final_status: FinalStatus,
    reason_code: i64,
    syscall: Option<Syscall>,
    stack_trace: Option<Vec<String>>,
    prog_name: Option<String>,
    network_violation_msg: Option<String>,
    sandboxee_usage: Option<ResourceUsage>,
    monitor_usage: Option<ResourceUsage>,
}

impl Verdict {
    pub(crate) fn new() -> Self {
        Self {
            final_status: FinalStatus::Pending,
            reason_code: 0,
            syscall: None,
            stack_trace: None,
            prog_name: None,
            network_violation_msg: None,
            sandboxee_usage: None,
            monitor_usage: None,
        }
    }

    pub fn final_status(&self) -> FinalStatus {
        self.final_status
    }

    pub fn reason_code(&self) -> i64 {
        self.reason_code
    }

    pub fn syscall(&self) -> Option<&Syscall> {
        self.syscall.as_ref()
    }

    pub fn syscall_arch(&self) -> CpuArch {
        self.syscall.map(|s| s.arch()).unwrap_or_else(CpuArch::host)
    }

    pub fn stack_trace(&self) -> Option<&[String]> {
        self.stack_trace.as_deref()
    }

    pub fn prog_name(&self) -> Option<&str> {
        self.prog_name.as_deref()
    }

    pub fn network_violation_msg(&self) -> Option<&str> {
        self.network_violation_msg.as_deref()
    }

    pub fn sandboxee_usage(&self) -> Option<ResourceUsage> {
        self.sandboxee_usage
    }

    pub fn monitor_usage(&self) -> Option<ResourceUsage> {
        self.monitor_usage
    }

    /// First write wins; the record is immutable once decided.
    pub(crate) fn set_exit_status(&mut self, status: FinalStatus, reason_code: i64) {
        if self.final_status != FinalStatus::Pending {
            debug!(
                "verdict already {} ({}), dropping late status {} ({})",
                self.final_status, self.reason_code, status, reason_code
            );
            return;
        }
        self.final_status = status;
        self.reason_code = reason_code;
    }

    pub(crate) fn set_syscall(&mut self, syscall: Syscall) {
        self.syscall.get_or_insert(syscall);
    }

    pub(crate) fn set_stack_trace(&mut self, trace: Vec<String>) {
        self.stack_trace.get_or_insert(trace);
    }

    pub(crate) fn set_prog_name(&mut self, name: String) {
        self.prog_name.get_or_insert(name);
    }

    pub(crate) fn set_network_violation_msg(&mut self, msg: String) {
        self.network_violation_msg.get_or_insert(msg);
    }

    pub(crate) fn set_sandboxee_usage(&mut self, usage: ResourceUsage) {
        self.sandboxee_usage.get_or_insert(usage);
    }

    pub(crate) fn set_monitor_usage(&mut self, usage: ResourceUsage) {
        self.monitor_usage.get_or_insert(usage);
    }

    /// One-line human-readable summary.
    pub fn describe(&self) -> String {
        match self.final_status {
            FinalStatus::Pending => "execution still in progress".to_owned(),
            FinalStatus::Ok => format!("process exited with code {}", self.reason_code),
            FinalStatus::SetupError => {
                format!("sandbox setup failed (reason {})", self.reason_code)
            }
            FinalStatus::Violation => match (&self.network_violation_msg, &self.syscall) {
                (Some(msg), _) => format!("network policy violation: connect to {}", msg),
                (None, Some(sys)) => format!("policy violation: {}", sys),
                (None, None) => format!("policy violation (syscall {})", self.reason_code),
            },
            FinalStatus::Signaled => format!(
                "process terminated by signal {} ({})",
                self.reason_code,
                signal_name(self.reason_code as i32)
            ),
            FinalStatus::Timeout => "wall-time limit exceeded".to_owned(),
            FinalStatus::ExternalKill => "killed on external request".to_owned(),
            FinalStatus::InternalError => {
                format!("monitor internal error (reason {})", self.reason_code)
            }
        }
    }
}

pub(crate) fn signal_name(signal: i32) -> &'static str {
    match signal {
        libc::SIGHUP => "SIGHUP",
        libc::SIGINT => "SIGINT",
        libc::SIGQUIT => "SIGQUIT",
        libc::SIGILL => "SIGILL",
        libc::SIGTRAP => "SIGTRAP",
        libc::SIGABRT => "SIGABRT",
        libc::SIGBUS => "SIGBUS",
        libc::SIGFPE => "SIGFPE",
        libc::SIGKILL => "SIGKILL",
        libc::SIGUSR1 => "SIGUSR1",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGUSR2 => "SIGUSR2",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGALRM => "SIGALRM",
        libc::SIGTERM => "SIGTERM",
        libc::SIGCHLD => "SIGCHLD",
        libc::SIGCONT => "SIGCONT",
        libc::SIGSTOP => "SIGSTOP",
        libc::SIGSYS => "SIGSYS",
        _ => "?",
    }
}
