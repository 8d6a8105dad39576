use crate::syscall::Syscall;
use crate::verdict::Verdict;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    /// A syscall the policy does not allow.
    Syscall,
    /// A syscall issued under a different architecture personality than
    /// the one the policy was compiled for.
    ArchitectureSwitch,
    /// A connect() target rejected by the network proxy.
    NetworkConnect,
}

/// User hooks invoked by the monitor on policy-relevant events. All
/// methods default to no-ops; implementations run on the monitor thread
/// and must not block for long.
pub trait Notify: Send {
    fn on_syscall_violation(&mut self, _syscall: &Syscall, _kind: ViolationKind) {}

    fn on_network_violation(&mut self, _violation_msg: &str) {}

    fn on_signal(&mut self, _signal: i32, _pid: libc::pid_t) {}

    /// A syscall recorded for post-exit inspection returned to userspace.
    fn on_syscall_exit(&mut self, _syscall: &Syscall, _return_value: i64) {}

    /// The verdict is final; fired exactly once, right before the
    /// done-notification.
    fn on_done(&mut self, _verdict: &Verdict) {}
}

/// The default hook set: observes nothing.
#[derive(Debug, Default)]
pub struct NullNotify;

impl Notify for NullNotify {}
