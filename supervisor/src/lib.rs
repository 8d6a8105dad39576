// The supervisor core: launches nothing itself, but takes over a child
// produced by an executor, enforces its compiled seccomp policy through
// one of two monitor variants, brokers its outbound connections, and
// terminates with a precise verdict.

mod error;
mod executor;
mod monitor;
mod network_proxy;
mod notify;
mod regs;
pub mod seccomp;
mod stack_trace;
mod syscall;
mod util;
mod verdict;

pub use error::SupervisorError;
pub use executor::{Ipc, Limits, Process, NETWORK_PROXY_CHANNEL_NAME};
pub use monitor::{Monitor, MonitorKind, MonitorOptions, Notification, SANDBOX_READY};
pub use network_proxy::{AllowedHosts, NetworkProxyServer, ProxyRule, ProxyStatus};
pub use notify::{Notify, NullNotify, ViolationKind};
pub use regs::Regs;
pub use syscall::{CpuArch, Syscall};
pub use util::{raw_fatal, StackBuffer};
pub use verdict::{reason, FinalStatus, ResourceUsage, Verdict};
