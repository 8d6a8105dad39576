use crate::PolicyError;
use libc::sock_filter;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// Kernel limit on the number of instructions in one BPF program.
pub const BPF_MAXINSNS: usize = 4096;

/// A mount point the executor binds into the sandboxee's mount namespace.
/// Carried as opaque metadata for the executor; the supervisor core never
/// interprets it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathBinding {
    pub outside: PathBuf,
    pub inside: PathBuf,
    pub writable: bool,
}

/// An immutable, compiled sandbox policy: the seccomp-BPF program to install
/// in the sandboxee plus the metadata the monitor consults at run time.
///
/// Producing one of these (syscall tables, argument matchers, BPF assembly)
/// is the policy builder's job and happens before the supervisor is
/// involved; from the monitor's perspective a Policy never changes.
#[derive(Debug, Clone)]
pub struct Policy {
    filter: Vec<sock_filter>,
    // Syscall numbers delivered to the trace monitor whose return value
    // must be inspected after the syscall completes.
    inspect_after_return: BTreeSet<u64>,
    // Syscall numbers the notify monitor lets through with
    // SECCOMP_USER_NOTIF_FLAG_CONTINUE.
    allow_on_notify: BTreeSet<u64>,
    // Syscall numbers the notify monitor answers with a fixed errno
    // instead of executing them.
    notify_errnos: BTreeMap<u64, i32>,
    collect_stacktrace_on_violation: bool,
    uses_pid_namespace: bool,
    bindings: Vec<PathBinding>,
}

impl Policy {
    pub fn new(filter: Vec<sock_filter>) -> Result<Self, PolicyError> {
        if filter.is_empty() {
            return Err(PolicyError::EmptyFilter);
        }
        if filter.len() > BPF_MAXINSNS {
            return Err(PolicyError::FilterTooLong {
                instructions: filter.len(),
            });
        }
        Ok(Self {
            filter,
            inspect_after_return: BTreeSet::new(),
            allow_on_notify: BTreeSet::new(),
            notify_errnos: BTreeMap::new(),
            collect_stacktrace_on_violation: true,
            uses_pid_namespace: false,
            bindings: Vec::new(),
        })
    }

    pub fn with_inspect_after_return(mut self, syscalls: &[u64]) -> Self {
        self.inspect_after_return.extend(syscalls.iter().copied());
        self
    }

    pub fn with_allow_on_notify(mut self, syscalls: &[u64]) -> Self {
        self.allow_on_notify.extend(syscalls.iter().copied());
        self
    }

    pub fn with_notify_errno(mut self, syscall: u64, errno: i32) -> Self {
        self.notify_errnos.insert(syscall, errno);
        self
    }

    pub fn with_stacktrace_collection(mut self, enabled: bool) -> Self {
        self.collect_stacktrace_on_violation = enabled;
        self
    }

    pub fn with_pid_namespace(mut self, enabled: bool) -> Self {
        self.uses_pid_namespace = enabled;
        self
    }

    pub fn with_binding(mut self, binding: PathBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    pub fn filter(&self) -> &[sock_filter] {
        &self.filter
    }

    /// The raw bytes of the BPF program, as transmitted to the sandboxee.
    pub fn filter_bytes(&self) -> &[u8] {
        // sock_filter is a plain #[repr(C)] struct, viewing the instruction
        // array as bytes is well-defined.
        unsafe {
            std::slice::from_raw_parts(
                self.filter.as_ptr() as *const u8,
                self.filter.len() * std::mem::size_of::<sock_filter>(),
            )
        }
    }

    pub fn inspect_after_return(&self, syscall: u64) -> bool {
        self.inspect_after_return.contains(&syscall)
    }

    pub fn allows_on_notify(&self, syscall: u64) -> bool {
        self.allow_on_notify.contains(&syscall)
    }

    pub fn notify_errno(&self, syscall: u64) -> Option<i32> {
        self.notify_errnos.get(&syscall).copied()
    }

    pub fn collect_stacktrace_on_violation(&self) -> bool {
        self.collect_stacktrace_on_violation
    }

    pub fn uses_pid_namespace(&self) -> bool {
        self.uses_pid_namespace
    }

    pub fn bindings(&self) -> &[PathBinding] {
        &self.bindings
    }
}
