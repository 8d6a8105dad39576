use crate::error::SupervisorError;
use crate::util::last_os_error_code;
use cordon_comms::{Comms, CommsError};
use cordon_policy::Handle;
use libc::c_int;
use log::{debug, error};
use std::time::Duration;

/// Name under which the network-proxy endpoint is forwarded to the
/// sandboxee during bring-up.
pub const NETWORK_PROXY_CHANNEL_NAME: &str = "network_proxy";

/// The sandboxee as handed over by the executor. The monitor takes
/// ownership of the whole record; every descriptor in it is owned.
#[derive(Debug)]
pub struct Process {
    /// The sandboxee's main pid.
    pub main_pid: libc::pid_t,
    /// Pid of the init-like process of the sandboxee's PID namespace,
    /// 0 when no PID namespace is used.
    pub init_pid: libc::pid_t,
    /// One-direction pipe carrying the child's final wait status (and its
    /// rusage) to the notify monitor.
    pub status_fd: Option<Handle>,
    /// Seccomp user-notify listener descriptor (notify monitor only).
    pub notify_fd: Option<Handle>,
    /// True when the executor hands over the child before its initial
    /// execve; the trace monitor then ignores events until the exec.
    pub awaiting_execve: bool,
    /// Supervisor-side comms endpoint, connected to the sandboxee.
    pub comms: Comms,
}

/// Resource limits applied to the sandboxee's main pid during bring-up.
/// `wall_time` arms the monitor's deadline instead of an rlimit.
#[derive(Debug, Clone, Default)]
pub struct Limits {
    pub address_space_bytes: Option<u64>,
    pub cpu_time_secs: Option<u64>,
    pub file_size_bytes: Option<u64>,
    pub open_files: Option<u64>,
    pub core_size_bytes: Option<u64>,
    pub wall_time: Option<Duration>,
}

impl Limits {
    fn entries(&self) -> Vec<(&'static str, c_int, u64)> {
        let mut out = Vec::new();
        if let Some(v) = self.address_space_bytes {
            out.push(("RLIMIT_AS", libc::RLIMIT_AS as c_int, v));
        }
        if let Some(v) = self.cpu_time_secs {
            out.push(("RLIMIT_CPU", libc::RLIMIT_CPU as c_int, v));
        }
        if let Some(v) = self.file_size_bytes {
            out.push(("RLIMIT_FSIZE", libc::RLIMIT_FSIZE as c_int, v));
        }
        if let Some(v) = self.open_files {
            out.push(("RLIMIT_NOFILE", libc::RLIMIT_NOFILE as c_int, v));
        }
        if let Some(v) = self.core_size_bytes {
            out.push(("RLIMIT_CORE", libc::RLIMIT_CORE as c_int, v));
        }
        out
    }

    /// Applies every configured rlimit to `pid` with prlimit64().
    pub(crate) fn apply(&self, pid: libc::pid_t) -> Result<(), SupervisorError> {
        for (name, resource, value) in self.entries() {
            let rlim = libc::rlimit64 {
                rlim_cur: value,
                rlim_max: value,
            };
            let res = unsafe {
                libc::prlimit64(pid, resource as _, &rlim, core::ptr::null_mut())
            };
            if res != 0 {
                error!("prlimit64({}, {}) failed on pid {}", name, value, pid);
                return Err(SupervisorError::OsOperationFailed {
                    description: "prlimit64()",
                    os_code: last_os_error_code(),
                });
            }
            debug!("applied {}={} to pid {}", name, value, pid);
        }
        Ok(())
    }
}

/// User-registered data-exchange channels forwarded to the sandboxee
/// during bring-up, keyed by name. Also the factory for the network-proxy
/// socketpair.
#[derive(Debug, Default)]
pub struct Ipc {
    channels: Vec<(String, Handle)>,
    proxy_server_end: Option<Handle>,
}

impl Ipc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an endpoint to be passed to the sandboxee under `name`.
    /// The descriptor is owned by the registry until bring-up transfers it.
    pub fn register(&mut self, name: &str, handle: Handle) {
        self.channels.push((name.to_owned(), handle));
    }

    /// Creates the socketpair brokering connect() requests: the client end
    /// is registered for the sandboxee, the server end is retained for the
    /// proxy thread.
    pub fn enable_network_proxy(&mut self) -> Result<(), SupervisorError> {
        let mut socks: [c_int; 2] = [-1, -1];
        // Owned by this block alone until wrapped into Handles.
        let res = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
                0,
                socks.as_mut_ptr(),
            )
        };
        if res != 0 {
            return Err(SupervisorError::OsOperationFailed {
                description: "socketpair()",
                os_code: last_os_error_code(),
            });
        }
        let server = unsafe { Handle::from_raw(socks[0] as u64) }.unwrap();
        let client = unsafe { Handle::from_raw(socks[1] as u64) }.unwrap();
        self.register(NETWORK_PROXY_CHANNEL_NAME, client);
        self.proxy_server_end = Some(server);
        Ok(())
    }

    pub(crate) fn take_proxy_handle(&mut self) -> Option<Handle> {
        self.proxy_server_end.take()
    }

    /// Transfers every registered endpoint over the comms channel:
    /// count, then name + FD frame per endpoint. The local descriptors are
    /// closed afterwards, the sandboxee owns the received copies.
    pub(crate) fn send(&mut self, comms: &mut Comms) -> Result<(), CommsError> {
        comms.send_u64(self.channels.len() as u64)?;
        for (name, handle) in self.channels.drain(..) {
            debug!("forwarding ipc endpoint {:?} (fd {})", name, handle.as_raw());
            comms.send_string(&name)?;
            comms.send_fd(&handle)?;
        }
        Ok(())
    }
}
