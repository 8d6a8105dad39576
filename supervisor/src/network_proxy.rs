//! Brokers outbound connect() calls on behalf of the sandboxee. The
//! sandboxee sends a raw sockaddr as a bytes frame; the proxy validates it
//! against an immutable allowlist and either returns a connected socket
//! via descriptor passing or an errno.

use crate::util::last_os_error_code;
use cordon_comms::Comms;
use cordon_policy::Handle;
use core::mem;
use libc::{c_int, c_void};
use log::{info, warn};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// One allowlist entry: an address (optionally a subnet) and a port
/// range. `port_min == port_max == 0` allows any port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRule {
    ip: IpAddr,
    prefix_len: u8,
    port_min: u16,
    port_max: u16,
}

impl ProxyRule {
    /// A single host and exact port; port 0 allows every port.
    pub fn host(ip: IpAddr, port: u16) -> Self {
        let prefix_len = match ip {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        Self {
            ip,
            prefix_len,
            port_min: port,
            port_max: port,
        }
    }

    pub fn subnet(ip: IpAddr, prefix_len: u8, port_min: u16, port_max: u16) -> Self {
        Self {
            ip,
            prefix_len,
            port_min,
            port_max,
        }
    }

    fn matches(&self, addr: &SocketAddr) -> bool {
        let port_ok = (self.port_min == 0 && self.port_max == 0)
            || (addr.port() >= self.port_min && addr.port() <= self.port_max);
        if !port_ok {
            return false;
        }
        match (self.ip, addr.ip()) {
            (IpAddr::V4(rule), IpAddr::V4(peer)) => {
                let bits = u32::from(self.prefix_len.min(32));
                let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
                (u32::from(rule) & mask) == (u32::from(peer) & mask)
            }
            (IpAddr::V6(rule), IpAddr::V6(peer)) => {
                let bits = u32::from(self.prefix_len.min(128));
                let mask = if bits == 0 {
                    0
                } else {
                    u128::MAX << (128 - bits)
                };
                (u128::from(rule) & mask) == (u128::from(peer) & mask)
            }
            _ => false,
        }
    }
}

/// The immutable set of (address, port-range) tuples the proxy permits.
#[derive(Debug, Clone, Default)]
pub struct AllowedHosts {
    rules: Vec<ProxyRule>,
}

impl AllowedHosts {
    pub fn new(rules: Vec<ProxyRule>) -> Self {
        Self { rules }
    }

    pub fn is_host_allowed(&self, addr: &SocketAddr) -> bool {
        self.rules.iter().any(|rule| rule.matches(addr))
    }
}

// Interprets a raw sockaddr buffer received from the sandboxee. Only an
// exactly-sized sockaddr_in with AF_INET or sockaddr_in6 with AF_INET6 is
// accepted; anything else is malformed.
pub(crate) fn parse_sockaddr(bytes: &[u8]) -> Option<SocketAddr> {
    if bytes.len() < mem::size_of::<libc::sa_family_t>() {
        return None;
    }
    let mut family_bytes = [0u8; 2];
    family_bytes.copy_from_slice(&bytes[..2]);
    let family = libc::sa_family_t::from_ne_bytes(family_bytes) as c_int;
    match family {
        libc::AF_INET if bytes.len() == mem::size_of::<libc::sockaddr_in>() => {
            let sin: libc::sockaddr_in =
                unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Some(SocketAddr::new(IpAddr::V4(ip), u16::from_be(sin.sin_port)))
        }
        libc::AF_INET6 if bytes.len() == mem::size_of::<libc::sockaddr_in6>() => {
            let sin6: libc::sockaddr_in6 =
                unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::new(
                IpAddr::V6(ip),
                u16::from_be(sin6.sin6_port),
            ))
        }
        _ => None,
    }
}

/// Violation state shared between the proxy thread and the monitor.
/// The message is stored before the flag is released, so a monitor that
/// observes the flag with acquire ordering also observes the message.
#[derive(Debug, Default)]
pub struct ProxyStatus {
    violation_occurred: AtomicBool,
    violation_msg: Mutex<String>,
}

impl ProxyStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn violation_occurred(&self) -> bool {
        self.violation_occurred.load(Ordering::Acquire)
    }

    pub fn violation_msg(&self) -> String {
        self.violation_msg.lock().unwrap().clone()
    }

    fn record_violation(&self, msg: String) {
        *self.violation_msg.lock().unwrap() = msg;
        self.violation_occurred.store(true, Ordering::Release);
    }
}

/// The proxy loop. Owns its comms endpoint; holds only a wake callback
/// towards the monitor, never a reference to it.
pub struct NetworkProxyServer {
    comms: Comms,
    allowed_hosts: Arc<AllowedHosts>,
    status: Arc<ProxyStatus>,
    notify_violation: Box<dyn FnMut() + Send>,
    fatal_error: bool,
}

impl NetworkProxyServer {
    pub fn new(
        comms: Comms,
        allowed_hosts: Arc<AllowedHosts>,
        status: Arc<ProxyStatus>,
        notify_violation: Box<dyn FnMut() + Send>,
    ) -> Self {
        Self {
            comms,
            allowed_hosts,
            status,
            notify_violation,
            fatal_error: false,
        }
    }

    /// Serves connect() requests until a violation occurs, a comms
    /// operation fails, or the peer closes the channel.
    pub fn run(&mut self) {
        while !self.fatal_error && !self.status.violation_occurred() {
            self.process_connect_request();
        }
        info!("network proxy shutting down");
    }

    fn process_connect_request(&mut self) {
        let addr_bytes = match self.comms.recv_bytes() {
            Ok(bytes) => bytes,
            Err(_) => {
                self.fatal_error = true;
                return;
            }
        };

        let addr = match parse_sockaddr(&addr_bytes) {
            Some(addr) => addr,
            None => {
                self.send_errno(libc::EINVAL);
                return;
            }
        };

        if !self.allowed_hosts.is_host_allowed(&addr) {
            warn!("connect() to {} denied by policy", addr);
            self.status.record_violation(addr.to_string());
            (self.notify_violation)();
            return;
        }

        let family = match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };
        let raw = unsafe { libc::socket(family, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
        if raw < 0 {
            self.send_errno(last_os_error_code() as i32);
            return;
        }
        // Owned handle: the socket is closed on every path out of here.
        let sock = unsafe { Handle::from_raw(raw as u64) }.unwrap();

        loop {
            let res = unsafe {
                libc::connect(
                    sock.as_raw(),
                    addr_bytes.as_ptr() as *const c_void as *const libc::sockaddr,
                    addr_bytes.len() as libc::socklen_t,
                )
            };
            if res == 0 {
                break;
            }
            let err = last_os_error_code() as i32;
            if err == libc::EINTR {
                continue;
            }
            self.send_errno(err);
            return;
        }

        self.send_errno(0);
        if !self.fatal_error && self.comms.send_fd(&sock).is_err() {
            self.fatal_error = true;
        }
    }

    fn send_errno(&mut self, saved_errno: i32) {
        if self.comms.send_i32(saved_errno).is_err() {
            self.fatal_error = true;
        }
    }
}
