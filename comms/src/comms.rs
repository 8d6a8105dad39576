use crate::error::CommsError;
use crate::{
    CLIENT_COMMS_FD, COMMS_FD_ENV_VAR, MAX_MESSAGE_SIZE, SEND_TLV_INLINE_SIZE, TAG_BOOL, TAG_BYTES,
    TAG_CREDS, TAG_FD, TAG_INT16, TAG_INT32, TAG_INT64, TAG_INT8, TAG_PROTO, TAG_STRING,
    TAG_UINT16, TAG_UINT32, TAG_UINT64, TAG_UINT8, WARN_MESSAGE_SIZE,
};
use bincode::Options;
use cordon_policy::Handle;
use core::mem;
use core::ptr::null_mut;
use libc::{c_int, c_void};
use log::{debug, error, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Error;
use std::sync::atomic::{AtomicU32, Ordering};

// The on-wire frame header. Packed so the layout is exactly
// u32 tag || usize length, with no padding in between.
#[repr(C, packed)]
#[derive(Clone, Copy)]
struct TlvHeader {
    tag: u32,
    len: usize,
}

const TLV_HEADER_SIZE: usize = mem::size_of::<TlvHeader>();

// These calls are C arithmetic macros translated into rust, in practice
// safe (at least in this libc release).
const CMSG_SPACE_FD: usize =
    unsafe { libc::CMSG_SPACE(mem::size_of::<c_int>() as u32) } as usize;
const CMSG_SPACE_CREDS: usize =
    unsafe { libc::CMSG_SPACE(mem::size_of::<libc::ucred>() as u32) } as usize;

fn encode_header(tag: u32, len: usize) -> [u8; TLV_HEADER_SIZE] {
    let header = TlvHeader { tag, len };
    // TlvHeader is repr(C, packed), its bytes are exactly the wire form
    unsafe { mem::transmute::<TlvHeader, [u8; TLV_HEADER_SIZE]>(header) }
}

fn decode_header(bytes: [u8; TLV_HEADER_SIZE]) -> (u32, usize) {
    let header = unsafe { mem::transmute::<[u8; TLV_HEADER_SIZE], TlvHeader>(bytes) };
    let tag = header.tag;
    let len = header.len;
    (tag, len)
}

fn errno() -> i64 {
    Error::last_os_error().raw_os_error().unwrap_or(0) as i64
}

// Errors that leave the stream in a recoverable state (EWOULDBLOCK is an
// alias of EAGAIN on Linux). Anything else terminates the endpoint.
fn is_fatal_errno(err: i64) -> bool {
    !matches!(
        err as i32,
        libc::EAGAIN | libc::EFAULT | libc::EINTR | libc::EINVAL | libc::ENOMEM
    )
}

fn warn_if_oversized(len: usize) {
    static TIMES_WARNED: AtomicU32 = AtomicU32::new(0);
    if len > WARN_MESSAGE_SIZE && TIMES_WARNED.fetch_add(1, Ordering::Relaxed) < 10 {
        warn!(
            "TLV frame of {} bytes detected, consider a shared-memory buffer for transfers this large",
            len
        );
    }
}

fn bincode_options() -> impl bincode::Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_MESSAGE_SIZE as u64)
        .with_native_endian()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

fn create_sockaddr_un(
    socket_name: &str,
    abstract_uds: bool,
) -> (libc::sockaddr_un, libc::socklen_t) {
    let mut sun: libc::sockaddr_un = unsafe { mem::zeroed() };
    sun.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let name = socket_name.as_bytes();
    let offset = usize::from(abstract_uds);
    // An abstract socket address starts with a NUL byte; the rest of the
    // path is a name with no filesystem presence. Filesystem addresses are
    // used verbatim and rely on the zeroed tail for NUL termination.
    for (dst, src) in sun.sun_path[offset..].iter_mut().zip(name.iter()) {
        *dst = *src as libc::c_char;
    }
    let mut slen = mem::size_of::<libc::sa_family_t>() + offset + name.len();
    if slen > mem::size_of::<libc::sockaddr_un>() {
        error!("socket address {:?} is too long, truncating", socket_name);
        slen = mem::size_of::<libc::sockaddr_un>();
    }
    (sun, slen as libc::socklen_t)
}

// Typed fixed-width scalar frames. The value is the host-endian byte
// representation; the receive side validates both tag and width.
macro_rules! scalar_frame_impls {
    ($(($send:ident, $recv:ident, $ty:ty, $tag:expr)),*) => {
        $(
            pub fn $send(&mut self, value: $ty) -> Result<(), CommsError> {
                self.send_tlv($tag, &value.to_ne_bytes())
            }

            pub fn $recv(&mut self) -> Result<$ty, CommsError> {
                let mut bytes = [0u8; mem::size_of::<$ty>()];
                self.recv_scalar($tag, &mut bytes)?;
                Ok(<$ty>::from_ne_bytes(bytes))
            }
        )*
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Connected,
    Terminated,
}

/// One endpoint of the supervisor/sandboxee channel. Owns exactly one
/// stream descriptor; the endpoint is move-only and born connected.
pub struct Comms {
    name: String,
    state: State,
    fd: Option<Handle>,
}

impl Comms {
    /// Wraps an already connected descriptor. The Comms object becomes its
    /// sole owner.
    pub fn from_handle(fd: Handle) -> Self {
        let name = format!(
            "comms:fd={}/pid={}/tid={}",
            fd.as_raw(),
            std::process::id(),
            unsafe { libc::syscall(libc::SYS_gettid) }
        );
        Self {
            name,
            state: State::Connected,
            fd: Some(fd),
        }
    }

    /// The sandboxee-side default connection: `$SANDBOX2_COMMS_FD` when
    /// set (consumed in the process), otherwise the reserved descriptor
    /// 1023.
    pub fn default_connection() -> Result<Self, CommsError> {
        let fd = match std::env::var(COMMS_FD_ENV_VAR) {
            Ok(value) => {
                let fd = value
                    .trim()
                    .parse::<c_int>()
                    .map_err(|_| CommsError::InvalidCommsFdVariable { value: value.clone() })?;
                std::env::remove_var(COMMS_FD_ENV_VAR);
                fd
            }
            Err(_) => CLIENT_COMMS_FD,
        };
        // The descriptor number is part of the launch contract, we are its
        // only user in this process.
        let handle = unsafe { Handle::from_raw(fd as u64) }
            .map_err(|_| CommsError::InvalidCommsFdVariable {
                value: fd.to_string(),
            })?;
        Ok(Self::from_handle(handle))
    }

    /// Client-side connect to a UNIX socket, abstract-namespace when
    /// `abstract_uds` is set, filesystem path otherwise.
    pub fn connect(socket_name: &str, abstract_uds: bool) -> Result<Self, CommsError> {
        let raw = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
        if raw < 0 {
            return Err(CommsError::OsOperationFailed {
                description: "socket(AF_UNIX)",
                os_code: errno(),
            });
        }
        let fd = unsafe { Handle::from_raw(raw as u64) }.unwrap();
        let (sun, slen) = create_sockaddr_un(socket_name, abstract_uds);
        loop {
            let res = unsafe {
                libc::connect(fd.as_raw(), &sun as *const _ as *const libc::sockaddr, slen)
            };
            if res == 0 {
                break;
            }
            let err = errno();
            if err as i32 == libc::EINTR {
                continue;
            }
            return Err(CommsError::OsOperationFailed {
                description: "connect()",
                os_code: err,
            });
        }
        debug!("connected to {:?}, fd {}", socket_name, fd.as_raw());
        Ok(Self {
            name: socket_name.to_owned(),
            state: State::Connected,
            fd: Some(fd),
        })
    }

    pub fn connection_fd(&self) -> c_int {
        self.fd.as_ref().map(|h| h.as_raw()).unwrap_or(-1)
    }

    pub fn is_connected(&self) -> bool {
        self.state == State::Connected
    }

    pub fn is_terminated(&self) -> bool {
        self.state == State::Terminated
    }

    /// Closes the owned descriptor and moves the endpoint to the terminal
    /// state. Idempotent; every subsequent send/recv fails.
    pub fn terminate(&mut self) {
        self.state = State::Terminated;
        self.fd = None;
    }

    fn raw_fd(&self) -> Result<c_int, CommsError> {
        match (&self.fd, self.state) {
            (Some(fd), State::Connected) => Ok(fd.as_raw()),
            _ => Err(CommsError::Terminated),
        }
    }

    // Byte-level send with EINTR retry and short-write completion.
    fn raw_send(&mut self, data: &[u8]) -> Result<(), CommsError> {
        let fd = self.raw_fd()?;
        let mut total_sent = 0;
        while total_sent < data.len() {
            let res = unsafe {
                libc::write(
                    fd,
                    data[total_sent..].as_ptr() as *const c_void,
                    data.len() - total_sent,
                )
            };
            if res < 0 {
                let err = errno();
                if err as i32 == libc::EINTR {
                    continue;
                }
                if err as i32 == libc::EPIPE {
                    self.terminate();
                    return Err(CommsError::PeerDisconnected);
                }
                if is_fatal_errno(err) {
                    self.terminate();
                }
                return Err(CommsError::OsOperationFailed {
                    description: "write()",
                    os_code: err,
                });
            }
            if res == 0 {
                return Err(CommsError::ShortTransfer {
                    transferred: total_sent,
                    requested: data.len(),
                });
            }
            total_sent += res as usize;
        }
        Ok(())
    }

    // Byte-level receive with EINTR retry and short-read completion. A
    // clean close from the peer terminates the endpoint.
    fn raw_recv(&mut self, data: &mut [u8]) -> Result<(), CommsError> {
        let fd = self.raw_fd()?;
        let mut total_recv = 0;
        while total_recv < data.len() {
            let res = unsafe {
                libc::read(
                    fd,
                    data[total_recv..].as_mut_ptr() as *mut c_void,
                    data.len() - total_recv,
                )
            };
            if res < 0 {
                let err = errno();
                if err as i32 == libc::EINTR {
                    continue;
                }
                if is_fatal_errno(err) {
                    self.terminate();
                }
                return Err(CommsError::OsOperationFailed {
                    description: "read()",
                    os_code: err,
                });
            }
            if res == 0 {
                self.terminate();
                return Err(CommsError::PeerDisconnected);
            }
            total_recv += res as usize;
        }
        Ok(())
    }

    // Discards `len` pending value bytes so a failed typed receive leaves
    // the stream aligned on the next frame header.
    fn drain(&mut self, mut len: usize) -> Result<(), CommsError> {
        let mut scratch = [0u8; 256];
        while len > 0 {
            let chunk = len.min(scratch.len());
            self.raw_recv(&mut scratch[..chunk])?;
            len -= chunk;
        }
        Ok(())
    }

    /// Sends one TLV frame. Header and value are combined into a single
    /// write when they fit the inline buffer.
    pub fn send_tlv(&mut self, tag: u32, value: &[u8]) -> Result<(), CommsError> {
        if value.len() > MAX_MESSAGE_SIZE {
            error!(
                "maximum TLV message size exceeded ({} > {})",
                value.len(),
                MAX_MESSAGE_SIZE
            );
            return Err(CommsError::LengthOutOfBounds { length: value.len() });
        }
        warn_if_oversized(value.len());
        let header = encode_header(tag, value.len());
        if TLV_HEADER_SIZE + value.len() <= SEND_TLV_INLINE_SIZE {
            let mut buf = [0u8; SEND_TLV_INLINE_SIZE];
            buf[..TLV_HEADER_SIZE].copy_from_slice(&header);
            buf[TLV_HEADER_SIZE..TLV_HEADER_SIZE + value.len()].copy_from_slice(value);
            self.raw_send(&buf[..TLV_HEADER_SIZE + value.len()])
        } else {
            self.raw_send(&header)?;
            self.raw_send(value)
        }
    }

    /// Receives a frame header. The length is validated before any
    /// allocation happens.
    pub fn recv_tl(&mut self) -> Result<(u32, usize), CommsError> {
        let mut bytes = [0u8; TLV_HEADER_SIZE];
        self.raw_recv(&mut bytes)?;
        let (tag, len) = decode_header(bytes);
        if len > MAX_MESSAGE_SIZE {
            error!(
                "maximum TLV message size exceeded ({} > {})",
                len, MAX_MESSAGE_SIZE
            );
            return Err(CommsError::LengthOutOfBounds { length: len });
        }
        warn_if_oversized(len);
        Ok((tag, len))
    }

    /// Receives a whole frame, allocating the value buffer.
    pub fn recv_tlv(&mut self) -> Result<(u32, Vec<u8>), CommsError> {
        let (tag, len) = self.recv_tl()?;
        let mut value = vec![0u8; len];
        if len > 0 {
            self.raw_recv(&mut value)?;
        }
        Ok((tag, value))
    }

    /// Receives a frame value into a caller-supplied buffer, optionally
    /// enforcing an expected tag. On mismatch the value is consumed so the
    /// stream stays aligned.
    pub fn recv_tlv_into(
        &mut self,
        buffer: &mut [u8],
        expected_tag: Option<u32>,
    ) -> Result<(u32, usize), CommsError> {
        let (tag, len) = self.recv_tl()?;
        if let Some(expected) = expected_tag {
            if tag != expected {
                self.drain(len)?;
                return Err(CommsError::TagMismatch {
                    expected,
                    received: tag,
                });
            }
        }
        if len == 0 {
            return Ok((tag, 0));
        }
        if len > buffer.len() {
            self.drain(len)?;
            return Err(CommsError::BufferTooSmall {
                needed: len,
                capacity: buffer.len(),
            });
        }
        self.raw_recv(&mut buffer[..len])?;
        Ok((tag, len))
    }

    fn recv_scalar(&mut self, tag: u32, out: &mut [u8]) -> Result<(), CommsError> {
        let (received_tag, len) = self.recv_tl()?;
        if received_tag != tag {
            self.drain(len)?;
            return Err(CommsError::TagMismatch {
                expected: tag,
                received: received_tag,
            });
        }
        if len != out.len() {
            self.drain(len)?;
            return Err(CommsError::LengthMismatch {
                expected: out.len(),
                received: len,
            });
        }
        self.raw_recv(out)
    }

    pub fn send_bool(&mut self, value: bool) -> Result<(), CommsError> {
        self.send_tlv(TAG_BOOL, &[value as u8])
    }

    pub fn recv_bool(&mut self) -> Result<bool, CommsError> {
        let mut byte = [0u8; 1];
        self.recv_scalar(TAG_BOOL, &mut byte)?;
        Ok(byte[0] != 0)
    }

    scalar_frame_impls! {
        (send_i8, recv_i8, i8, TAG_INT8),
        (send_u8, recv_u8, u8, TAG_UINT8),
        (send_i16, recv_i16, i16, TAG_INT16),
        (send_u16, recv_u16, u16, TAG_UINT16),
        (send_i32, recv_i32, i32, TAG_INT32),
        (send_u32, recv_u32, u32, TAG_UINT32),
        (send_i64, recv_i64, i64, TAG_INT64),
        (send_u64, recv_u64, u64, TAG_UINT64)
    }

    pub fn send_string(&mut self, value: &str) -> Result<(), CommsError> {
        self.send_tlv(TAG_STRING, value.as_bytes())
    }

    pub fn recv_string(&mut self) -> Result<String, CommsError> {
        let (tag, bytes) = self.recv_tlv()?;
        if tag != TAG_STRING {
            return Err(CommsError::TagMismatch {
                expected: TAG_STRING,
                received: tag,
            });
        }
        String::from_utf8(bytes).map_err(|_| CommsError::InvalidStringPayload)
    }

    pub fn send_bytes(&mut self, value: &[u8]) -> Result<(), CommsError> {
        self.send_tlv(TAG_BYTES, value)
    }

    pub fn recv_bytes(&mut self) -> Result<Vec<u8>, CommsError> {
        let (tag, bytes) = self.recv_tlv()?;
        if tag != TAG_BYTES {
            return Err(CommsError::TagMismatch {
                expected: TAG_BYTES,
                received: tag,
            });
        }
        Ok(bytes)
    }

    /// Sends a bincode-serialized message under the proto tag.
    pub fn send_proto<T: Serialize>(&mut self, msg: &T) -> Result<(), CommsError> {
        let bytes = bincode_options()
            .serialize(msg)
            .map_err(|e| CommsError::Serialization {
                description: e.to_string(),
            })?;
        self.send_tlv(TAG_PROTO, &bytes)
    }

    pub fn recv_proto<T: DeserializeOwned>(&mut self) -> Result<T, CommsError> {
        let (tag, bytes) = self.recv_tlv()?;
        if tag != TAG_PROTO {
            return Err(CommsError::TagMismatch {
                expected: TAG_PROTO,
                received: tag,
            });
        }
        bincode_options()
            .deserialize(&bytes)
            .map_err(|e| CommsError::Serialization {
                description: e.to_string(),
            })
    }

    pub fn send_status(&mut self, status: &crate::RemoteStatus) -> Result<(), CommsError> {
        self.send_proto(status)
    }

    pub fn recv_status(&mut self) -> Result<crate::RemoteStatus, CommsError> {
        self.recv_proto()
    }

    /// Passes one open descriptor to the peer in SCM_RIGHTS ancillary
    /// data. The in-band payload is the frame header alone.
    pub fn send_fd(&mut self, handle: &Handle) -> Result<(), CommsError> {
        let fd = self.raw_fd()?;
        let header = encode_header(TAG_FD, 0);
        let msg_iovec = libc::iovec {
            // mut is not used here, just required because iovec is shared
            // with the receive path
            iov_base: header.as_ptr() as *mut c_void,
            iov_len: header.len(),
        };
        let mut cbuf = [0u8; CMSG_SPACE_FD];
        let msg = libc::msghdr {
            msg_name: null_mut(), // socket is already connected
            msg_namelen: 0,
            msg_iov: &msg_iovec as *const libc::iovec as *mut libc::iovec,
            msg_iovlen: 1,
            msg_control: cbuf.as_mut_ptr() as *mut c_void,
            msg_controllen: CMSG_SPACE_FD,
            msg_flags: 0, // unused
        };
        // Safety: the iovec must point to a live buffer until sendmsg()
        // returns, and pointers into the control buffer may be unaligned,
        // so every cmsg field is written with copy_nonoverlapping.
        let res = unsafe {
            let cmsghdr = libc::CMSG_FIRSTHDR(&msg as *const libc::msghdr);
            let (clevel, ctype) = (libc::SOL_SOCKET, libc::SCM_RIGHTS);
            let clen = libc::CMSG_LEN(mem::size_of::<c_int>() as u32) as usize;
            core::ptr::copy_nonoverlapping(&clevel, &mut (*cmsghdr).cmsg_level, 1);
            core::ptr::copy_nonoverlapping(&ctype, &mut (*cmsghdr).cmsg_type, 1);
            core::ptr::copy_nonoverlapping(&clen, &mut (*cmsghdr).cmsg_len, 1);
            let payload_fd = handle.as_raw();
            core::ptr::copy_nonoverlapping(
                &payload_fd,
                libc::CMSG_DATA(cmsghdr) as *mut c_int,
                1,
            );
            self.raw_sendmsg(fd, &msg)
        };
        match res {
            Ok(sent) if sent == header.len() => Ok(()),
            Ok(sent) => Err(CommsError::ShortTransfer {
                transferred: sent,
                requested: header.len(),
            }),
            Err(e) => Err(e),
        }
    }

    /// Receives one descriptor from the peer. The returned Handle is newly
    /// owned by the caller.
    pub fn recv_fd(&mut self) -> Result<Handle, CommsError> {
        let (len, handle) = self.recv_ancillary_frame(TAG_FD, true)?;
        // An FD frame may carry an in-band payload; discard it, the
        // descriptor is the message.
        self.drain(len)?;
        handle.ok_or(CommsError::MissingAncillaryData)
    }

    /// Toggles SO_PASSCRED, which makes the kernel attach peer
    /// credentials to received messages.
    pub fn set_pass_credentials(&mut self, enabled: bool) -> Result<(), CommsError> {
        let fd = self.raw_fd()?;
        let value: c_int = enabled as c_int;
        let res = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_PASSCRED,
                &value as *const c_int as *const c_void,
                mem::size_of::<c_int>() as libc::socklen_t,
            )
        };
        if res != 0 {
            return Err(CommsError::OsOperationFailed {
                description: "setsockopt(SO_PASSCRED)",
                os_code: errno(),
            });
        }
        Ok(())
    }

    fn pass_credentials_enabled(&self) -> Result<bool, CommsError> {
        let fd = self.raw_fd()?;
        let mut value: c_int = 0;
        let mut len = mem::size_of::<c_int>() as libc::socklen_t;
        let res = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_PASSCRED,
                &mut value as *mut c_int as *mut c_void,
                &mut len,
            )
        };
        if res != 0 {
            return Err(CommsError::OsOperationFailed {
                description: "getsockopt(SO_PASSCRED)",
                os_code: errno(),
            });
        }
        Ok(value != 0)
    }

    /// Sends a credentials frame. The in-band payload is the header alone;
    /// the receiving kernel attaches the sender's pid/uid/gid.
    pub fn send_creds(&mut self) -> Result<(), CommsError> {
        self.send_tlv(TAG_CREDS, &[])
    }

    /// Receives the peer's credentials from a credentials frame. The
    /// socket must have SO_PASSCRED enabled beforehand; calling this
    /// without it is a transport error, never a silent zero result.
    pub fn recv_creds(&mut self) -> Result<(libc::pid_t, libc::uid_t, libc::gid_t), CommsError> {
        if !self.pass_credentials_enabled()? {
            return Err(CommsError::CredentialPassingDisabled);
        }
        let fd = self.raw_fd()?;
        let mut header_bytes = [0u8; TLV_HEADER_SIZE];
        let msg_iovec = libc::iovec {
            iov_base: header_bytes.as_mut_ptr() as *mut c_void,
            iov_len: header_bytes.len(),
        };
        let mut cbuf = [0u8; CMSG_SPACE_CREDS];
        let mut msg = libc::msghdr {
            msg_name: null_mut(),
            msg_namelen: 0,
            msg_iov: &msg_iovec as *const libc::iovec as *mut libc::iovec,
            msg_iovlen: 1,
            msg_control: cbuf.as_mut_ptr() as *mut c_void,
            msg_controllen: cbuf.len(),
            msg_flags: 0,
        };
        let received = unsafe { self.raw_recvmsg(fd, &mut msg) }?;
        if received == 0 {
            self.terminate();
            return Err(CommsError::PeerDisconnected);
        }
        if received != TLV_HEADER_SIZE {
            return Err(CommsError::ShortTransfer {
                transferred: received,
                requested: TLV_HEADER_SIZE,
            });
        }
        let (tag, len) = decode_header(header_bytes);
        if tag != TAG_CREDS {
            self.drain(len)?;
            return Err(CommsError::TagMismatch {
                expected: TAG_CREDS,
                received: tag,
            });
        }
        self.drain(len)?;
        // Walk the control buffer without dereferencing potentially
        // unaligned pointers directly.
        let mut creds: Option<libc::ucred> = None;
        unsafe {
            let mut cmsghdr = libc::CMSG_FIRSTHDR(&msg as *const libc::msghdr);
            while !cmsghdr.is_null() {
                let mut clevel: c_int = -1;
                let mut ctype: c_int = -1;
                core::ptr::copy_nonoverlapping(&(*cmsghdr).cmsg_level, &mut clevel, 1);
                core::ptr::copy_nonoverlapping(&(*cmsghdr).cmsg_type, &mut ctype, 1);
                if (clevel, ctype) == (libc::SOL_SOCKET, libc::SCM_CREDENTIALS) {
                    let mut uc: libc::ucred = mem::zeroed();
                    core::ptr::copy_nonoverlapping(
                        libc::CMSG_DATA(cmsghdr),
                        &mut uc as *mut libc::ucred as *mut u8,
                        mem::size_of::<libc::ucred>(),
                    );
                    creds = Some(uc);
                }
                cmsghdr = libc::CMSG_NXTHDR(&msg as *const libc::msghdr, cmsghdr);
            }
        }
        match creds {
            Some(uc) => {
                debug!(
                    "received credentials pid={} uid={} gid={}",
                    uc.pid, uc.uid, uc.gid
                );
                Ok((uc.pid, uc.uid, uc.gid))
            }
            None => Err(CommsError::MissingAncillaryData),
        }
    }

    // Receives a header-only frame with one optional SCM_RIGHTS payload.
    // Returns the in-band value length still pending on the stream and the
    // received descriptor, already owned. Any descriptor received on an
    // error path is owned by a Handle before the error is returned, so it
    // cannot leak.
    fn recv_ancillary_frame(
        &mut self,
        expected_tag: u32,
        want_fd: bool,
    ) -> Result<(usize, Option<Handle>), CommsError> {
        let fd = self.raw_fd()?;
        let mut header_bytes = [0u8; TLV_HEADER_SIZE];
        let msg_iovec = libc::iovec {
            iov_base: header_bytes.as_mut_ptr() as *mut c_void,
            iov_len: header_bytes.len(),
        };
        // Leave room for an SCM_CREDENTIALS block too: sockets with
        // SO_PASSCRED enabled attach one to every message.
        let mut cbuf = [0u8; CMSG_SPACE_FD + CMSG_SPACE_CREDS];
        let mut msg = libc::msghdr {
            msg_name: null_mut(),
            msg_namelen: 0,
            msg_iov: &msg_iovec as *const libc::iovec as *mut libc::iovec,
            msg_iovlen: 1,
            msg_control: cbuf.as_mut_ptr() as *mut c_void,
            msg_controllen: cbuf.len(),
            msg_flags: 0,
        };
        let received = unsafe { self.raw_recvmsg(fd, &mut msg) }?;
        if received == 0 {
            self.terminate();
            return Err(CommsError::PeerDisconnected);
        }
        if received != TLV_HEADER_SIZE {
            return Err(CommsError::ShortTransfer {
                transferred: received,
                requested: TLV_HEADER_SIZE,
            });
        }
        // Collect the descriptor first so it is owned even if the header
        // turns out to be wrong. Credential blocks are skipped, anything
        // else is an error.
        let mut handle = None;
        let mut unexpected: Option<(c_int, c_int)> = None;
        unsafe {
            let mut cmsghdr = libc::CMSG_FIRSTHDR(&msg as *const libc::msghdr);
            while !cmsghdr.is_null() {
                let mut clevel: c_int = -1;
                let mut ctype: c_int = -1;
                core::ptr::copy_nonoverlapping(&(*cmsghdr).cmsg_level, &mut clevel, 1);
                core::ptr::copy_nonoverlapping(&(*cmsghdr).cmsg_type, &mut ctype, 1);
                if (clevel, ctype) == (libc::SOL_SOCKET, libc::SCM_RIGHTS) && want_fd {
                    let mut raw: c_int = -1;
                    core::ptr::copy_nonoverlapping(
                        libc::CMSG_DATA(cmsghdr) as *const c_int,
                        &mut raw,
                        1,
                    );
                    if handle.is_none() {
                        handle = Handle::from_raw(raw as u64).ok();
                    }
                } else if (clevel, ctype) != (libc::SOL_SOCKET, libc::SCM_CREDENTIALS) {
                    unexpected = Some((clevel, ctype));
                }
                cmsghdr = libc::CMSG_NXTHDR(&msg as *const libc::msghdr, cmsghdr);
            }
        }
        if let Some((level, kind)) = unexpected {
            return Err(CommsError::UnexpectedAncillaryData { level, kind });
        }
        let (tag, len) = decode_header(header_bytes);
        if tag != expected_tag {
            self.drain(len)?;
            return Err(CommsError::TagMismatch {
                expected: expected_tag,
                received: tag,
            });
        }
        Ok((len, handle))
    }

    // sendmsg/recvmsg go through the raw syscall numbers so the channel
    // does not depend on libc routing them through socketcall().
    unsafe fn raw_sendmsg(&mut self, fd: c_int, msg: &libc::msghdr) -> Result<usize, CommsError> {
        loop {
            let res = libc::syscall(
                libc::SYS_sendmsg,
                fd,
                msg as *const libc::msghdr,
                libc::MSG_NOSIGNAL,
            );
            if res >= 0 {
                return Ok(res as usize);
            }
            let err = errno();
            if err as i32 == libc::EINTR {
                continue;
            }
            if err as i32 == libc::EPIPE {
                self.terminate();
                return Err(CommsError::PeerDisconnected);
            }
            if is_fatal_errno(err) {
                self.terminate();
            }
            return Err(CommsError::OsOperationFailed {
                description: "sendmsg()",
                os_code: err,
            });
        }
    }

    unsafe fn raw_recvmsg(
        &mut self,
        fd: c_int,
        msg: &mut libc::msghdr,
    ) -> Result<usize, CommsError> {
        loop {
            let res = libc::syscall(
                libc::SYS_recvmsg,
                fd,
                msg as *mut libc::msghdr,
                libc::MSG_NOSIGNAL | libc::MSG_CMSG_CLOEXEC | libc::MSG_WAITALL,
            );
            if res >= 0 {
                return Ok(res as usize);
            }
            let err = errno();
            if err as i32 == libc::EINTR {
                continue;
            }
            if is_fatal_errno(err) {
                self.terminate();
            }
            return Err(CommsError::OsOperationFailed {
                description: "recvmsg()",
                os_code: err,
            });
        }
    }
}

impl std::fmt::Debug for Comms {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Comms")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("fd", &self.connection_fd())
            .finish()
    }
}

/// Server side of a comms rendezvous: bind + listen on a UNIX socket and
/// accept connected endpoints.
pub struct ListeningComms {
    socket_name: String,
    bind_fd: Handle,
}

impl ListeningComms {
    pub fn create(socket_name: &str, abstract_uds: bool) -> Result<Self, CommsError> {
        let raw = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
        if raw < 0 {
            return Err(CommsError::OsOperationFailed {
                description: "socket(AF_UNIX)",
                os_code: errno(),
            });
        }
        let bind_fd = unsafe { Handle::from_raw(raw as u64) }.unwrap();
        let (sun, slen) = create_sockaddr_un(socket_name, abstract_uds);
        let res = unsafe {
            libc::bind(
                bind_fd.as_raw(),
                &sun as *const _ as *const libc::sockaddr,
                slen,
            )
        };
        if res != 0 {
            return Err(CommsError::OsOperationFailed {
                description: "bind()",
                os_code: errno(),
            });
        }
        if unsafe { libc::listen(bind_fd.as_raw(), 0) } != 0 {
            return Err(CommsError::OsOperationFailed {
                description: "listen()",
                os_code: errno(),
            });
        }
        debug!("listening at {:?}", socket_name);
        Ok(Self {
            socket_name: socket_name.to_owned(),
            bind_fd,
        })
    }

    pub fn accept(&mut self) -> Result<Comms, CommsError> {
        loop {
            let res = unsafe { libc::accept(self.bind_fd.as_raw(), null_mut(), null_mut()) };
            if res >= 0 {
                debug!("accepted connection at {:?}, fd {}", self.socket_name, res);
                let fd = unsafe { Handle::from_raw(res as u64) }.unwrap();
                return Ok(Comms {
                    name: self.socket_name.clone(),
                    state: State::Connected,
                    fd: Some(fd),
                });
            }
            let err = errno();
            if err as i32 == libc::EINTR {
                continue;
            }
            return Err(CommsError::OsOperationFailed {
                description: "accept()",
                os_code: err,
            });
        }
    }
}
