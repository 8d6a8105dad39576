use crate::PolicyError;
use libc::{c_int, fcntl, FD_CLOEXEC, F_GETFD, F_SETFD};
use std::convert::TryInto;
use std::io::Error;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

/// An owned kernel file descriptor, closed when the value is dropped.
/// Ownership is unique: moving a `Handle` moves the descriptor, and
/// transferring one across a process boundary (SCM_RIGHTS) makes the
/// receiver the sole owner of the received copy.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct Handle {
    val: Option<c_int>,
}

impl Handle {
    /// Takes ownership of a raw descriptor number.
    ///
    /// # Safety
    /// The caller must actually own `raw_value` and must not close it
    /// through any other path afterwards.
    pub unsafe fn from_raw(raw_value: u64) -> Result<Self, PolicyError> {
        let fd: c_int = match raw_value.try_into() {
            Ok(n) => n,
            Err(_) => return Err(PolicyError::InvalidHandleValue { raw_value }),
        };
        Ok(Handle { val: Some(fd) })
    }

    pub fn as_raw(&self) -> c_int {
        // A Handle without a value can only be observed during into_raw()
        self.val.unwrap()
    }

    /// Relinquishes ownership of the descriptor without closing it.
    pub fn into_raw(mut self) -> c_int {
        self.val.take().unwrap()
    }

    pub fn set_inheritable(&mut self, allow_inherit: bool) -> Result<(), PolicyError> {
        let fd = self.as_raw();
        let current_flags = unsafe { fcntl(fd, F_GETFD) };
        if current_flags < 0 {
            return Err(PolicyError::OsOperationFailed {
                description: "fcntl(F_GETFD)",
                os_code: Error::last_os_error().raw_os_error().unwrap_or(0) as i64,
            });
        }
        let res = unsafe {
            fcntl(
                fd,
                F_SETFD,
                (current_flags & !FD_CLOEXEC) | if allow_inherit { 0 } else { FD_CLOEXEC },
            )
        };
        if res < 0 {
            return Err(PolicyError::OsOperationFailed {
                description: "fcntl(F_SETFD, FD_CLOEXEC)",
                os_code: Error::last_os_error().raw_os_error().unwrap_or(0) as i64,
            });
        }
        Ok(())
    }

    pub fn is_inheritable(&self) -> Result<bool, PolicyError> {
        let current_flags = unsafe { fcntl(self.as_raw(), F_GETFD) };
        if current_flags < 0 {
            return Err(PolicyError::OsOperationFailed {
                description: "fcntl(F_GETFD)",
                os_code: Error::last_os_error().raw_os_error().unwrap_or(0) as i64,
            });
        }
        Ok((current_flags & FD_CLOEXEC) == 0)
    }

    /// Duplicates the underlying descriptor into a new independent Handle.
    pub fn try_clone(&self) -> Result<Self, PolicyError> {
        let res = unsafe { libc::fcntl(self.as_raw(), libc::F_DUPFD_CLOEXEC, 3) };
        if res < 0 {
            return Err(PolicyError::OsOperationFailed {
                description: "fcntl(F_DUPFD_CLOEXEC)",
                os_code: Error::last_os_error().raw_os_error().unwrap_or(0) as i64,
            });
        }
        Ok(Handle { val: Some(res) })
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if let Some(fd) = self.val {
            let res = unsafe { libc::close(fd) };
            if res < 0 {
                panic!(
                    "close(fd={}) failed with error {}",
                    fd,
                    Error::last_os_error().raw_os_error().unwrap_or(0)
                );
            }
        }
    }
}

impl FromRawFd for Handle {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Handle::from_raw(fd.try_into().unwrap()).unwrap()
    }
}

impl IntoRawFd for Handle {
    fn into_raw_fd(self) -> RawFd {
        self.into_raw()
    }
}

impl AsRawFd for Handle {
    fn as_raw_fd(&self) -> RawFd {
        self.as_raw()
    }
}

/// Takes ownership of the descriptor held by any std type (File, TcpStream,
/// socket, ...) and wraps it into a Handle.
pub fn downcast_to_handle<T: IntoRawFd>(resource: T) -> Handle {
    unsafe { Handle::from_raw_fd(resource.into_raw_fd()) }
}

/// Flips FD_CLOEXEC on a descriptor owned by someone else, without taking
/// ownership of it.
pub fn set_unmanaged_handle_inheritable<T: AsRawFd>(
    resource: &T,
    allow_inherit: bool,
) -> Result<(), PolicyError> {
    // The descriptor outlives this block and we deliberately leak our
    // temporary Handle around it instead of closing it.
    let fd = resource.as_raw_fd();
    unsafe {
        let mut handle = Handle::from_raw(fd.try_into().unwrap()).unwrap();
        let res = handle.set_inheritable(allow_inherit);
        let _ = handle.into_raw();
        res
    }
}
