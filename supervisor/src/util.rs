use core::fmt::Write;
use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) fn last_os_error_code() -> i64 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0) as i64
}

pub(crate) fn now_unix_millis() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(_) => 0,
    }
}

/// Fixed-size formatting buffer for contexts where allocating is not an
/// option. Writes past the capacity are truncated, never panic.
pub struct StackBuffer<const SIZE: usize> {
    buf: [u8; SIZE],
    used_bytes: usize,
}

impl<const SIZE: usize> StackBuffer<SIZE> {
    pub fn new() -> Self {
        Self {
            buf: [0u8; SIZE],
            used_bytes: 0,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[0..self.used_bytes]
    }
}

impl<const SIZE: usize> Default for StackBuffer<SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const SIZE: usize> Write for StackBuffer<SIZE> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let capacity = self.buf.len() - 1; // always keep a trailing null byte
        for (dst, &src) in self.buf[self.used_bytes..capacity]
            .iter_mut()
            .zip(s.as_bytes().iter())
        {
            *dst = src;
        }
        self.used_bytes = usize::min(capacity, self.used_bytes + s.as_bytes().len());
        Ok(())
    }
}

/// Last-resort failure report. Formats into a stack buffer, writes it to
/// stderr with the raw write(2) syscall (bypassing libc interposition and
/// any buffering), and aborts. Async-signal-safe: no allocation, no locks.
pub fn raw_fatal(args: core::fmt::Arguments) -> ! {
    let mut buf = StackBuffer::<512>::new();
    let _ = buf.write_str("FATAL: ");
    let _ = buf.write_fmt(args);
    let _ = buf.write_str("\n");
    unsafe {
        libc::syscall(
            libc::SYS_write,
            libc::STDERR_FILENO,
            buf.as_bytes().as_ptr(),
            buf.as_bytes().len(),
        );
        libc::abort()
    }
}
