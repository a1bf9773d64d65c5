//! Output that doesn't use the allocator.
//!
//! Anything printed from inside `malloc()` must not allocate, otherwise we are
//! straight back in `malloc()`. So we format into a buffer on the stack and
//! hand the bytes to `write(2)` ourselves, bypassing `std::io::stderr()`.

use std::fmt;

/// Capacity of the buffer used by [`eputln!`](crate::eputln)
pub const LINE_CAPACITY: usize = 512;

/// A fixed-capacity formatting buffer. Anything past the capacity is silently
/// dropped, so `write!()` into it can never fail or allocate.
pub struct StackBuf<const N: usize> {
    buf: [u8; N],
    len: usize,
}

impl<const N: usize> StackBuf<N> {
    pub const fn new() -> Self {
        Self {
            buf: [0; N],
            len: 0,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Make sure the contents end in `'\n'`, sacrificing the last byte if the
    /// buffer is already full.
    pub fn finish_line(&mut self) {
        if N == 0 {
            return;
        }
        if self.len == N {
            self.buf[N - 1] = b'\n';
        } else {
            self.buf[self.len] = b'\n';
            self.len += 1;
        }
    }
}

impl<const N: usize> Default for StackBuf<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> fmt::Write for StackBuf<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let n = s.len().min(N - self.len);
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}

/// `write(2)` all of `bytes` to stderr. Errors are ignored, there is nowhere
/// left to report them.
pub fn put_stderr(mut bytes: &[u8]) {
    while !bytes.is_empty() {
        // SAFETY: `bytes` is valid for reads of `bytes.len()` bytes
        let n = unsafe { libc::write(libc::STDERR_FILENO, bytes.as_ptr().cast(), bytes.len()) };
        if n < 0 {
            if crate::os::mem::errno() == libc::EINTR {
                continue;
            }
            return;
        }
        bytes = &bytes[n as usize..];
    }
}

/// Basically `eprintln!()`, but safe to call from inside the allocator. Long
/// lines are truncated.
#[macro_export]
macro_rules! eputln {
    ($($arg:tt)*) => {{
        let mut buf = $crate::util::print::StackBuf::<{ $crate::util::print::LINE_CAPACITY }>::new();
        let _ = ::std::fmt::Write::write_fmt(&mut buf, format_args!($($arg)*));
        buf.finish_line();
        $crate::util::print::put_stderr(buf.as_bytes());
    }};
}
