//! Async-signal-safe diagnostics and process abort.
//!
//! Everything here may run inside a signal handler on a 16 KiB alternate
//! stack, so output goes straight to fd 2 through `write(2)` and formatting
//! never allocates.

use core::fmt::{self, Write};

/// Write `bytes` to stderr with a raw syscall, retrying short writes.
pub fn raw_write(mut bytes: &[u8]) {
    while !bytes.is_empty() {
        // SAFETY: the pointer and length describe a live slice.
        let n = unsafe { libc::write(libc::STDERR_FILENO, bytes.as_ptr().cast(), bytes.len()) };
        if n < 0 {
            if std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return;
        }
        if n == 0 {
            return;
        }
        bytes = &bytes[n as usize..];
    }
}

struct RawStderr;

impl Write for RawStderr {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        raw_write(s.as_bytes());
        Ok(())
    }
}

/// Format `args` to stderr without allocating.
pub fn raw_print(args: fmt::Arguments<'_>) {
    let _ = RawStderr.write_fmt(args);
}

/// Print `aznix: fatal: <args>` and abort the process.
#[cold]
pub fn abort_with(args: fmt::Arguments<'_>) -> ! {
    raw_write(b"aznix: fatal: ");
    raw_print(args);
    raw_write(b"\n");
    // SAFETY: abort has no preconditions.
    unsafe { libc::abort() }
}

/// Abort the process with a formatted diagnostic. Usable in signal context.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::fatal::abort_with(format_args!($($arg)*))
    };
}

/// Abort with a diagnostic unless `cond` holds.
#[macro_export]
macro_rules! guarantee {
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            $crate::fatal!($($arg)*)
        }
    };
}
