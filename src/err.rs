//! Error definitions.
//!
//! Recoverable failures are represented by [`Errno`], returned through
//! `Result` and propagated with `?` up to the syscall boundary, where they
//! are encoded as the classical negative integer.
//!
//! Media corruption and contract violations are not recoverable: they are
//! reported through the logger and abort via [`fatal!`].

use core::fmt;

/// `CanFail` is a return type for operations that are allowed to fail and
/// don't need to return anything.
pub type CanFail<E> = Result<(), E>;

/// POSIX error codes surfaced by the filesystem.
///
/// The discriminants are the classical `errno` values; syscall stubs return
/// them negated (see [`Errno::to_neg`]).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum Errno {
    /// No such file or directory.
    ENOENT = 2,
    /// Bad file descriptor.
    EBADF = 9,
    /// File exists.
    EEXIST = 17,
    /// Not a directory.
    ENOTDIR = 20,
    /// Is a directory.
    EISDIR = 21,
    /// Invalid argument.
    EINVAL = 22,
    /// File too large.
    EFBIG = 27,
    /// No space left on device.
    ENOSPC = 28,
    /// Illegal seek.
    ESPIPE = 29,
    /// File name too long.
    ENAMETOOLONG = 36,
    /// Value too large for defined data type.
    EOVERFLOW = 75,
}

impl Errno {
    /// Encodes the error the way the syscall ABI reports it: negated.
    pub fn to_neg(self) -> isize {
        -(self as i32 as isize)
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Reports an unrecoverable condition (media corruption, contract violation)
/// through the logging sink, then aborts.
///
/// The first argument is the log target, the rest is a standard format
/// string.
#[macro_export]
macro_rules! fatal {
    (target: $target:expr, $($arg:tt)+) => {{
        log::error!(target: $target, $($arg)+);
        panic!($($arg)+);
    }};
}
