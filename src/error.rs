//! Error types for the image builder and the output encoders.
//!
//! Every builder and encoder operation returns [`Result`]; nothing in the layout
//! engine panics on bad input or swallows a failure.

use std::fmt;
use std::io;

// POSIX error numbers reported by the command line front end.
const EIO: i32 = 5;
const ENOMEM: i32 = 12;
const EFAULT: i32 = 14;
const EINVAL: i32 = 22;
const ENOSPC: i32 = 28;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// A table or staging buffer could not grow.
    AllocationFailed,
    /// A segment's virtual range collides with (or precedes) an existing segment.
    AddressOverlap { start: u64, end: u64 },
    /// A section does not fit in the remaining virtual size of its segment.
    OutOfSpace { required: u64, available: u64 },
    /// Bad alignment, bad size, wrong call order or an unsupported format.
    InvalidArgument(String),
    /// A segment did not land at the address the VM expects it at.
    AddressMismatch { expected: u64, actual: u64 },
    /// Writing the output failed.
    Io(io::Error),
}

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// The POSIX error number matching this error.
    pub fn errno(&self) -> i32 {
        match self {
            Error::AllocationFailed => ENOMEM,
            Error::AddressOverlap { .. } => EFAULT,
            Error::OutOfSpace { .. } => ENOSPC,
            Error::InvalidArgument(_) => EINVAL,
            Error::AddressMismatch { .. } => EFAULT,
            Error::Io(err) => err.raw_os_error().unwrap_or(EIO),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::AllocationFailed => write!(f, "out of memory"),
            Error::AddressOverlap { start, end } => {
                write!(f, "address fault: range 0x{:x}..0x{:x} overlaps an existing segment", start, end)
            }
            Error::OutOfSpace { required, available } => write!(
                f,
                "out of space: section needs 0x{:x} bytes but the segment has 0x{:x}",
                required, available
            ),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            Error::AddressMismatch { expected, actual } => write!(
                f,
                "address fault: expected segment at 0x{:x}, placed at 0x{:x}",
                expected, actual
            ),
            Error::Io(err) => write!(f, "I/O error: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<std::collections::TryReserveError> for Error {
    fn from(_: std::collections::TryReserveError) -> Self {
        Error::AllocationFailed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_matches_error_kind() {
        assert_eq!(Error::AllocationFailed.errno(), ENOMEM);
        assert_eq!(Error::AddressOverlap { start: 0, end: 1 }.errno(), EFAULT);
        assert_eq!(Error::OutOfSpace { required: 2, available: 1 }.errno(), ENOSPC);
        assert_eq!(Error::invalid("x").errno(), EINVAL);
        assert_eq!(Error::AddressMismatch { expected: 0, actual: 1 }.errno(), EFAULT);
        assert_eq!(Error::Io(io::Error::from_raw_os_error(28)).errno(), 28);
        assert_eq!(Error::Io(io::Error::new(io::ErrorKind::Other, "x")).errno(), EIO);
    }
}
