#![forbid(unsafe_code)]
//! Error types for the conveyor I/O engine.
//!
//! Defines `CvyError` and a `Result<T>` alias used throughout the
//! workspace, plus the `Errno` wrapper for raw POSIX codes that backing
//! stores report and the engine propagates verbatim.

use thiserror::Error;

/// Raw POSIX error code reported by a backing store.
///
/// Zero means "no error"; the engine's sticky-error slot stores one of
/// these. Codes are propagated verbatim, never reinterpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(pub i32);

impl Errno {
    #[must_use]
    pub fn is_set(self) -> bool {
        self.0 != 0
    }

    /// Best-effort conversion of an `io::Error`, falling back to `EIO`
    /// when the error carries no OS code.
    #[must_use]
    pub fn from_io(err: &std::io::Error) -> Self {
        Self(err.raw_os_error().unwrap_or(libc::EIO))
    }
}

impl std::fmt::Display for Errno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "errno {}", self.0)
    }
}

/// Unified error type for all conveyor operations.
#[derive(Debug, Error)]
pub enum CvyError {
    /// The operation is not permitted by the stream's access mode, or the
    /// direction it needs was created with a zero-capacity ring.
    #[error("bad descriptor: {0}")]
    BadDescriptor(&'static str),

    /// A single write larger than the write ring can ever hold.
    #[error("message too long: {len} bytes exceeds max write capacity {max}")]
    MessageTooLong { len: usize, max: usize },

    /// The producer waited out its timeout for write-ring space.
    #[error("timed out waiting for write buffer space")]
    TimedOut,

    /// A backing-store failure, either synchronous or surfaced from the
    /// sticky slot a worker filled in.
    #[error("backing store failure: {0}")]
    Store(Errno),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CvyError {
    /// Convert this error into a POSIX errno for the `-1`/errno surface.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::BadDescriptor(_) => libc::EBADF,
            Self::MessageTooLong { .. } => libc::EMSGSIZE,
            Self::TimedOut => libc::ETIMEDOUT,
            Self::Store(errno) => errno.0,
            Self::InvalidConfig(_) => libc::EINVAL,
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

/// Result alias using `CvyError`.
pub type Result<T> = std::result::Result<T, CvyError>;
