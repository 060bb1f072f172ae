#![forbid(unsafe_code)]
//! Shared vocabulary types for the conveyor I/O engine.
//!
//! Unit-carrying newtypes (`ByteOffset`, `Generation`), the POSIX-flavoured
//! open-flag and seek-whence vocabulary, and the statistics snapshot the
//! engine hands out.

use serde::{Deserialize, Serialize};
use std::ops::BitOr;
use std::time::Duration;

/// Byte offset into the backing store (pread/pwrite semantics).
///
/// This is a unit-carrying wrapper to prevent mixing store offsets with
/// ring-buffer indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(pub u64);

impl ByteOffset {
    pub const ZERO: Self = Self(0);

    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }

    /// Offset the position by a signed delta, returning `None` when the
    /// result would be negative or overflow.
    #[must_use]
    pub fn checked_offset(self, delta: i64) -> Option<Self> {
        self.0.checked_add_signed(delta).map(Self)
    }
}

impl std::fmt::Display for ByteOffset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic seek generation.
///
/// Bumped by every successful seek; worker results tagged with an older
/// generation are discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Generation(pub u64);

// ---------------------------------------------------------------------------
// Open flags and access mode
// ---------------------------------------------------------------------------

/// POSIX `open(2)`-style flags as handed to the engine factory.
///
/// Only the access mode bits and `O_APPEND` are interpreted; unknown bits
/// are carried but ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenFlags(i32);

impl OpenFlags {
    pub const RDONLY: Self = Self(libc::O_RDONLY);
    pub const WRONLY: Self = Self(libc::O_WRONLY);
    pub const RDWR: Self = Self(libc::O_RDWR);
    pub const APPEND: Self = Self(libc::O_APPEND);

    /// Wrap a raw flag word. Unknown bits are preserved verbatim.
    #[must_use]
    pub fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub fn raw(self) -> i32 {
        self.0
    }

    /// The access mode encoded in the `O_ACCMODE` bits.
    #[must_use]
    pub fn access_mode(self) -> AccessMode {
        match self.0 & libc::O_ACCMODE {
            libc::O_WRONLY => AccessMode::WriteOnly,
            libc::O_RDWR => AccessMode::ReadWrite,
            // O_RDONLY is zero on every platform we target; any other
            // residue in the accmode bits degrades to read-only.
            _ => AccessMode::ReadOnly,
        }
    }

    #[must_use]
    pub fn is_append(self) -> bool {
        self.0 & libc::O_APPEND != 0
    }
}

impl BitOr for OpenFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Direction(s) a stream may move data in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl AccessMode {
    #[must_use]
    pub fn readable(self) -> bool {
        matches!(self, Self::ReadOnly | Self::ReadWrite)
    }

    #[must_use]
    pub fn writable(self) -> bool {
        matches!(self, Self::WriteOnly | Self::ReadWrite)
    }
}

// ---------------------------------------------------------------------------
// Seek whence
// ---------------------------------------------------------------------------

/// Anchor for a seek, mirroring `SEEK_SET` / `SEEK_CUR` / `SEEK_END`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Whence {
    Set,
    Cur,
    End,
}

impl Whence {
    /// Decode a raw `lseek(2)` whence value.
    #[must_use]
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            libc::SEEK_SET => Some(Self::Set),
            libc::SEEK_CUR => Some(Self::Cur),
            libc::SEEK_END => Some(Self::End),
            _ => None,
        }
    }

    #[must_use]
    pub fn to_raw(self) -> i32 {
        match self {
            Self::Set => libc::SEEK_SET,
            Self::Cur => libc::SEEK_CUR,
            Self::End => libc::SEEK_END,
        }
    }
}

// ---------------------------------------------------------------------------
// Statistics snapshot
// ---------------------------------------------------------------------------

/// Cumulative counters since the previous snapshot.
///
/// Byte and operation counts describe traffic against the backing store,
/// not against the client; congestion events count producer waits on a
/// full write ring. Reading the statistics zeroes them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConveyorStats {
    /// Bytes delivered to the backing store by the write worker.
    pub bytes_written: u64,
    /// Bytes fetched from the backing store by the read worker.
    pub bytes_read: u64,
    /// Number of `pwrite` calls issued.
    pub backing_writes: u64,
    /// Number of `pread` calls issued.
    pub backing_reads: u64,
    /// Wall-clock time spent inside `pwrite`.
    pub write_latency: Duration,
    /// Wall-clock time spent inside `pread`.
    pub read_latency: Duration,
    /// Times a producer had to wait for write-ring space.
    pub congestion_events: u64,
}
