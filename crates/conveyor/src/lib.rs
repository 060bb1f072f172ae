#![forbid(unsafe_code)]
//! Umbrella crate for the conveyor I/O acceleration engine.
//!
//! Re-exports the typed surface from the member crates and adds a
//! POSIX-flavoured veneer in [`posix`] for embedders that want classic
//! `-1`/errno semantics.

pub use cvy_engine::{BackingStore, Conveyor, ConveyorConfig, FileStore, MemStore, StoreResult};
pub use cvy_error::{CvyError, Errno, Result};
pub use cvy_types::{AccessMode, ByteOffset, ConveyorStats, Generation, OpenFlags, Whence};

pub mod posix {
    //! POSIX-style operations with a thread-local error slot.
    //!
    //! Every function mirrors its typed counterpart on [`Conveyor`] but
    //! reports failure through a sentinel return value, leaving the
    //! POSIX code in a per-thread slot readable via [`last_errno`].

    use super::{Conveyor, CvyError, Whence};
    use std::cell::Cell;

    thread_local! {
        static LAST_ERRNO: Cell<i32> = const { Cell::new(0) };
    }

    /// The error code left behind by the most recent failing call on
    /// this thread.
    #[must_use]
    pub fn last_errno() -> i32 {
        LAST_ERRNO.with(Cell::get)
    }

    fn set_errno(err: &CvyError) {
        LAST_ERRNO.with(|slot| slot.set(err.to_errno()));
    }

    /// `write(2)`-shaped: bytes accepted, or `-1` with errno set.
    pub fn write(conv: &Conveyor, buf: &[u8]) -> isize {
        match conv.write(buf) {
            Ok(n) => n as isize,
            Err(err) => {
                set_errno(&err);
                -1
            }
        }
    }

    /// `read(2)`-shaped: bytes delivered (0 = EOF), or `-1` with errno
    /// set.
    pub fn read(conv: &Conveyor, buf: &mut [u8]) -> isize {
        match conv.read(buf) {
            Ok(n) => n as isize,
            Err(err) => {
                set_errno(&err);
                -1
            }
        }
    }

    /// `lseek(2)`-shaped: new absolute offset, or `-1` with errno set.
    /// Unknown `whence` values fail with `EINVAL`.
    pub fn lseek(conv: &Conveyor, offset: i64, whence: i32) -> i64 {
        let Some(whence) = Whence::from_raw(whence) else {
            LAST_ERRNO.with(|slot| slot.set(libc::EINVAL));
            return -1;
        };
        match conv.seek(offset, whence) {
            Ok(pos) => match i64::try_from(pos.0) {
                Ok(raw) => raw,
                Err(_) => {
                    LAST_ERRNO.with(|slot| slot.set(libc::EOVERFLOW));
                    -1
                }
            },
            Err(err) => {
                set_errno(&err);
                -1
            }
        }
    }

    /// `fsync`-shaped drain of the write queue: `0`, or `-1` with errno
    /// set.
    pub fn flush(conv: &Conveyor) -> i32 {
        match conv.flush() {
            Ok(()) => 0,
            Err(err) => {
                set_errno(&err);
                -1
            }
        }
    }

    /// Snapshot-and-zero the statistics into `out`. Always succeeds on a
    /// live conveyor; the return code mirrors the C-style surface.
    pub fn get_stats(conv: &Conveyor, out: &mut super::ConveyorStats) -> i32 {
        *out = conv.take_stats();
        0
    }

    /// The sticky asynchronous error code (0 = none) without clearing it.
    #[must_use]
    pub fn get_last_error(conv: &Conveyor) -> i32 {
        conv.last_error().map_or(0, |errno| errno.0)
    }

    /// Clear the sticky error, letting the worker resume draining.
    pub fn clear_error(conv: &Conveyor) {
        conv.clear_error();
    }
}
