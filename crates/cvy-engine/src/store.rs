//! Backing-store abstraction and the two bundled implementations.
//!
//! The engine binds to storage through three offset-addressed operations,
//! all assumed thread-safe with respect to distinct offsets. Errors cross
//! this boundary as raw POSIX codes so the engine can propagate them
//! verbatim through its sticky-error slot.
//!
//! - [`FileStore`]: `pread`/`pwrite` over a `std::fs::File` (the
//!   production binding).
//! - [`MemStore`]: an in-memory store with latency and one-shot error
//!   injection, used by the test suites and benches.

use cvy_error::Errno;
use cvy_types::{ByteOffset, Whence};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::time::Duration;

/// Result type crossing the storage boundary: raw errno, no translation.
pub type StoreResult<T> = std::result::Result<T, Errno>;

/// Offset-addressed storage the engine accelerates.
///
/// `pread_at` returning `Ok(0)` means end-of-store at that offset. Short
/// counts are legal in both directions; the engine retries write
/// remainders itself.
pub trait BackingStore: Send + Sync {
    /// Write `buf` at `offset`, returning the number of bytes accepted.
    fn pwrite_at(&self, buf: &[u8], offset: ByteOffset) -> StoreResult<usize>;

    /// Read into `buf` from `offset`, returning the number of bytes
    /// produced; zero signals EOF.
    fn pread_at(&self, buf: &mut [u8], offset: ByteOffset) -> StoreResult<usize>;

    /// Resolve a seek target to an absolute offset.
    fn seek(&self, offset: i64, whence: Whence) -> StoreResult<ByteOffset>;
}

// ── file-backed store ──────────────────────────────────────────────────────

/// Standard `pread`/`pwrite` binding over a regular file.
///
/// `std::os::unix::fs::FileExt` positional I/O is thread-safe and does not
/// disturb the kernel file pointer, which keeps the engine's logical
/// offset the only cursor in play.
pub struct FileStore {
    file: Arc<std::fs::File>,
}

impl FileStore {
    /// Open `path` read-write, falling back to read-only.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .or_else(|_| std::fs::OpenOptions::new().read(true).open(path))?;
        Ok(Self {
            file: Arc::new(file),
        })
    }

    /// Wrap an already-open file.
    #[must_use]
    pub fn from_file(file: Arc<std::fs::File>) -> Self {
        Self { file }
    }

    fn len(&self) -> StoreResult<u64> {
        self.file
            .metadata()
            .map(|m| m.len())
            .map_err(|e| Errno::from_io(&e))
    }
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore").finish_non_exhaustive()
    }
}

impl BackingStore for FileStore {
    fn pwrite_at(&self, buf: &[u8], offset: ByteOffset) -> StoreResult<usize> {
        use std::os::unix::fs::FileExt;
        self.file
            .write_at(buf, offset.0)
            .map_err(|e| Errno::from_io(&e))
    }

    fn pread_at(&self, buf: &mut [u8], offset: ByteOffset) -> StoreResult<usize> {
        use std::os::unix::fs::FileExt;
        self.file
            .read_at(buf, offset.0)
            .map_err(|e| Errno::from_io(&e))
    }

    fn seek(&self, offset: i64, whence: Whence) -> StoreResult<ByteOffset> {
        let base = match whence {
            Whence::Set => 0,
            Whence::End => self.len()?,
            // The engine resolves SEEK_CUR against its own logical offset
            // before delegating; a raw SEEK_CUR here has no cursor to
            // anchor to.
            Whence::Cur => return Err(Errno(libc::EINVAL)),
        };
        let target = if base == 0 {
            u64::try_from(offset).map_err(|_| Errno(libc::EINVAL))?
        } else {
            base.checked_add_signed(offset).ok_or(Errno(libc::EINVAL))?
        };
        Ok(ByteOffset(target))
    }
}

// ── in-memory store ────────────────────────────────────────────────────────

/// In-memory backing store with fault injection.
///
/// Writes past the current end extend the store; reads past the end
/// report EOF. `set_write_delay` / `set_read_delay` simulate a slow disk
/// to widen race windows, and `fail_next_write` makes exactly one
/// subsequent `pwrite_at` report the given errno.
pub struct MemStore {
    data: Mutex<Vec<u8>>,
    next_write_error: AtomicI32,
    write_delay_ms: AtomicU64,
    read_delay_ms: AtomicU64,
}

impl MemStore {
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            data: Mutex::new(vec![0_u8; size]),
            next_write_error: AtomicI32::new(0),
            write_delay_ms: AtomicU64::new(0),
            read_delay_ms: AtomicU64::new(0),
        }
    }

    /// Seed the store with initial contents.
    #[must_use]
    pub fn with_contents(bytes: &[u8]) -> Self {
        let store = Self::new(0);
        *store.data.lock() = bytes.to_vec();
        store
    }

    pub fn set_write_delay(&self, delay: Duration) {
        self.write_delay_ms
            .store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn set_read_delay(&self, delay: Duration) {
        self.read_delay_ms
            .store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    /// Arm a one-shot write failure with the given errno.
    pub fn fail_next_write(&self, errno: i32) {
        self.next_write_error.store(errno, Ordering::Relaxed);
    }

    /// Snapshot of the full store contents.
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }

    fn nap(cell: &AtomicU64) {
        let ms = cell.load(Ordering::Relaxed);
        if ms > 0 {
            std::thread::sleep(Duration::from_millis(ms));
        }
    }
}

impl std::fmt::Debug for MemStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemStore")
            .field("len", &self.data.lock().len())
            .finish_non_exhaustive()
    }
}

impl BackingStore for MemStore {
    fn pwrite_at(&self, buf: &[u8], offset: ByteOffset) -> StoreResult<usize> {
        Self::nap(&self.write_delay_ms);

        let armed = self.next_write_error.swap(0, Ordering::Relaxed);
        if armed != 0 {
            return Err(Errno(armed));
        }

        let start = usize::try_from(offset.0).map_err(|_| Errno(libc::EINVAL))?;
        let end = start.checked_add(buf.len()).ok_or(Errno(libc::EINVAL))?;
        let mut data = self.data.lock();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn pread_at(&self, buf: &mut [u8], offset: ByteOffset) -> StoreResult<usize> {
        Self::nap(&self.read_delay_ms);

        let start = usize::try_from(offset.0).map_err(|_| Errno(libc::EINVAL))?;
        let data = self.data.lock();
        if start >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn seek(&self, offset: i64, whence: Whence) -> StoreResult<ByteOffset> {
        let base = match whence {
            Whence::Set => 0,
            Whence::End => self.data.lock().len() as u64,
            Whence::Cur => return Err(Errno(libc::EINVAL)),
        };
        base.checked_add_signed(offset)
            .map(ByteOffset)
            .ok_or(Errno(libc::EINVAL))
    }
}

// ── tests ──────────────────────────────────────────────────────────────────
