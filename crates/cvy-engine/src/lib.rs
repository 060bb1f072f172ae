#![forbid(unsafe_code)]
//! Buffered I/O acceleration engine.
//!
//! A [`Conveyor`] sits between a client using POSIX-like stream operations
//! and an offset-addressed [`BackingStore`], hiding store latency two ways:
//!
//! - **Write-behind**: `write` stages bytes in a ring buffer and enqueues a
//!   request record; a background worker drains the queue with
//!   offset-addressed writes in strict FIFO order.
//! - **Read-ahead**: `read` is served from a ring cache that a second
//!   worker fills with offset-addressed reads, tagged with a seek
//!   generation so results from before a seek are discarded.
//!
//! Reads additionally *snoop* the write queue: any pending, not-yet-flushed
//! write that overlaps the requested range is overlaid onto the result, so
//! a reader always observes its own writes regardless of flush latency.
//!
//! Backing-store failures surface asynchronously: the failing worker parks
//! the error in a sticky slot and every subsequent operation fails with
//! that code until [`Conveyor::clear_error`] is called.

use cvy_error::{CvyError, Errno, Result};
use cvy_types::{ByteOffset, ConveyorStats, Generation, OpenFlags, Whence};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

mod ring;
mod store;

pub use ring::RingBuffer;
pub use store::{BackingStore, FileStore, MemStore, StoreResult};

/// Consecutive sequential cache-exhausting reads before an oversized read
/// is allowed to grow the read ring.
const READ_GROWTH_STREAK: u32 = 3;

const DEFAULT_WRITE_CAPACITY: usize = 64 * 1024;
const DEFAULT_MAX_WRITE_CAPACITY: usize = 1024 * 1024;
const DEFAULT_READ_CAPACITY: usize = 64 * 1024;
const DEFAULT_MAX_READ_CAPACITY: usize = 1024 * 1024;
const DEFAULT_WRITE_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Factory configuration for a [`Conveyor`].
///
/// A direction whose initial capacity is zero is disabled outright: no ring
/// is allocated and no worker is spawned for it. The access-mode bits in
/// `flags` additionally gate each direction, so a read-only stream never
/// runs a write worker no matter what capacity it was given.
#[derive(Debug, Clone)]
pub struct ConveyorConfig {
    /// POSIX-style open flags; only the access mode and `O_APPEND` are
    /// interpreted.
    pub flags: OpenFlags,
    /// Initial write ring capacity in bytes; zero disables write buffering.
    pub write_capacity: usize,
    /// Upper bound for adaptive write-ring growth. Equal to
    /// `write_capacity` disables growth.
    pub max_write_capacity: usize,
    /// Initial read ring capacity in bytes; zero disables read buffering.
    pub read_capacity: usize,
    /// Upper bound for adaptive read-ring growth.
    pub max_read_capacity: usize,
    /// How long a producer waits for write-ring space before giving up
    /// with a timeout error.
    pub write_wait_timeout: Duration,
}

impl Default for ConveyorConfig {
    fn default() -> Self {
        Self {
            flags: OpenFlags::RDWR,
            write_capacity: DEFAULT_WRITE_CAPACITY,
            max_write_capacity: DEFAULT_MAX_WRITE_CAPACITY,
            read_capacity: DEFAULT_READ_CAPACITY,
            max_read_capacity: DEFAULT_MAX_READ_CAPACITY,
            write_wait_timeout: DEFAULT_WRITE_WAIT_TIMEOUT,
        }
    }
}

impl ConveyorConfig {
    fn validate(self) -> Result<Self> {
        if self.write_capacity > 0 && self.max_write_capacity < self.write_capacity {
            return Err(CvyError::InvalidConfig(
                "max_write_capacity must be >= write_capacity".to_owned(),
            ));
        }
        if self.read_capacity > 0 && self.max_read_capacity < self.read_capacity {
            return Err(CvyError::InvalidConfig(
                "max_read_capacity must be >= read_capacity".to_owned(),
            ));
        }
        if self.write_wait_timeout.is_zero() {
            return Err(CvyError::InvalidConfig(
                "write_wait_timeout must be > 0".to_owned(),
            ));
        }
        Ok(self)
    }
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

/// One buffered chunk awaiting delivery to the backing store.
///
/// Immutable once enqueued, except that ring growth rebases `start` (growth
/// linearises the live region, moving every staged byte). Removed by the
/// write worker only after the backing-store write succeeded, which is what
/// keeps the chunk visible to the snoop overlay for its whole in-flight
/// life.
#[derive(Debug, Clone, Copy)]
struct WriteRequest {
    /// Target offset in the backing store.
    offset: ByteOffset,
    /// Absolute ring index of the first staged byte.
    start: usize,
    /// Staged byte count.
    len: usize,
    /// Seek generation observed at enqueue time.
    generation: Generation,
}

#[derive(Debug, Default)]
struct DirStats {
    bytes: u64,
    ops: u64,
    latency: Duration,
    congestion: u64,
}

#[derive(Debug)]
struct WriteState {
    ring: RingBuffer,
    queue: VecDeque<WriteRequest>,
    flush_requested: bool,
    stats: DirStats,
}

#[derive(Debug)]
struct ReadState {
    ring: RingBuffer,
    /// Store offset the next fill will read from; always the logical
    /// offset plus the bytes already cached.
    fill_offset: u64,
    fill_requested: bool,
    /// Cached bytes no longer describe the stream (seek or overlapping
    /// write); the worker clears the ring and re-anchors before filling.
    stale: bool,
    /// Consecutive sequential reads that exhausted the cache.
    streak: u32,
    /// Offset the previous read ended at, for sequential detection.
    last_end: u64,
    stats: DirStats,
}

struct Shared {
    store: Arc<dyn BackingStore>,
    append: bool,
    write_active: bool,
    read_active: bool,
    max_write_capacity: usize,
    max_read_capacity: usize,
    write_wait_timeout: Duration,

    write: Mutex<WriteState>,
    /// Signalled when ring space frees up or a flush completes.
    write_producer: Condvar,
    /// Signalled when work arrives for the write worker.
    write_consumer: Condvar,

    read: Mutex<ReadState>,
    /// Signalled when the read worker has something to do.
    read_producer: Condvar,
    /// Signalled when the cache gained data, hit EOF, or must re-check.
    read_consumer: Condvar,

    /// Current stream position as seen by the client.
    logical_offset: AtomicU64,
    /// Bumped by every successful seek; stale worker results are dropped.
    generation: AtomicU64,
    /// Sticky asynchronous error (0 = none), raw errno.
    sticky: AtomicI32,
    /// Backing store reported end-of-data at the current fill offset.
    eof: AtomicBool,
    write_stop: AtomicBool,
    read_stop: AtomicBool,
}

impl Shared {
    fn sticky_errno(&self) -> Option<Errno> {
        let code = self.sticky.load(Ordering::Acquire);
        (code != 0).then_some(Errno(code))
    }

    fn set_sticky(&self, errno: Errno) {
        // First error wins; later failures while the slot is occupied keep
        // the original cause.
        let _ = self
            .sticky
            .compare_exchange(0, errno.0, Ordering::AcqRel, Ordering::Acquire);
    }

    fn current_generation(&self) -> Generation {
        Generation(self.generation.load(Ordering::Acquire))
    }
}

/// Overlay every pending write request intersecting
/// `[start, start + dst.len())` onto `dst`.
///
/// Queue order is write order, so later requests shadow earlier ones at
/// the same offset. The overlay may extend delivery past what the cache
/// and backing store produced (`delivered`); the return value is the
/// length of the contiguous satisfied prefix.
fn overlay_pending_writes(
    state: &WriteState,
    start: u64,
    dst: &mut [u8],
    delivered: usize,
) -> usize {
    if state.queue.is_empty() {
        return delivered;
    }

    let len = dst.len();
    let end = start.saturating_add(len as u64);
    let mut covered = vec![false; len];
    for flag in covered.iter_mut().take(delivered) {
        *flag = true;
    }

    let mut patched = 0_usize;
    for req in &state.queue {
        let req_start = req.offset.0;
        let req_end = req_start.saturating_add(req.len as u64);
        let ov_start = req_start.max(start);
        let ov_end = req_end.min(end);
        if ov_start >= ov_end {
            continue;
        }
        let at = (ov_start - start) as usize;
        let n = (ov_end - ov_start) as usize;
        let ring_pos = req.start + (ov_start - req_start) as usize;
        state.ring.peek_at(ring_pos, &mut dst[at..at + n]);
        for flag in covered[at..at + n].iter_mut() {
            *flag = true;
        }
        patched += n;
    }

    let satisfied = covered.iter().take_while(|flag| **flag).count();
    if patched > 0 {
        trace!(
            target: "cvy::engine",
            event = "snoop_overlay",
            start,
            requested = len,
            lower_layers = delivered,
            patched,
            satisfied
        );
    }
    satisfied
}

/// Rebase queued request ring indices ahead of a growth that linearises
/// the live region (tail moves to 0).
fn rebase_requests(state: &mut WriteState) {
    let cap = state.ring.capacity();
    if cap == 0 {
        return;
    }
    let tail = state.ring.tail();
    for req in &mut state.queue {
        req.start = (req.start + cap - tail) % cap;
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Buffered stream over an offset-addressed backing store.
///
/// Cheap user-facing `write`/`read`/`seek`/`flush` with the semantics of a
/// regular seekable byte stream; up to two background threads move the
/// bytes. Dropping the conveyor flushes pending writes and joins the
/// workers.
pub struct Conveyor {
    shared: Arc<Shared>,
    write_worker: Option<JoinHandle<()>>,
    read_worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Conveyor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conveyor")
            .field("write_active", &self.shared.write_active)
            .field("read_active", &self.shared.read_active)
            .field("position", &self.position())
            .finish_non_exhaustive()
    }
}

impl Conveyor {
    /// Create an engine bound to `store`, spawning the workers the flags
    /// and capacities call for.
    pub fn new(store: Arc<dyn BackingStore>, config: ConveyorConfig) -> Result<Self> {
        let config = config.validate()?;
        let mode = config.flags.access_mode();
        let write_active = mode.writable() && config.write_capacity > 0;
        let read_active = mode.readable() && config.read_capacity > 0;

        let shared = Arc::new(Shared {
            store,
            append: config.flags.is_append(),
            write_active,
            read_active,
            max_write_capacity: config.max_write_capacity,
            max_read_capacity: config.max_read_capacity,
            write_wait_timeout: config.write_wait_timeout,
            write: Mutex::new(WriteState {
                ring: RingBuffer::new(if write_active { config.write_capacity } else { 0 }),
                queue: VecDeque::new(),
                flush_requested: false,
                stats: DirStats::default(),
            }),
            write_producer: Condvar::new(),
            write_consumer: Condvar::new(),
            read: Mutex::new(ReadState {
                ring: RingBuffer::new(if read_active { config.read_capacity } else { 0 }),
                fill_offset: 0,
                fill_requested: false,
                stale: false,
                streak: 0,
                last_end: 0,
                stats: DirStats::default(),
            }),
            read_producer: Condvar::new(),
            read_consumer: Condvar::new(),
            logical_offset: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            sticky: AtomicI32::new(0),
            eof: AtomicBool::new(false),
            write_stop: AtomicBool::new(false),
            read_stop: AtomicBool::new(false),
        });

        let write_worker = if write_active {
            let worker_shared = Arc::clone(&shared);
            Some(
                std::thread::Builder::new()
                    .name("cvy-write-worker".to_owned())
                    .spawn(move || write_worker_loop(&worker_shared))
                    .map_err(CvyError::Io)?,
            )
        } else {
            None
        };
        let read_worker = if read_active {
            let worker_shared = Arc::clone(&shared);
            Some(
                std::thread::Builder::new()
                    .name("cvy-read-worker".to_owned())
                    .spawn(move || read_worker_loop(&worker_shared))
                    .map_err(CvyError::Io)?,
            )
        } else {
            None
        };

        info!(
            target: "cvy::engine",
            event = "conveyor_created",
            mode = ?mode,
            append = shared.append,
            write_capacity = config.write_capacity,
            max_write_capacity = config.max_write_capacity,
            read_capacity = config.read_capacity,
            max_read_capacity = config.max_read_capacity
        );

        Ok(Self {
            shared,
            write_worker,
            read_worker,
        })
    }

    /// Stage `buf` for delivery to the backing store.
    ///
    /// Returns the number of bytes accepted, which is `buf.len()` unless
    /// the producer timed out with partial progress. A request larger than
    /// the write ring can ever grow to fails up front with no partial
    /// progress.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        let shared = &*self.shared;
        if !shared.write_active {
            return Err(CvyError::BadDescriptor("stream is not open for writing"));
        }
        if let Some(errno) = shared.sticky_errno() {
            return Err(CvyError::Store(errno));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        if buf.len() > shared.max_write_capacity {
            return Err(CvyError::MessageTooLong {
                len: buf.len(),
                max: shared.max_write_capacity,
            });
        }

        let mut accepted = 0_usize;
        let mut failure: Option<CvyError> = None;
        let mut guard = shared.write.lock();
        loop {
            let remaining = buf.len() - accepted;
            // Grow before waiting when the remainder cannot fit and there
            // is headroom left.
            if remaining > guard.ring.free_space() && guard.ring.capacity() < shared.max_write_capacity
            {
                let capacity = guard.ring.capacity();
                let target = capacity
                    .saturating_add(remaining.max(capacity))
                    .min(shared.max_write_capacity);
                rebase_requests(&mut guard);
                guard.ring.grow(target);
                debug!(
                    target: "cvy::engine",
                    event = "write_ring_grown",
                    new_capacity = target,
                    pending_requests = guard.queue.len()
                );
            }

            let chunk = remaining.min(guard.ring.free_space());
            if chunk > 0 {
                let start = guard.ring.head();
                let copied = guard.ring.write(&buf[accepted..accepted + chunk]);
                debug_assert_eq!(copied, chunk);
                let offset = ByteOffset(shared.logical_offset.load(Ordering::Acquire));
                let generation = shared.current_generation();
                guard.queue.push_back(WriteRequest {
                    offset,
                    start,
                    len: chunk,
                    generation,
                });
                shared
                    .logical_offset
                    .fetch_add(chunk as u64, Ordering::AcqRel);
                accepted += chunk;
                trace!(
                    target: "cvy::engine",
                    event = "write_staged",
                    offset = offset.0,
                    len = chunk,
                    generation = generation.0,
                    queue_depth = guard.queue.len()
                );
                shared.write_consumer.notify_one();
            }
            if accepted == buf.len() {
                break;
            }

            // Full ring with no headroom: wait for the worker to free
            // space, bounded by the configured timeout.
            guard.stats.congestion += 1;
            let timed_out = shared
                .write_producer
                .wait_while_for(
                    &mut guard,
                    |state| {
                        state.ring.free_space() == 0
                            && shared.sticky_errno().is_none()
                            && !shared.write_stop.load(Ordering::Acquire)
                    },
                    shared.write_wait_timeout,
                )
                .timed_out();

            if let Some(errno) = shared.sticky_errno() {
                failure = Some(CvyError::Store(errno));
                break;
            }
            if shared.write_stop.load(Ordering::Acquire) {
                break;
            }
            if timed_out && guard.ring.free_space() == 0 {
                warn!(
                    target: "cvy::engine",
                    event = "write_wait_timeout",
                    accepted,
                    requested = buf.len()
                );
                failure = Some(CvyError::TimedOut);
                break;
            }
        }
        drop(guard);

        // The staged bytes change the stream's content at offsets whose
        // old bytes may already sit in the read cache, and they advanced
        // the logical offset past the cache's anchor; invalidate on every
        // path that accepted anything, including the failure exits.
        if accepted > 0 && shared.read_active && shared.write_active {
            self.invalidate_read_cache();
        }
        match failure {
            // Partial progress wins over the failure: the accepted bytes
            // stay queued and the count reports them.
            Some(err) if accepted == 0 => Err(err),
            _ => Ok(accepted),
        }
    }

    /// Read up to `buf.len()` bytes at the current position.
    ///
    /// `Ok(0)` on a non-empty `buf` means end-of-stream. Bytes come from
    /// the read cache, then from backing-store fills, and finally any
    /// pending writes overlapping the range are overlaid so the stream
    /// observes its own unflushed writes.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let shared = &*self.shared;
        if !shared.read_active {
            return Err(CvyError::BadDescriptor("stream is not open for reading"));
        }
        if let Some(errno) = shared.sticky_errno() {
            return Err(CvyError::Store(errno));
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let mut guard = shared.read.lock();
        let start = shared.logical_offset.load(Ordering::Acquire);
        let entry_generation = shared.current_generation();

        if guard.last_end != start {
            guard.streak = 0;
        }
        self.maybe_grow_read_ring(&mut guard, buf.len());

        let mut delivered = 0_usize;
        let mut exhausted = false;
        loop {
            let consumed = guard.ring.read(&mut buf[delivered..]);
            if consumed > 0 {
                delivered += consumed;
                shared
                    .logical_offset
                    .fetch_add(consumed as u64, Ordering::AcqRel);
            }
            if delivered == buf.len() {
                break;
            }

            exhausted = true;
            if shared.eof.load(Ordering::Acquire)
                || shared.read_stop.load(Ordering::Acquire)
                || shared.sticky_errno().is_some()
            {
                break;
            }

            guard.fill_requested = true;
            shared.read_producer.notify_one();
            shared.read_consumer.wait_while(&mut guard, |state| {
                state.ring.is_empty()
                    && !shared.eof.load(Ordering::Acquire)
                    && shared.current_generation() == entry_generation
                    && !shared.read_stop.load(Ordering::Acquire)
                    && shared.sticky_errno().is_none()
            });
            if shared.current_generation() != entry_generation {
                // A seek raced this read; everything from here on belongs
                // to the new position.
                break;
            }
        }
        guard.streak = if exhausted {
            guard.streak.saturating_add(1)
        } else {
            0
        };

        // Snoop layer: pending writes shadow whatever the cache and the
        // backing store produced, and may extend delivery past EOF.
        // Taking the write mutex while holding the read mutex follows the
        // fixed global order (read, then write).
        let total = if shared.write_active {
            let write_guard = shared.write.lock();
            overlay_pending_writes(&write_guard, start, buf, delivered)
        } else {
            delivered
        };
        if total > delivered {
            shared
                .logical_offset
                .fetch_add((total - delivered) as u64, Ordering::AcqRel);
            // The overlay moved the position past what the cache was
            // anchored to; the worker re-anchors before its next fill.
            guard.stale = true;
        }
        guard.last_end = start + total as u64;
        drop(guard);

        if total == 0 {
            if let Some(errno) = shared.sticky_errno() {
                return Err(CvyError::Store(errno));
            }
        }
        Ok(total)
    }

    /// Reposition the stream.
    ///
    /// Drains pending writes first, then resolves the target against the
    /// backing store (`SEEK_CUR` is resolved against the engine's own
    /// logical offset), invalidates the read cache, and bumps the seek
    /// generation so in-flight fills are discarded.
    pub fn seek(&self, offset: i64, whence: Whence) -> Result<ByteOffset> {
        let shared = &*self.shared;
        if let Some(errno) = shared.sticky_errno() {
            return Err(CvyError::Store(errno));
        }
        self.flush()?;

        // Both mutexes, fixed global order: read, then write.
        let mut read_guard = shared.read.lock();
        let write_guard = shared.write.lock();

        let (effective_offset, effective_whence) = match whence {
            Whence::Cur => {
                let logical = ByteOffset(shared.logical_offset.load(Ordering::Acquire));
                let target = logical
                    .checked_offset(offset)
                    .ok_or(CvyError::Store(Errno(libc::EINVAL)))?;
                let raw = i64::try_from(target.0)
                    .map_err(|_| CvyError::Store(Errno(libc::EOVERFLOW)))?;
                (raw, Whence::Set)
            }
            other => (offset, other),
        };
        let new_pos = shared
            .store
            .seek(effective_offset, effective_whence)
            .map_err(CvyError::Store)?;

        read_guard.ring.clear();
        read_guard.stale = true;
        read_guard.fill_offset = new_pos.0;
        read_guard.streak = 0;
        read_guard.last_end = new_pos.0;
        shared.eof.store(false, Ordering::Release);
        shared.logical_offset.store(new_pos.0, Ordering::Release);
        let generation = shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(
            target: "cvy::engine",
            event = "seek",
            offset,
            whence = ?whence,
            new_pos = new_pos.0,
            generation
        );

        drop(write_guard);
        drop(read_guard);
        shared.read_producer.notify_all();
        shared.read_consumer.notify_all();
        shared.write_producer.notify_all();
        shared.write_consumer.notify_all();
        Ok(new_pos)
    }

    /// Block until every staged write has reached the backing store.
    ///
    /// A no-op success on a write-disabled stream. Fails with the sticky
    /// error if a worker already hit one or hits one while draining.
    pub fn flush(&self) -> Result<()> {
        let shared = &*self.shared;
        if !shared.write_active {
            return Ok(());
        }
        if let Some(errno) = shared.sticky_errno() {
            return Err(CvyError::Store(errno));
        }

        let mut guard = shared.write.lock();
        if guard.queue.is_empty() {
            return Ok(());
        }
        guard.flush_requested = true;
        shared.write_consumer.notify_one();
        shared.write_producer.wait_while(&mut guard, |state| {
            !state.queue.is_empty()
                && shared.sticky_errno().is_none()
                && !shared.write_stop.load(Ordering::Acquire)
        });
        guard.flush_requested = false;
        drop(guard);

        match shared.sticky_errno() {
            Some(errno) => Err(CvyError::Store(errno)),
            None => Ok(()),
        }
    }

    /// Snapshot the cumulative statistics and zero them.
    pub fn take_stats(&self) -> ConveyorStats {
        let shared = &*self.shared;
        // Fixed global order: read, then write.
        let mut read_guard = shared.read.lock();
        let mut write_guard = shared.write.lock();
        let snapshot = ConveyorStats {
            bytes_written: write_guard.stats.bytes,
            bytes_read: read_guard.stats.bytes,
            backing_writes: write_guard.stats.ops,
            backing_reads: read_guard.stats.ops,
            write_latency: write_guard.stats.latency,
            read_latency: read_guard.stats.latency,
            congestion_events: write_guard.stats.congestion,
        };
        write_guard.stats = DirStats::default();
        read_guard.stats = DirStats::default();
        snapshot
    }

    /// The sticky asynchronous error, if any, without clearing it.
    #[must_use]
    pub fn last_error(&self) -> Option<Errno> {
        self.shared.sticky_errno()
    }

    /// Clear the sticky error and nudge the write worker, which resumes
    /// draining from the request that failed.
    pub fn clear_error(&self) {
        self.shared.sticky.store(0, Ordering::Release);
        self.shared.write_consumer.notify_all();
        self.shared.read_producer.notify_all();
    }

    /// Current logical stream position.
    #[must_use]
    pub fn position(&self) -> ByteOffset {
        ByteOffset(self.shared.logical_offset.load(Ordering::Acquire))
    }

    /// Flush and tear down, joining both workers.
    ///
    /// Equivalent to dropping the conveyor; provided for call sites that
    /// want the shutdown to be visible in the source.
    pub fn shutdown(self) {}

    fn invalidate_read_cache(&self) {
        let shared = &*self.shared;
        let mut guard = shared.read.lock();
        guard.ring.clear();
        guard.stale = true;
        shared.eof.store(false, Ordering::Release);
        trace!(target: "cvy::engine", event = "read_cache_invalidated");
        drop(guard);
        shared.read_producer.notify_one();
    }

    fn maybe_grow_read_ring(&self, guard: &mut MutexGuard<'_, ReadState>, requested: usize) {
        let shared = &*self.shared;
        let capacity = guard.ring.capacity();
        if requested <= capacity
            || guard.streak < READ_GROWTH_STREAK
            || capacity >= shared.max_read_capacity
        {
            return;
        }
        let target = requested
            .max(capacity.saturating_mul(2))
            .min(shared.max_read_capacity);
        guard.ring.grow(target);
        debug!(
            target: "cvy::engine",
            event = "read_ring_grown",
            new_capacity = target,
            requested,
            streak = guard.streak
        );
    }
}

impl Drop for Conveyor {
    fn drop(&mut self) {
        let shared = &*self.shared;
        if shared.write_active {
            // Best-effort drain; a sticky error means pending requests are
            // dropped, which the caller already saw surfaced.
            if let Err(err) = self.flush() {
                warn!(
                    target: "cvy::engine",
                    event = "shutdown_flush_failed",
                    error = %err
                );
            }
        }

        shared.write_stop.store(true, Ordering::Release);
        shared.read_stop.store(true, Ordering::Release);
        shared.write_producer.notify_all();
        shared.write_consumer.notify_all();
        shared.read_producer.notify_all();
        shared.read_consumer.notify_all();

        if let Some(join) = self.read_worker.take() {
            let _ = join.join();
        }
        if let Some(join) = self.write_worker.take() {
            let _ = join.join();
        }
        info!(target: "cvy::engine", event = "conveyor_destroyed");
    }
}

// ---------------------------------------------------------------------------
// Write worker
// ---------------------------------------------------------------------------

fn write_worker_loop(shared: &Arc<Shared>) {
    let mut scratch: Vec<u8> = Vec::new();
    let mut guard = shared.write.lock();
    loop {
        shared.write_consumer.wait_while(&mut guard, |state| {
            !shared.write_stop.load(Ordering::Acquire)
                && !state.flush_requested
                && (state.queue.is_empty() || shared.sticky_errno().is_some())
        });
        if shared.write_stop.load(Ordering::Acquire) {
            break;
        }
        if shared.sticky_errno().is_some() {
            // Draining pauses until clear_error; release flush waiters so
            // they observe the error instead of hanging.
            guard.flush_requested = false;
            shared.write_producer.notify_all();
            continue;
        }
        let Some(request) = guard.queue.front().copied() else {
            guard.flush_requested = false;
            shared.write_producer.notify_all();
            continue;
        };

        // Snapshot the staged bytes under the mutex, then release it
        // across the backing-store call. The request stays at the queue
        // head so readers keep snooping it until the bytes are durable.
        scratch.resize(request.len, 0);
        guard.ring.peek_at(request.start, &mut scratch[..request.len]);
        drop(guard);

        let target = if shared.append {
            match shared.store.seek(0, Whence::End) {
                Ok(end) => end,
                Err(errno) => {
                    error!(
                        target: "cvy::worker",
                        event = "append_seek_failed",
                        errno = errno.0
                    );
                    shared.set_sticky(errno);
                    guard = shared.write.lock();
                    shared.write_producer.notify_all();
                    shared.read_consumer.notify_all();
                    continue;
                }
            }
        } else {
            request.offset
        };

        let started = Instant::now();
        let mut written = 0_usize;
        let mut calls = 0_u64;
        let failure = loop {
            calls += 1;
            let at = ByteOffset(target.0 + written as u64);
            match shared.store.pwrite_at(&scratch[written..request.len], at) {
                // Zero forward progress would spin forever; report it as
                // an I/O failure.
                Ok(0) => break Some(Errno(libc::EIO)),
                Ok(n) => {
                    written += n;
                    if written == request.len {
                        break None;
                    }
                    trace!(
                        target: "cvy::worker",
                        event = "short_write_retry",
                        offset = target.0,
                        written,
                        len = request.len
                    );
                }
                Err(errno) => break Some(errno),
            }
        };
        let elapsed = started.elapsed();

        guard = shared.write.lock();
        guard.stats.ops += calls;
        guard.stats.latency += elapsed;
        match failure {
            Some(errno) => {
                error!(
                    target: "cvy::worker",
                    event = "backing_write_failed",
                    errno = errno.0,
                    offset = target.0,
                    len = request.len,
                    written
                );
                shared.set_sticky(errno);
                shared.write_producer.notify_all();
                shared.read_consumer.notify_all();
            }
            None => {
                guard.stats.bytes += request.len as u64;
                guard.ring.discard(request.len);
                guard.queue.pop_front();
                trace!(
                    target: "cvy::worker",
                    event = "write_drained",
                    offset = target.0,
                    len = request.len,
                    queue_depth = guard.queue.len()
                );
                if guard.queue.is_empty() {
                    guard.flush_requested = false;
                }
                shared.write_producer.notify_all();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Read worker
// ---------------------------------------------------------------------------

fn read_worker_loop(shared: &Arc<Shared>) {
    let mut scratch: Vec<u8> = Vec::new();
    let mut guard = shared.read.lock();
    loop {
        shared.read_producer.wait_while(&mut guard, |state| {
            !shared.read_stop.load(Ordering::Acquire) && !state.stale && !state.fill_requested
        });
        if shared.read_stop.load(Ordering::Acquire) {
            break;
        }
        if guard.stale {
            guard.ring.clear();
            guard.stale = false;
            guard.fill_offset = shared.logical_offset.load(Ordering::Acquire);
            shared.eof.store(false, Ordering::Release);
            trace!(
                target: "cvy::worker",
                event = "read_cache_reset",
                fill_offset = guard.fill_offset
            );
        }
        if !guard.fill_requested {
            continue;
        }
        if shared.eof.load(Ordering::Acquire) || shared.sticky_errno().is_some() {
            guard.fill_requested = false;
            shared.read_consumer.notify_all();
            continue;
        }
        let want = guard.ring.free_space();
        if want == 0 {
            guard.fill_requested = false;
            shared.read_consumer.notify_all();
            continue;
        }

        let fill_generation = shared.current_generation();
        let offset = ByteOffset(guard.fill_offset);
        scratch.resize(want, 0);
        drop(guard);

        let started = Instant::now();
        let result = shared.store.pread_at(&mut scratch[..want], offset);
        let elapsed = started.elapsed();

        guard = shared.read.lock();
        guard.stats.ops += 1;
        guard.stats.latency += elapsed;
        if shared.current_generation() != fill_generation || guard.stale {
            // A seek or an overlapping write moved the stream while the
            // read was in flight; the bytes describe the old view.
            // `fill_requested` stays set so the next pass re-fills at the
            // re-anchored offset for any consumer still waiting.
            debug!(
                target: "cvy::worker",
                event = "fill_discarded",
                offset = offset.0,
                stale = guard.stale
            );
            shared.read_consumer.notify_all();
            continue;
        }
        match result {
            Err(errno) => {
                error!(
                    target: "cvy::worker",
                    event = "backing_read_failed",
                    errno = errno.0,
                    offset = offset.0
                );
                shared.set_sticky(errno);
                guard.fill_requested = false;
                shared.read_consumer.notify_all();
            }
            Ok(0) => {
                shared.eof.store(true, Ordering::Release);
                guard.fill_requested = false;
                trace!(
                    target: "cvy::worker",
                    event = "backing_eof",
                    offset = offset.0
                );
                shared.read_consumer.notify_all();
            }
            Ok(n) => {
                guard.stats.bytes += n as u64;
                let appended = guard.ring.write(&scratch[..n]);
                debug_assert_eq!(appended, n);
                guard.fill_offset += n as u64;
                guard.fill_requested = false;
                trace!(
                    target: "cvy::worker",
                    event = "cache_filled",
                    offset = offset.0,
                    len = n,
                    cached = guard.ring.len()
                );
                shared.read_consumer.notify_all();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
