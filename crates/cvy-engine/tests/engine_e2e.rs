#![forbid(unsafe_code)]
//! End-to-end scenarios driving a full engine against an in-memory (and,
//! where it matters, a file-backed) store with latency and fault
//! injection.

use cvy_engine::{BackingStore, Conveyor, ConveyorConfig, FileStore, MemStore};
use cvy_error::{CvyError, Errno};
use cvy_types::{ByteOffset, OpenFlags, Whence};
use std::sync::Arc;
use std::sync::Barrier;
use std::time::Duration;

fn config(flags: OpenFlags) -> ConveyorConfig {
    ConveyorConfig {
        flags,
        write_capacity: 4096,
        max_write_capacity: 64 * 1024,
        read_capacity: 4096,
        max_read_capacity: 64 * 1024,
        ..ConveyorConfig::default()
    }
}

fn engine_over(store: &Arc<MemStore>, cfg: ConveyorConfig) -> Conveyor {
    Conveyor::new(Arc::clone(store) as Arc<dyn BackingStore>, cfg).unwrap()
}

#[test]
fn write_then_flush_lands_verbatim() {
    let store = Arc::new(MemStore::new(0));
    let conv = engine_over(&store, config(OpenFlags::WRONLY));

    assert_eq!(conv.write(b"Hello, Conveyor!").unwrap(), 16);
    conv.flush().unwrap();
    assert_eq!(&store.contents(), b"Hello, Conveyor!");
}

#[test]
fn read_through_pending_writes_with_slow_store() {
    let store = Arc::new(MemStore::with_contents(b"DDDDDDDDDD"));
    store.set_write_delay(Duration::from_millis(50));
    let conv = engine_over(&store, config(OpenFlags::RDWR));

    conv.seek(2, Whence::Set).unwrap();
    assert_eq!(conv.write(b"WW").unwrap(), 2);
    conv.seek(6, Whence::Set).unwrap();
    assert_eq!(conv.write(b"ZZ").unwrap(), 2);
    conv.seek(0, Whence::Set).unwrap();

    let mut buf = [0_u8; 10];
    assert_eq!(conv.read(&mut buf).unwrap(), 10);
    assert_eq!(&buf, b"DDWWDDZZDD");
}

#[test]
fn write_far_past_eof_then_read_back() {
    const MIB: u64 = 1024 * 1024;
    let store = Arc::new(MemStore::new(MIB as usize));
    store.set_write_delay(Duration::from_millis(50));
    let conv = engine_over(&store, config(OpenFlags::RDWR));

    assert_eq!(conv.seek(2 * MIB as i64, Whence::Set).unwrap(), ByteOffset(2 * MIB));
    assert_eq!(conv.write(b"NewDataAtEOF").unwrap(), 12);
    assert_eq!(conv.seek(2 * MIB as i64, Whence::Set).unwrap(), ByteOffset(2 * MIB));

    let mut buf = [0_u8; 12];
    assert_eq!(conv.read(&mut buf).unwrap(), 12);
    assert_eq!(&buf, b"NewDataAtEOF");
}

#[test]
fn flush_is_durable_and_fifo() {
    let store = Arc::new(MemStore::new(0));
    store.set_write_delay(Duration::from_millis(5));
    let conv = engine_over(&store, config(OpenFlags::WRONLY));

    let mut expected = Vec::new();
    for round in 0_u8..20 {
        let chunk = vec![round; 37 + usize::from(round)];
        assert_eq!(conv.write(&chunk).unwrap(), chunk.len());
        expected.extend_from_slice(&chunk);
    }
    conv.flush().unwrap();
    assert_eq!(store.contents(), expected);
}

#[test]
fn append_mode_respects_external_extension() {
    let store = Arc::new(MemStore::with_contents(b"start"));
    let conv = engine_over(&store, config(OpenFlags::WRONLY | OpenFlags::APPEND));

    assert_eq!(conv.write(b"AA").unwrap(), 2);
    conv.flush().unwrap();
    assert_eq!(&store.contents(), b"startAA");

    // Another writer extends the store behind the engine's back; the
    // next append must land at the new end, not the recorded offset.
    store.pwrite_at(b"ZZZ", ByteOffset(7)).unwrap();
    assert_eq!(conv.write(b"BB").unwrap(), 2);
    conv.flush().unwrap();
    assert_eq!(&store.contents(), b"startAAZZZBB");
}

#[test]
fn seek_discards_in_flight_fill() {
    let mut contents = vec![0_u8; 5004];
    contents[..4].copy_from_slice(b"AAAA");
    contents[5000..].copy_from_slice(b"BBBB");
    let store = Arc::new(MemStore::with_contents(&contents));
    store.set_read_delay(Duration::from_millis(200));
    let conv = Arc::new(engine_over(&store, config(OpenFlags::RDONLY)));

    let ready = Arc::new(Barrier::new(2));
    let racing_reader = {
        let conv = Arc::clone(&conv);
        let ready = Arc::clone(&ready);
        std::thread::spawn(move || {
            ready.wait();
            let mut buf = [0_u8; 4];
            conv.read(&mut buf).unwrap()
        })
    };

    // Let the reader park on the slow fill, then yank the stream out
    // from under it.
    ready.wait();
    std::thread::sleep(Duration::from_millis(50));
    conv.seek(5000, Whence::Set).unwrap();

    // The racing read observes the generation change and delivers
    // nothing from before the seek.
    assert_eq!(racing_reader.join().unwrap(), 0);

    let mut buf = [0_u8; 4];
    assert_eq!(conv.read(&mut buf).unwrap(), 4);
    assert_eq!(&buf, b"BBBB");
}

#[test]
fn reader_snoops_concurrent_unflushed_write() {
    let store = Arc::new(MemStore::with_contents(b"AAAA"));
    store.set_read_delay(Duration::from_millis(150));
    store.set_write_delay(Duration::from_millis(500));
    let conv = Arc::new(engine_over(&store, config(OpenFlags::RDWR)));

    let ready = Arc::new(Barrier::new(2));
    let reader = {
        let conv = Arc::clone(&conv);
        let ready = Arc::clone(&ready);
        std::thread::spawn(move || {
            ready.wait();
            let mut buf = [0_u8; 4];
            let n = conv.read(&mut buf).unwrap();
            (n, buf)
        })
    };

    // While the reader's fill is stuck in the slow store, overwrite the
    // range it is reading. The write sits in the queue (pwrite is even
    // slower), so only the snoop overlay can satisfy the reader
    // correctly.
    ready.wait();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(conv.write(b"BBBB").unwrap(), 4);

    let (n, buf) = reader.join().unwrap();
    assert_eq!(n, 4);
    assert_eq!(&buf, b"BBBB");

    conv.flush().unwrap();
    assert_eq!(&store.contents(), b"BBBB");
}

#[test]
fn sequential_recovery_scan_reads_everything() {
    // Recovery-style consumption: open at zero, read until EOF.
    let mut existing = Vec::new();
    for record in 0..5000 {
        existing.extend_from_slice(format!("REC{record}|").as_bytes());
    }
    let store = Arc::new(MemStore::with_contents(&existing));
    let conv = engine_over(
        &store,
        ConveyorConfig {
            flags: OpenFlags::RDONLY,
            write_capacity: 0,
            max_write_capacity: 0,
            read_capacity: 4096,
            max_read_capacity: 1024 * 1024,
            ..ConveyorConfig::default()
        },
    );

    let mut recovered = Vec::with_capacity(existing.len());
    let mut buf = [0_u8; 1024];
    loop {
        let n = conv.read(&mut buf).unwrap();
        if n == 0 {
            break;
        }
        recovered.extend_from_slice(&buf[..n]);
    }
    assert_eq!(recovered, existing);
}

#[test]
fn oversized_sequential_reads_grow_the_cache() {
    let store = Arc::new(MemStore::with_contents(&vec![b'X'; 2048]));
    let conv = engine_over(
        &store,
        ConveyorConfig {
            flags: OpenFlags::RDONLY,
            write_capacity: 0,
            max_write_capacity: 0,
            read_capacity: 128,
            max_read_capacity: 4096,
            ..ConveyorConfig::default()
        },
    );

    // Three sequential reads that drain the small cache prime the
    // growth heuristic; the oversized fourth is then served whole.
    let mut buf = vec![0_u8; 1000];
    for _ in 0..3 {
        assert_eq!(conv.read(&mut buf[..100]).unwrap(), 100);
    }
    assert_eq!(conv.read(&mut buf).unwrap(), 1000);
    assert!(buf.iter().all(|byte| *byte == b'X'));
}

#[test]
fn async_write_error_is_sticky_until_cleared() {
    let store = Arc::new(MemStore::new(0));
    store.set_write_delay(Duration::from_millis(50));
    let conv = engine_over(&store, config(OpenFlags::RDWR));

    store.fail_next_write(libc::EIO);
    assert_eq!(conv.write(b"Good").unwrap(), 4);
    assert_eq!(conv.write(b"Bad").unwrap(), 3);
    std::thread::sleep(Duration::from_millis(200));

    let mut buf = [0_u8; 10];
    let err = conv.read(&mut buf).unwrap_err();
    assert!(matches!(err, CvyError::Store(Errno(code)) if code == libc::EIO));
    let err = conv.write(b"More").unwrap_err();
    assert!(matches!(err, CvyError::Store(Errno(code)) if code == libc::EIO));

    conv.clear_error();
    conv.flush().unwrap();
    assert_eq!(&store.contents(), b"GoodBad");
}

#[test]
fn wrapped_ring_grow_delivers_bytes_in_order() {
    let store = Arc::new(MemStore::new(0));
    store.set_write_delay(Duration::from_millis(300));
    let conv = engine_over(
        &store,
        ConveyorConfig {
            flags: OpenFlags::WRONLY,
            write_capacity: 100,
            max_write_capacity: 500,
            read_capacity: 0,
            max_read_capacity: 0,
            ..ConveyorConfig::default()
        },
    );

    conv.write(&vec![b'1'; 80]).unwrap();
    // Let the worker drain the first request so the next write wraps.
    std::thread::sleep(Duration::from_millis(400));
    conv.write(&vec![b'2'; 40]).unwrap();
    conv.write(&vec![b'3'; 200]).unwrap();
    conv.flush().unwrap();

    let mut expected = vec![b'1'; 80];
    expected.extend_from_slice(&[b'2'; 40]);
    expected.extend_from_slice(&vec![b'3'; 200]);
    assert_eq!(store.contents(), expected);
}

#[test]
fn concurrent_producers_interleave_whole_chunks() {
    let store = Arc::new(MemStore::new(0));
    store.set_write_delay(Duration::from_millis(1));
    let conv = Arc::new(engine_over(&store, config(OpenFlags::WRONLY)));

    let mut producers = Vec::new();
    for tag in [b'a', b'b', b'c', b'd'] {
        let conv = Arc::clone(&conv);
        producers.push(std::thread::spawn(move || {
            for _ in 0..25 {
                assert_eq!(conv.write(&[tag; 16]).unwrap(), 16);
            }
        }));
    }
    for producer in producers {
        producer.join().unwrap();
    }
    conv.flush().unwrap();

    // Each accepted chunk lands contiguously; only the interleaving of
    // whole chunks is scheduler-dependent.
    let contents = store.contents();
    assert_eq!(contents.len(), 4 * 25 * 16);
    let mut counts = std::collections::HashMap::new();
    for chunk in contents.chunks(16) {
        assert!(chunk.iter().all(|byte| *byte == chunk[0]));
        *counts.entry(chunk[0]).or_insert(0_u32) += 1;
    }
    for tag in [b'a', b'b', b'c', b'd'] {
        assert_eq!(counts[&tag], 25);
    }
}

#[test]
fn file_store_round_trip_through_engine() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("conveyor.dat");
    std::fs::write(&path, b"..........").unwrap();

    let store = Arc::new(FileStore::open(&path).unwrap());
    let conv = Conveyor::new(store as Arc<dyn BackingStore>, config(OpenFlags::RDWR)).unwrap();

    assert_eq!(conv.write(b"0123456789").unwrap(), 10);
    conv.seek(3, Whence::Set).unwrap();
    let mut buf = [0_u8; 4];
    assert_eq!(conv.read(&mut buf).unwrap(), 4);
    assert_eq!(&buf, b"3456");

    conv.shutdown();
    assert_eq!(std::fs::read(&path).unwrap(), b"0123456789");
}
