//! Write-behind and read-ahead throughput against an in-memory store.

use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use cvy_engine::{BackingStore, Conveyor, ConveyorConfig, MemStore};
use cvy_types::{OpenFlags, Whence};
use std::sync::Arc;

const CHUNK: usize = 4096;
const CHUNKS_PER_ITER: usize = 64;

fn bench_config(flags: OpenFlags) -> ConveyorConfig {
    ConveyorConfig {
        flags,
        write_capacity: 256 * 1024,
        max_write_capacity: 1024 * 1024,
        read_capacity: 256 * 1024,
        max_read_capacity: 1024 * 1024,
        ..ConveyorConfig::default()
    }
}

fn write_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("write");
    group.throughput(Throughput::Bytes((CHUNK * CHUNKS_PER_ITER) as u64));
    group.bench_function("buffered_write_flush", |b| {
        let payload = vec![0x5A_u8; CHUNK];
        b.iter(|| {
            let store = Arc::new(MemStore::new(0));
            let conv = Conveyor::new(
                Arc::clone(&store) as Arc<dyn BackingStore>,
                bench_config(OpenFlags::WRONLY),
            )
            .unwrap();
            for _ in 0..CHUNKS_PER_ITER {
                conv.write(&payload).unwrap();
            }
            conv.flush().unwrap();
        });
    });
    group.finish();
}

fn read_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("read");
    group.throughput(Throughput::Bytes((CHUNK * CHUNKS_PER_ITER) as u64));
    group.bench_function("buffered_sequential_read", |b| {
        let store = Arc::new(MemStore::with_contents(&vec![
            0xA5_u8;
            CHUNK * CHUNKS_PER_ITER
        ]));
        let conv = Conveyor::new(
            Arc::clone(&store) as Arc<dyn BackingStore>,
            bench_config(OpenFlags::RDONLY),
        )
        .unwrap();
        let mut buf = vec![0_u8; CHUNK];
        b.iter(|| {
            conv.seek(0, Whence::Set).unwrap();
            let mut total = 0_usize;
            while total < CHUNK * CHUNKS_PER_ITER {
                let n = conv.read(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                total += n;
            }
            assert_eq!(total, CHUNK * CHUNKS_PER_ITER);
        });
    });
    group.finish();
}

criterion_group!(benches, write_throughput, read_throughput);
criterion_main!(benches);
