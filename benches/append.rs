use std::sync::Arc;

use criterion::{black_box, BatchSize, BenchmarkId, Criterion};
use criterion::{criterion_group, criterion_main};
use tempfile::tempdir;

use bagfile::{Bag, BagMode, Compression, RawMessage, Time, TopicInfo};

const WRITES_PER_ITER: u32 = 1_000;

fn bench_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("write");
    for &size in &[64_usize, 256, 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || {
                    let dir = tempdir().expect("tempdir");
                    let path = dir.path().join("bench.bag");
                    let mut bag = Bag::open(&path, BagMode::Write).expect("open");
                    bag.set_compression(Compression::None);
                    let info = Arc::new(TopicInfo {
                        topic: "/bench".to_string(),
                        datatype: "test_msgs/Blob".to_string(),
                        md5sum: "d41d8cd98f00b204e9800998ecf8427e".to_string(),
                        msg_def: "byte[] data\n".to_string(),
                    });
                    let msg = RawMessage::new(info, vec![0u8; size]);
                    (dir, bag, msg)
                },
                |(_dir, mut bag, msg)| {
                    for i in 0..WRITES_PER_ITER {
                        bag.write("/bench", Time::new(i, 0), black_box(&msg)).expect("write");
                    }
                    bag.close().expect("close");
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_write);
criterion_main!(benches);
