//! Benchmark: reservation fast path vs recalculating slow path, and the
//! cost of marking one extent.

use bfs_core::{
    BucketGen, BucketIdx, CoreConfig, CrcInfo, DeviceConfig, DeviceIdx, DiskReservation,
    ExtentPtr, Filesystem, GcPos, JournalSeq, MarkFlags, ReservationFlags, StorageKey,
};
use criterion::{Criterion, black_box, criterion_group, criterion_main};

fn make_fs(sectors_cache: u64) -> Filesystem {
    let fs = Filesystem::new(CoreConfig {
        shards: 1,
        sectors_cache,
        ..CoreConfig::default()
    })
    .unwrap();
    fs.dev_buckets_alloc(DeviceConfig::new(0, 4096, 1024)).unwrap();
    fs
}

fn bench_add_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("reservation_add_put");

    for (name, cache) in [("cached_slice", 1024_u64), ("no_slice", 0)] {
        let fs = make_fs(cache);
        group.bench_function(name, |b| {
            b.iter(|| {
                let mut res = DiskReservation::new(1);
                fs.disk_reservation_add(&mut res, black_box(8), ReservationFlags::NONE)
                    .unwrap();
                fs.disk_reservation_put(&mut res);
                black_box(res.sectors())
            });
        });
    }

    group.finish();
}

fn bench_mark_extent(c: &mut Criterion) {
    let fs = make_fs(1024);
    let dev = DeviceIdx(0);
    fs.mark_alloc_bucket(dev, BucketIdx(7), true, GcPos::NOT_RUNNING, MarkFlags::NONE)
        .unwrap();
    let key = StorageKey::Extent {
        ptrs: vec![ExtentPtr::new(dev, 7 * 1024, BucketGen(0)).with_crc(CrcInfo::uncompressed(16))],
    };

    c.bench_function("mark_extent_insert_remove", |b| {
        b.iter(|| {
            fs.mark_key(&key, true, 16, GcPos::NOT_RUNNING, None, JournalSeq(0), MarkFlags::NONE)
                .unwrap();
            fs.mark_key(&key, false, -16, GcPos::NOT_RUNNING, None, JournalSeq(0), MarkFlags::NONE)
                .unwrap();
        });
    });
}

fn bench_usage_read(c: &mut Criterion) {
    let fs = make_fs(1024);
    c.bench_function("fs_usage_read_short", |b| {
        b.iter(|| black_box(fs.fs_usage_read_short()));
    });
}

criterion_group!(benches, bench_add_put, bench_mark_extent, bench_usage_read);
criterion_main!(benches);
