//! Benchmarks for archive creation and incremental updates

use apkzip_rs::{SigningOptions, ZFile, ZFileBuilder};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::Path;
use tempfile::TempDir;

fn random_payload(rng: &mut StdRng, size: usize) -> Vec<u8> {
    let mut data = vec![0u8; size];
    rng.fill(&mut data[..]);
    data
}

fn build_archive(path: &Path, count: usize, size: usize) {
    let mut rng = StdRng::seed_from_u64(42);
    let mut zfile = ZFile::open(path).unwrap();
    for i in 0..count {
        let data = random_payload(&mut rng, size);
        zfile.add_bytes(&format!("res/raw/file{}.bin", i), &data, false).unwrap();
    }
    zfile.close().unwrap();
}

fn benchmark_bulk_add(c: &mut Criterion) {
    let mut group = c.benchmark_group("zfile_bulk_add");

    for count in [10, 100, 1000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            b.iter(|| {
                let temp_dir = TempDir::new().unwrap();
                build_archive(&temp_dir.path().join("bulk.zip"), black_box(count), 4096);
            });
        });
    }

    group.finish();
}

fn benchmark_incremental_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("zfile_incremental_update");

    for count in [100, 1000].iter() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("incremental.zip");
        build_archive(&path, *count, 4096);
        let mut rng = StdRng::seed_from_u64(7);

        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, _| {
            b.iter(|| {
                let mut zfile = ZFile::open(&path).unwrap();
                let data = random_payload(&mut rng, 4096);
                zfile.add_bytes("res/raw/file0.bin", black_box(&data), false).unwrap();
                zfile.close().unwrap();
            });
        });
    }

    group.finish();
}

fn benchmark_signed_update(c: &mut Criterion) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("signed.apk");
    build_archive(&path, 200, 16 * 1024);
    let signing = SigningOptions::from_secret_bytes(&[9u8; 32]).unwrap();
    let mut rng = StdRng::seed_from_u64(3);

    c.bench_function("zfile_signed_update", |b| {
        b.iter(|| {
            let mut zfile = ZFileBuilder::new()
                .path(&path)
                .signing(signing.clone())
                .build()
                .unwrap();
            let data = random_payload(&mut rng, 1024);
            zfile.add_bytes("classes.dex", black_box(&data), true).unwrap();
            zfile.close().unwrap();
        });
    });
}

criterion_group!(
    benches,
    benchmark_bulk_add,
    benchmark_incremental_update,
    benchmark_signed_update
);
criterion_main!(benches);
