//! Performance benchmarks for the camvault chunk pipeline

use std::io::Cursor;
use std::sync::Arc;

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempfile::TempDir;

use camvault::{
    container::ContainerWriter,
    crypto::{ChunkDecryptor, ChunkEncryptor, SourceInfo},
    format::{ContainerReader, DayHeader},
    keys::KeyMaterial,
};

const SIZES: [usize; 3] = [64 * 1024, 1024 * 1024, 5 * 1024 * 1024];

fn source(name: &str) -> SourceInfo {
    SourceInfo { filename: name.to_string(), modified: Utc::now() }
}

/// Benchmark chunk encryption and decryption throughput
fn bench_chunk_crypto(c: &mut Criterion) {
    let key = Arc::new(KeyMaterial::generate());
    let encryptor = ChunkEncryptor::new(key.clone());
    let decryptor = ChunkDecryptor::new(key);

    let mut group = c.benchmark_group("chunk_crypto");
    for size in SIZES {
        let plaintext = vec![0x5Au8; size];
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("encrypt", size), &plaintext, |b, plaintext| {
            b.iter(|| black_box(encryptor.encrypt(plaintext.clone(), source("bench.mp4")).unwrap()))
        });

        let record = encryptor.encrypt(plaintext, source("bench.mp4")).unwrap();
        group.bench_with_input(BenchmarkId::new("decrypt", size), &record, |b, record| {
            b.iter(|| black_box(decryptor.decrypt(record.clone()).unwrap()))
        });
    }
    group.finish();
}

/// Benchmark framing a container with many small chunks
fn bench_container_scan(c: &mut Criterion) {
    let encryptor = ChunkEncryptor::new(Arc::new(KeyMaterial::generate()));
    let mut container = DayHeader::new("2025-06-01", "cam_01").to_bytes().unwrap();
    for i in 0..500 {
        let record = encryptor.encrypt(vec![1u8; 4096], source(&format!("seg{:04}.mp4", i))).unwrap();
        container.extend_from_slice(&record.to_bytes().unwrap());
    }
    let len = container.len() as u64;

    c.bench_function("container_scan_500", |b| {
        b.iter(|| {
            let scan = ContainerReader::new(Cursor::new(&container), len).unwrap().scan();
            black_box(scan.frames.len())
        })
    });
}

/// Benchmark durable appends, including the processed log persist
fn bench_container_append(c: &mut Criterion) {
    let temp_dir = TempDir::new().unwrap();
    let encryptor = ChunkEncryptor::new(Arc::new(KeyMaterial::generate()));
    let mut writer = ContainerWriter::open(
        temp_dir.path().join("enc"),
        "container",
        "cam_01",
        temp_dir.path().join("log.json"),
    )
    .unwrap();
    let mut counter = 0u64;

    c.bench_function("container_append_64k", |b| {
        b.iter(|| {
            counter += 1;
            let record = encryptor
                .encrypt(vec![2u8; 64 * 1024], source(&format!("seg{}.mp4", counter)))
                .unwrap();
            black_box(writer.append("2025-06-01", &record).unwrap())
        })
    });
}

criterion_group!(benches, bench_chunk_crypto, bench_container_scan, bench_container_append);
criterion_main!(benches);
