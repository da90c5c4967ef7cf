//! Performance benchmarks for the transfer checksum
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rendezvous::checksum::{ChecksumEngine, FileChecksum};
use std::fs::File;
use std::io::Write;
use std::ops::ControlFlow;
use tempfile::TempDir;

/// Create a test file of the specified size
fn create_test_file(dir: &std::path::Path, name: &str, size: usize) -> std::path::PathBuf {
    let path = dir.join(name);
    let mut file = File::create(&path).unwrap();

    let chunk_size = 64 * 1024;
    let chunk: Vec<u8> = (0..chunk_size).map(|i| (i % 251) as u8).collect();
    let mut remaining = size;

    while remaining > 0 {
        let to_write = remaining.min(chunk_size);
        file.write_all(&chunk[..to_write]).unwrap();
        remaining -= to_write;
    }

    path
}

fn bench_checksum_buffer(c: &mut Criterion) {
    let mut group = c.benchmark_group("checksum_buffer");

    for size in [4 * 1024, 64 * 1024, 1024 * 1024].iter() {
        let data: Vec<u8> = (0..*size).map(|i| (i % 251) as u8).collect();

        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(humansize::format_size(*size as u64, humansize::BINARY)),
            &data,
            |b, data| b.iter(|| black_box(FileChecksum::calculate(data))),
        );
    }

    group.finish();
}

fn bench_checksum_file(c: &mut Criterion) {
    let mut group = c.benchmark_group("checksum_file");
    let dir = TempDir::new().unwrap();

    for size in [1024 * 1024, 10 * 1024 * 1024].iter() {
        let path = create_test_file(dir.path(), &format!("data_{}.bin", size), *size);

        for buffer_size in [8 * 1024, 64 * 1024, 1024 * 1024].iter() {
            let engine = ChecksumEngine::new(*buffer_size);

            group.throughput(Throughput::Bytes(*size as u64));
            group.bench_with_input(
                BenchmarkId::new(
                    humansize::format_size(*size as u64, humansize::BINARY),
                    format!("buf {}", humansize::format_size(*buffer_size as u64, humansize::BINARY)),
                ),
                &path,
                |b, path| b.iter(|| black_box(engine.checksum_file(path).unwrap())),
            );
        }
    }

    group.finish();
}

fn bench_resumed_checksum(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let size = 8 * 1024 * 1024;
    let path = create_test_file(dir.path(), "resume.bin", size);
    let engine = ChecksumEngine::new(64 * 1024);

    // Prefix state continued over the suffix, as a resumed receiver does
    c.bench_function("checksum_continue_half", |b| {
        let prefix = engine
            .compute(&path, FileChecksum::new(), size as u64 / 2, |_| ControlFlow::Continue(()))
            .unwrap();
        b.iter(|| {
            black_box(
                engine
                    .compute(&path, prefix, size as u64, |_| ControlFlow::Continue(()))
                    .unwrap(),
            )
        });
    });
}

criterion_group!(benches, bench_checksum_buffer, bench_checksum_file, bench_resumed_checksum);
criterion_main!(benches);
