use std::time::Duration;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use tempfile::tempdir;

use coupler::config::CodeTopology;
use coupler::core::WaitStrategy;
use coupler::lock::{CriticalSection, LocalFs, LockOptions, Role, SentinelPaths};
use coupler::SingleProcess;

fn bench_lock_cycle(c: &mut Criterion) {
    let dir = tempdir().expect("tempdir");
    let filename = dir.path().join("bench.bp");
    let options = LockOptions {
        strategy: WaitStrategy::BusySpin,
        timeout: Some(Duration::from_secs(5)),
        ..LockOptions::default()
    };

    let mut group = c.benchmark_group("lock_cycle");
    for &readers in &[1_usize, 4, 16] {
        let codes: Vec<String> = (0..readers).map(|i| format!("r{i}")).collect();
        let paths = SentinelPaths::derive(&filename, &CodeTopology::new("r0", codes));
        let section = CriticalSection::new(&LocalFs, &SingleProcess, &paths, &options);
        group.bench_with_input(BenchmarkId::new("writer", readers), &readers, |b, _| {
            b.iter(|| {
                section.acquire(Role::Writer).expect("acquire");
                section.release(Role::Writer).expect("release");
            });
        });
        group.bench_with_input(BenchmarkId::new("reader", readers), &readers, |b, _| {
            b.iter(|| {
                section.acquire(Role::Reader).expect("acquire");
                section.release(Role::Reader).expect("release");
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_lock_cycle);
criterion_main!(benches);
