//! Launch benchmark suite.
//!
//! Benchmarks full launches against the in-memory transport:
//! - Launch to ready, then stop, on a single slot
//! - Queued bursts served by pools of 1 and 4 slots
//!
//! Run with: cargo bench --bench launch --features test-support
//! Results saved to: target/criterion/

use std::hint::black_box;
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use tokio::runtime::Runtime;
use worker_launcher::transport::MemorySpawner;
use worker_launcher::{LaunchOptions, Launcher};

// ============================================================================
// Benchmark Parameters
// ============================================================================

const POOL_SIZES: &[usize] = &[1, 4];
const BURST: usize = 16;

fn launcher(capacity: usize) -> Launcher {
    Launcher::builder()
        .spawner(MemorySpawner::new())
        .capacity(capacity)
        .free_delay(Duration::ZERO)
        .build()
        .expect("launcher")
}

// ============================================================================
// Benchmark: Launch / Stop Cycle
// ============================================================================

fn bench_launch_stop(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");
    let launcher = rt.block_on(async { launcher(1) });

    c.bench_function("launch_ready_stop", |b| {
        b.to_async(&rt).iter(|| async {
            let handle = launcher
                .launch(LaunchOptions::new(["--type=bench"]))
                .await
                .expect("launch");
            black_box(handle.wait_ready().await.expect("ready"));
            handle.stop().await.expect("stop");
        });
    });

    rt.block_on(async { launcher.shutdown().await.expect("shutdown") });
}

// ============================================================================
// Benchmark: Queued Burst
// ============================================================================

fn bench_queued_burst(c: &mut Criterion) {
    let rt = Runtime::new().expect("tokio runtime");
    let mut group = c.benchmark_group("queued_burst");

    for &size in POOL_SIZES {
        let launcher = rt.block_on(async { launcher(size) });

        group.bench_with_input(BenchmarkId::new("slots", size), &size, |b, _| {
            b.to_async(&rt).iter(|| async {
                let mut handles = Vec::with_capacity(BURST);
                for _ in 0..BURST {
                    let options = LaunchOptions::new(["--type=bench"]).queue_if_no_free_connection();
                    handles.push(launcher.launch(options).await.expect("launch"));
                }
                // Stopping each ready launch frees its slot for the next queued one.
                for handle in handles {
                    black_box(handle.wait_ready().await.expect("ready"));
                    handle.stop().await.expect("stop");
                }
            });
        });

        rt.block_on(async { launcher.shutdown().await.expect("shutdown") });
    }

    group.finish();
}

criterion_group!(benches, bench_launch_stop, bench_queued_burst);
criterion_main!(benches);
