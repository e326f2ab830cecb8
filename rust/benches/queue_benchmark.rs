use barrierqueue::config::{ProducerGate, RunConfig};
use barrierqueue::eventlog::NullSink;
use barrierqueue::harness::RunHarness;
use barrierqueue::ringbuffer::RingBuffer;
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use std::sync::Arc;

/// Fill to `depth` then drain, repeatedly. Each cycle walks the full
/// grow/shrink ladder from the initial capacity.
fn bench_fill_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_buffer_fill_drain");
    for depth in [16usize, 256, 4096] {
        for initial in [1usize, depth] {
            group.bench_with_input(
                BenchmarkId::new(format!("initial_{initial}"), depth),
                &depth,
                |b, &depth| {
                    b.iter(|| {
                        let mut rb = RingBuffer::with_capacity(initial).unwrap();
                        for i in 0..depth as u64 {
                            rb.push(black_box(i)).unwrap();
                        }
                        while let Ok((item, _)) = rb.pop() {
                            black_box(item);
                        }
                    })
                },
            );
        }
    }
    group.finish();
}

/// Steady-state churn around a fixed occupancy, where no resize should occur.
fn bench_steady_churn(c: &mut Criterion) {
    c.bench_function("ring_buffer_steady_churn", |b| {
        let mut rb = RingBuffer::with_capacity(64).unwrap();
        for i in 0..32u64 {
            rb.push(i).unwrap();
        }
        let mut next = 32u64;
        b.iter(|| {
            rb.push(black_box(next)).unwrap();
            next += 1;
            black_box(rb.pop().unwrap());
        })
    });
}

/// A whole harness run where every producer is matched by a consumer, so no
/// unit ever sits out the abandonment timeout.
fn bench_balanced_run(c: &mut Criterion) {
    let mut group = c.benchmark_group("harness_balanced_run");
    group.sample_size(10);
    for units in [4usize, 16] {
        group.bench_with_input(BenchmarkId::from_parameter(units), &units, |b, &units| {
            let harness = RunHarness::new(RunConfig {
                producers: units,
                consumers: units,
                initial_capacity: 2,
                abandon_timeout_ms: 1_000,
                producer_gate: ProducerGate::Barrier,
                ..RunConfig::default()
            })
            .unwrap();
            b.iter(|| black_box(harness.run(Arc::new(NullSink)).unwrap()))
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_fill_drain,
    bench_steady_churn,
    bench_balanced_run
);
criterion_main!(benches);
