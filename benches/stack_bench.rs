// benches/stack_bench.rs

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use parking_lot::Mutex;
use rand::prelude::*;
use std::sync::Barrier;
use std::thread;

use lfstack::{EpochManager, HazardPointers, Reclaim, RefCount, Stack};

const OPS_PER_THREAD: usize = 10_000;

// Single-threaded push/pop pairs for one reclamation scheme
fn bench_scheme<R: Reclaim>(c: &mut Criterion, name: &str, reclaim: R) {
    let mut group = c.benchmark_group(format!("Stack-SingleThreaded/{name}"));
    let stack = Stack::new_with_reclamation(reclaim);

    group.bench_function("push_pop", |b| {
        let mut i: u64 = 0;
        b.iter(|| {
            i = i.wrapping_add(1);
            stack.push(black_box(i));
            black_box(stack.pop())
        });
    });

    // Pop from a deep stack
    group.bench_function("pop", |b| {
        b.iter_batched(
            || {
                for i in 0..1000u64 {
                    stack.push(i);
                }
            },
            |_| {
                while let Some(value) = stack.pop() {
                    black_box(value);
                }
            },
            criterion::BatchSize::SmallInput,
        );
    });

    group.finish();
}

fn bench_single_threaded(c: &mut Criterion) {
    bench_scheme(c, "epoch", EpochManager::new());
    bench_scheme(c, "hazard_pointers", HazardPointers::new());
    bench_scheme(c, "ref_count", RefCount::new());
}

// Random 50/50 mix on a shared stack
fn run_mixed<R: Reclaim>(stack: &Stack<u64, R>, num_threads: usize) {
    let barrier = Barrier::new(num_threads);

    thread::scope(|scope| {
        for thread_id in 0..num_threads {
            let barrier = &barrier;
            scope.spawn(move || {
                let mut rng = rand::rng();
                barrier.wait();

                for i in 0..OPS_PER_THREAD {
                    if rng.random::<bool>() {
                        stack.push((thread_id * OPS_PER_THREAD + i) as u64);
                    } else {
                        black_box(stack.pop());
                    }
                }
            });
        }
    });
}

// Same mix against a locked Vec
fn run_mutex_baseline(stack: &Mutex<Vec<u64>>, num_threads: usize) {
    let barrier = Barrier::new(num_threads);

    thread::scope(|scope| {
        for thread_id in 0..num_threads {
            let barrier = &barrier;
            scope.spawn(move || {
                let mut rng = rand::rng();
                barrier.wait();

                for i in 0..OPS_PER_THREAD {
                    if rng.random::<bool>() {
                        stack.lock().push((thread_id * OPS_PER_THREAD + i) as u64);
                    } else {
                        black_box(stack.lock().pop());
                    }
                }
            });
        }
    });
}

// Multi-threaded benchmark comparison
fn bench_multi_threaded(c: &mut Criterion) {
    let mut group = c.benchmark_group("Stack-MultiThreaded");

    // Test with different thread counts
    for thread_count in [1, 2, 4, 8].iter() {
        group.bench_with_input(
            BenchmarkId::new("epoch", thread_count),
            thread_count,
            |b, &num_threads| {
                let stack = Stack::new();
                b.iter(|| run_mixed(&stack, num_threads));
            },
        );

        group.bench_with_input(
            BenchmarkId::new("hazard_pointers", thread_count),
            thread_count,
            |b, &num_threads| {
                let stack = Stack::new_with_reclamation(HazardPointers::new());
                b.iter(|| run_mixed(&stack, num_threads));
            },
        );

        group.bench_with_input(
            BenchmarkId::new("ref_count", thread_count),
            thread_count,
            |b, &num_threads| {
                let stack = Stack::new_with_reclamation(RefCount::new());
                b.iter(|| run_mixed(&stack, num_threads));
            },
        );

        group.bench_with_input(
            BenchmarkId::new("mutex_vec", thread_count),
            thread_count,
            |b, &num_threads| {
                let stack = Mutex::new(Vec::new());
                b.iter(|| run_mutex_baseline(&stack, num_threads));
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_single_threaded, bench_multi_threaded);
criterion_main!(benches);
