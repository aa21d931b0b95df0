use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use forkjoin::{start_sync, wait_tasks, Task, ThreadPool};

fn fib_task(n: u64) -> Task<u64> {
    Task::new(async move {
        if n < 2 {
            return n;
        }
        let a = fib_task(n - 1);
        let b = fib_task(n - 2);
        wait_tasks((&a, &b)).await;
        *a + *b
    })
}

#[inline(never)]
fn fib_sequential(n: u64) -> u64 {
    if n < 2 {
        return n;
    }
    fib_sequential(n - 1) + fib_sequential(n - 2)
}

fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("fib(20)");

    for threads in [1, 2, 4] {
        let pool = ThreadPool::new(threads);
        group.bench_function(BenchmarkId::new("pool", threads), |b| {
            b.iter(|| {
                let task = fib_task(black_box(20));
                start_sync(&pool, &task);
                *task
            })
        });
    }

    group.bench_function("sequential", |b| {
        b.iter(|| fib_sequential(black_box(20)))
    });

    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
