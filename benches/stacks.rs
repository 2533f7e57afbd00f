use reclaim_stack::{HazardStack, RefCountStack, Registry, SplitCountStack};

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::{Arc, Barrier};
use std::time::Instant;

// Each thread pushes and then pops one value per iteration against a shared stack.
macro_rules! churn_bench {
    ($name:ident, $new:expr, |$stack:ident| $iter:block) => {
        pub fn $name(c: &mut Criterion) {
            let mut group = c.benchmark_group(stringify!($name));
            for nthreads in [1, 2, 4, 8] {
                group.bench_with_input(
                    BenchmarkId::from_parameter(nthreads),
                    &nthreads,
                    |b, &nthreads| {
                        b.iter_custom(|niters| {
                            let stack = Arc::new($new);
                            let barrier = Arc::new(Barrier::new(nthreads + 1));
                            let threads: Vec<_> = (0..nthreads)
                                .map(|_tid| {
                                    let barrier = Arc::clone(&barrier);
                                    let $stack = Arc::clone(&stack);
                                    std::thread::spawn(move || {
                                        barrier.wait();
                                        barrier.wait();
                                        for _ in 0..(niters / nthreads as u64) {
                                            $iter
                                        }
                                    })
                                })
                                .collect();
                            barrier.wait();
                            let start = Instant::now();
                            barrier.wait();
                            for thread in threads {
                                thread.join().unwrap();
                            }
                            let elapsed = start.elapsed();
                            Registry::global().cleanup();
                            elapsed
                        })
                    },
                );
            }
        }
    };
}

churn_bench!(refcount_churn, RefCountStack::new(), |stack| {
    stack.push(black_box(1u64));
    black_box(stack.pop());
});
churn_bench!(hazard_churn, HazardStack::new(), |stack| {
    stack.push(black_box(1u64));
    black_box(stack.pop().unwrap());
});
churn_bench!(split_churn, SplitCountStack::new(), |stack| {
    stack.push(black_box(1u64));
    black_box(stack.pop());
});

criterion_group!(benches, refcount_churn, hazard_churn, split_churn);
criterion_main!(benches);
