//! Throughput benchmarks for the molt reclamation core

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use molt::{drop_boxed, finalize, flush_finalizers, CsGuard, FinNode};

#[repr(C)]
struct Node {
    fin: FinNode,
    value: usize,
}

impl Node {
    fn new(value: usize) -> *mut FinNode {
        Box::into_raw(Box::new(Self {
            fin: FinNode::new(drop_boxed::<Self>),
            value,
        })) as *mut FinNode
    }
}

fn bench_enter_exit(c: &mut Criterion) {
    let mut group = c.benchmark_group("enter_exit");

    group.bench_function("single_thread", |b| {
        b.iter(|| {
            let _guard = CsGuard::new();
            black_box(&_guard);
        });
    });

    group.finish();
}

fn bench_finalize(c: &mut Criterion) {
    let mut group = c.benchmark_group("finalize");

    for batch_size in [10, 50, 100, 500].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            batch_size,
            |b, &size| {
                b.iter(|| {
                    for i in 0..size {
                        unsafe { finalize(Node::new(i)) };
                    }
                    flush_finalizers();
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_enter_exit, bench_finalize);
criterion_main!(benches);
