//! Throughput benchmarks for the signal tree and the contract pipeline.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use entropy_core::{ContractGroup, ExecutionType, SignalTree};

fn signal_tree_set_select(c: &mut Criterion) {
    let tree = SignalTree::new(1024);

    c.bench_function("signal_tree_set_clear", |b| {
        b.iter(|| {
            for i in 0..1024u32 {
                tree.set(black_box(i));
            }
            for i in 0..1024u32 {
                tree.clear(black_box(i));
            }
        })
    });

    c.bench_function("signal_tree_set_select_drain", |b| {
        b.iter(|| {
            for i in 0..1024u32 {
                tree.set(i);
            }
            let mut bias = 0u64;
            for _ in 0..1024 {
                black_box(tree.select(bias));
                bias = bias.rotate_left(1);
            }
        })
    });
}

fn contract_create_schedule_execute(c: &mut Criterion) {
    let group = ContractGroup::new(256, "bench");
    let counter = Arc::new(AtomicUsize::new(0));

    c.bench_function("contract_round_trip_256", |b| {
        b.iter(|| {
            for _ in 0..256 {
                let ctr = Arc::clone(&counter);
                let handle = group.create_contract(
                    Box::new(move || {
                        ctr.fetch_add(1, Ordering::Relaxed);
                    }),
                    ExecutionType::AnyThread,
                );
                handle.schedule();
            }
            group.execute_all_background_work();
        })
    });
}

fn contract_slot_reuse(c: &mut Criterion) {
    // Single-slot group: every iteration recycles the same slot, stressing
    // the free-list CAS and generation bump paths.
    let group = ContractGroup::new(1, "bench-reuse");

    c.bench_function("single_slot_recycle", |b| {
        b.iter(|| {
            let handle = group.create_contract(Box::new(|| {}), ExecutionType::AnyThread);
            handle.schedule();
            group.execute_all_background_work();
        })
    });
}

criterion_group!(
    benches,
    signal_tree_set_select,
    contract_create_schedule_execute,
    contract_slot_reuse
);
criterion_main!(benches);
