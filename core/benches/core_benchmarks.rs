use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};

use ember_core::arena::Arena;
use ember_core::ring_queue::RingQueue;

// ---------------------------------------------------------------------------
// Ring queue
// ---------------------------------------------------------------------------

fn bench_ring_queue_push_pop(c: &mut Criterion) {
    c.bench_function("ring_queue_push_pop_512", |b| {
        let mut queue = RingQueue::<u64, 512>::new();
        b.iter(|| {
            for i in 0..511u64 {
                let _ = queue.push(black_box(i));
            }
            while let Some(value) = queue.pop() {
                black_box(value);
            }
        });
    });
}

fn bench_ring_queue_split_burst(c: &mut Criterion) {
    c.bench_function("ring_queue_split_burst_16", |b| {
        let (mut producer, mut consumer) = RingQueue::<u64, 512>::new().split();
        b.iter(|| {
            for i in 0..16u64 {
                let _ = producer.push(black_box(i));
            }
            let mut drained = 0;
            while drained < 16 && consumer.pop().is_some() {
                drained += 1;
            }
            black_box(drained);
        });
    });
}

// ---------------------------------------------------------------------------
// Arena
// ---------------------------------------------------------------------------

fn bench_arena_insert_lookup(c: &mut Criterion) {
    c.bench_function("arena_insert_lookup_1000", |b| {
        b.iter(|| {
            let mut arena = Arena::new();
            let handles: Vec<_> = (0..1000u32)
                .map(|i| arena.insert(format!("res{i}"), i))
                .collect();
            let mut sum = 0u64;
            for handle in handles {
                sum += u64::from(*arena.get(handle).unwrap_or(&0));
            }
            black_box(sum)
        });
    });
}

criterion_group!(
    benches,
    bench_ring_queue_push_pop,
    bench_ring_queue_split_burst,
    bench_arena_insert_lookup
);
criterion_main!(benches);
