use std::hint::black_box;
use std::sync::Arc;

use criterion::{BatchSize, BenchmarkId, Criterion, criterion_group, criterion_main};
use glam::Mat4;

use ember_core::Handle;
use ember_graphics::compute::particles::pcg_hash;
use ember_graphics::compute::{BitonicSchedule, sort_host};
use ember_graphics::graph::BatchBuilder;
use ember_graphics::shader::MemoryShaderSource;
use ember_graphics::{DummyBackend, Renderer, RendererConfig, StaticRenderJob};

// ---------------------------------------------------------------------------
// Depth sort
// ---------------------------------------------------------------------------

fn bench_bitonic_sort_host(c: &mut Criterion) {
    let mut group = c.benchmark_group("bitonic_sort_host");
    for count in [1024u32, 16_384] {
        let schedule = BitonicSchedule::new(count, 256);
        let keys: Vec<f32> = (0..count).map(|i| pcg_hash(i) as f32).collect();
        group.bench_with_input(BenchmarkId::from_parameter(count), &keys, |b, keys| {
            b.iter_batched(
                || keys.clone(),
                |mut keys| black_box(sort_host(&mut keys, &schedule)),
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Batching
// ---------------------------------------------------------------------------

fn static_jobs(count: u64, meshes: u64, materials: u64) -> Vec<StaticRenderJob> {
    (0..count)
        .map(|i| {
            let job = StaticRenderJob::new(
                Handle::from_raw(i % meshes + 1),
                Handle::from_raw(i % materials + 1),
                Mat4::from_translation(glam::Vec3::splat(i as f32)),
            );
            if i % 3 == 0 { job.without_shadows() } else { job }
        })
        .collect()
}

fn bench_batch_builder(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_builder");
    for (meshes, materials) in [(1, 1), (16, 8), (256, 64)] {
        let jobs = static_jobs(10_000, meshes, materials);
        group.bench_with_input(
            BenchmarkId::new("10000_jobs", format!("{meshes}x{materials}")),
            &jobs,
            |b, jobs| b.iter(|| black_box(BatchBuilder::build(jobs, 16_384, "static"))),
        );
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Frame loop
// ---------------------------------------------------------------------------

fn bench_empty_frame(c: &mut Criterion) {
    let backend = Arc::new(DummyBackend::new());
    let mut renderer = match Renderer::new(
        backend.clone(),
        &MemoryShaderSource::with_fallback(),
        RendererConfig::default(),
    ) {
        Ok(renderer) => renderer,
        Err(e) => panic!("renderer on the dummy backend: {e}"),
    };

    c.bench_function("dummy_backend_empty_frame", |b| {
        b.iter(|| {
            backend.clear_events();
            black_box(renderer.render_frame(&*backend))
        });
    });

    let _ = renderer.shutdown();
}

criterion_group!(
    benches,
    bench_bitonic_sort_host,
    bench_batch_builder,
    bench_empty_frame
);
criterion_main!(benches);
