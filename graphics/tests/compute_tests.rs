//! Compute stage tests: the host model of the depth sort and particle
//! kernels, and the compute submission the renderer records.

mod common;

use glam::{Mat4, Vec3};
use rstest::rstest;

use common::TestContext;
use ember_graphics::EmitterJob;
use ember_graphics::backend::QueueKind;
use ember_graphics::command::Command;
use ember_graphics::compute::particles::pcg_hash;
use ember_graphics::compute::{BitonicSchedule, ParticleSimulation, prepare_emitters, sort_host};
use ember_graphics::config::ParticleConfig;

fn pseudo_random_keys(count: u32, seed: u32) -> Vec<f32> {
    (0..count)
        .map(|i| (pcg_hash(seed ^ i.wrapping_mul(0x9e37_79b9)) % 10_000) as f32 * 0.01 - 50.0)
        .collect()
}

fn is_descending(keys: &[f32]) -> bool {
    keys.windows(2).all(|pair| pair[0] >= pair[1])
}

// ============================================================================
// Depth sort
// ============================================================================

#[rstest]
#[case::pair(2, 1)]
#[case::one_window(16, 8)]
#[case::several_windows(64, 4)]
#[case::default_workgroup(1024, 256)]
#[case::large(16_384, 256)]
fn test_bitonic_sort_matches_std_sort(#[case] count: u32, #[case] workgroup: u32) {
    let schedule = BitonicSchedule::new(count, workgroup);
    let mut keys = pseudo_random_keys(count, count);
    let mut expected = keys.clone();
    expected.sort_by(|a, b| b.total_cmp(a));

    sort_host(&mut keys, &schedule);
    assert!(is_descending(&keys));
    assert_eq!(keys, expected);

    assert_eq!(sort_host(&mut keys, &schedule), 0, "sorted input must not change");
}

#[rstest]
#[case(256, 256)]
#[case(4096, 64)]
fn test_bitonic_sort_keeps_every_key(#[case] count: u32, #[case] workgroup: u32) {
    let schedule = BitonicSchedule::new(count, workgroup);
    let mut keys: Vec<f32> = (0..count).map(|i| (i % 7) as f32).collect();
    let before: f32 = keys.iter().sum();
    sort_host(&mut keys, &schedule);
    let after: f32 = keys.iter().sum();
    assert_eq!(before, after);
    assert!(is_descending(&keys));
}

// ============================================================================
// Particles
// ============================================================================

#[rstest]
#[case::roomy(1024, 4)]
#[case::saturated(64, 40)]
fn test_simulation_stays_within_capacity_and_sorts_live_first(
    #[case] capacity: u32,
    #[case] spawn_per_emitter: u32,
) {
    let config = ParticleConfig {
        max_particles: capacity,
        ..ParticleConfig::default()
    };
    let view = Mat4::look_at_rh(Vec3::new(0.0, 2.0, 8.0), Vec3::ZERO, Vec3::Y);
    let jobs = [
        EmitterJob::new(Vec3::ZERO, Vec3::Y, spawn_per_emitter),
        EmitterJob::new(Vec3::X, Vec3::new(0.0, 1.0, 1.0), spawn_per_emitter),
        EmitterJob::new(-Vec3::X, Vec3::Z, spawn_per_emitter),
    ];
    let schedule = BitonicSchedule::new(capacity, config.sort_workgroup_size.min(capacity / 2));
    let mut simulation = ParticleSimulation::new(capacity);

    for frame in 0..120 {
        let emitters = prepare_emitters(&jobs, frame, &config);
        let requested: u32 = emitters.iter().map(|e| e.spawn_count).sum();
        assert!(requested <= capacity);

        simulation.step(1.0 / 30.0, &view, &emitters);
        let live = simulation.live() as usize;
        assert!(live <= capacity as usize);

        let mut keys = simulation.sort_keys();
        sort_host(&mut keys, &schedule);
        assert!(keys[..live].iter().all(|k| k.is_finite()));
        assert!(keys[live..].iter().all(|k| *k == f32::NEG_INFINITY));
        assert!(is_descending(&keys));
    }
}

#[test]
fn test_emitters_over_the_limit_are_dropped() {
    let config = ParticleConfig::default();
    let jobs: Vec<EmitterJob> = (0..config.max_emitters + 10)
        .map(|i| EmitterJob::new(Vec3::splat(i as f32), Vec3::Y, 1))
        .collect();
    let emitters = prepare_emitters(&jobs, 3, &config);
    assert_eq!(emitters.len(), config.max_emitters as usize);
}

// ============================================================================
// Recorded compute work
// ============================================================================

#[test]
fn test_compute_submission_ends_with_sort_and_count_copy() {
    let mut ctx = TestContext::new();
    ctx.renderer
        .jobs()
        .add_emitter(EmitterJob::new(Vec3::ZERO, Vec3::Y, 32));
    ctx.render();

    let steps = ctx.renderer.compute().sort_schedule().steps().len();
    let submissions = ctx.backend.submissions();
    let compute = submissions
        .iter()
        .rev()
        .find(|s| s.queue == QueueKind::Compute)
        .expect("a compute submission");
    let commands = compute.commands.commands();

    let sort_start = commands
        .iter()
        .rposition(|c| matches!(c, Command::BindPipeline(_)))
        .expect("the sort binds its pipeline last");
    let sort_dispatches = commands[sort_start..]
        .iter()
        .filter(|c| matches!(c, Command::Dispatch { .. }))
        .count();
    assert_eq!(sort_dispatches, steps);
    assert!(matches!(commands.last(), Some(Command::CopyBuffer { .. })));
    ctx.finish();
}

#[rstest]
#[case::few(3, 16)]
#[case::over_limits(100, 1_000)]
fn test_heavy_emission_renders_cleanly(#[case] emitters: u32, #[case] spawn_count: u32) {
    let mut ctx = TestContext::new();
    for _ in 0..4 {
        for i in 0..emitters {
            ctx.renderer.jobs().add_emitter(EmitterJob::new(
                Vec3::new(i as f32, 0.0, 0.0),
                Vec3::Y,
                spawn_count,
            ));
        }
        ctx.renderer.jobs().delta_time = 0.016;
        ctx.render();
    }
    assert!(ctx.backend.hazards().is_empty(), "{:?}", ctx.backend.hazards());
    ctx.finish();
}
