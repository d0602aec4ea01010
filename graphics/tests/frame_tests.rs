//! End-to-end frame loop tests on the dummy backend.
//!
//! These drive [`Renderer::render_frame`] through resizes, stale presents,
//! deferred releases and queued image uploads, then check what the backend
//! observed.
//!
//! ```bash
//! cargo test -p ember-graphics --test frame_tests
//! ```

mod common;

use glam::{Mat4, Vec3, Vec4};
use rstest::rstest;

use common::TestContext;
use ember_graphics::backend::dummy::BackendEvent;
use ember_graphics::backend::QueueKind;
use ember_graphics::resources::DrawInfo;
use ember_graphics::transition::TRANSITION_QUEUE_SLOTS;
use ember_graphics::{
    EmitterJob, Extent2d, FrameOutcome, ImageData, ImageFormat, RendererConfig, StaticRenderJob,
};

// ============================================================================
// Steady state
// ============================================================================

#[rstest]
#[case::single(1)]
#[case::both_slots(2)]
#[case::many(12)]
fn test_frames_never_touch_in_flight_memory(#[case] frames: u64) {
    let mut ctx = TestContext::new();
    let mesh = ctx.load_quad("quad");
    let material = ctx.solid_material("red", [255, 0, 0, 255]);

    for frame in 0..frames {
        let angle = frame as f32 * 0.1;
        let jobs = ctx.renderer.jobs();
        jobs.add_static(StaticRenderJob::new(mesh, material, Mat4::from_rotation_y(angle)));
        jobs.add_static(
            StaticRenderJob::new(mesh, material, Mat4::from_translation(Vec3::X))
                .with_color(Vec4::new(0.5, 1.0, 0.5, 1.0)),
        );
        jobs.add_emitter(EmitterJob::new(Vec3::ZERO, Vec3::Y, 8));
        jobs.delta_time = 1.0 / 60.0;
        assert_eq!(ctx.render(), FrameOutcome::Presented);
    }

    assert_eq!(ctx.renderer.frame_index(), frames);
    assert!(ctx.backend.hazards().is_empty(), "{:?}", ctx.backend.hazards());
    ctx.finish();
}

#[test]
fn test_each_frame_submits_compute_before_graphics() {
    let mut ctx = TestContext::new();
    ctx.backend.clear_events();
    ctx.render();

    let submits: Vec<QueueKind> = ctx
        .backend
        .events()
        .into_iter()
        .filter_map(|event| match event {
            BackendEvent::Submit { queue } => Some(queue),
            _ => None,
        })
        .collect();
    assert_eq!(submits, vec![QueueKind::Compute, QueueKind::Graphics]);

    let submissions = ctx.backend.submissions();
    let (compute, graphics) = match submissions.as_slice() {
        [.., compute, graphics] => (compute, graphics),
        other => panic!("expected two submissions, got {}", other.len()),
    };
    assert_eq!(compute.queue, QueueKind::Compute);
    assert!(
        graphics
            .waits
            .iter()
            .any(|wait| compute.signals.contains(&wait.semaphore)),
        "graphics must wait for this frame's compute work"
    );
    ctx.finish();
}

#[test]
fn test_jobs_are_cleared_after_each_frame() {
    let mut ctx = TestContext::new();
    let mesh = ctx.load_quad("quad");
    let material = ctx.solid_material("white", [255; 4]);
    ctx.renderer
        .jobs()
        .add_static(StaticRenderJob::new(mesh, material, Mat4::IDENTITY));
    ctx.render();
    assert!(ctx.renderer.jobs().is_empty());
    ctx.finish();
}

// ============================================================================
// Surface changes
// ============================================================================

#[test]
fn test_stale_acquire_recreates_and_next_frame_uses_new_extent() {
    let mut ctx = TestContext::new();
    ctx.render();
    let before = ctx.renderer.frame_index();

    let resized = Extent2d::new(800, 600);
    ctx.backend.set_surface_extent(resized);
    ctx.backend.clear_events();

    assert_eq!(ctx.render(), FrameOutcome::SwapchainRecreated);
    assert_eq!(ctx.renderer.frame_index(), before, "an abandoned frame does not advance");
    let events = ctx.backend.events();
    assert!(events.contains(&BackendEvent::AcquireOutdated));
    assert!(events.contains(&BackendEvent::Recreate { extent: resized }));
    assert!(
        !events
            .iter()
            .any(|event| matches!(event, BackendEvent::Submit { .. })),
        "nothing is submitted for an abandoned frame"
    );

    assert_eq!(ctx.render(), FrameOutcome::Presented);
    assert_eq!(ctx.renderer.swapchain().extent, resized);
    assert_eq!(ctx.renderer.frame_index(), before + 1);
    ctx.finish();
}

#[test]
fn test_stale_present_still_advances_the_frame() {
    let mut ctx = TestContext::new();
    ctx.render();
    ctx.backend.fail_next_present();
    ctx.backend.clear_events();

    assert_eq!(ctx.render(), FrameOutcome::PresentedThenRecreated);
    assert_eq!(ctx.renderer.frame_index(), 2);
    let events = ctx.backend.events();
    let outdated = events
        .iter()
        .position(|event| *event == BackendEvent::PresentOutdated)
        .expect("present reported outdated");
    let recreated = events
        .iter()
        .position(|event| matches!(event, BackendEvent::Recreate { .. }))
        .expect("swapchain recreated");
    assert!(outdated < recreated);

    assert_eq!(ctx.render(), FrameOutcome::Presented);
    ctx.finish();
}

#[test]
fn test_minimised_surface_skips_without_submitting() {
    let mut ctx = TestContext::new();
    ctx.backend.set_surface_extent(Extent2d::new(0, 0));
    ctx.backend.clear_events();

    for _ in 0..3 {
        assert_eq!(ctx.render(), FrameOutcome::Skipped);
    }
    assert_eq!(ctx.renderer.frame_index(), 0);
    assert!(ctx.backend.events().is_empty());

    let restored = Extent2d::new(1024, 768);
    ctx.backend.set_surface_extent(restored);
    assert_eq!(ctx.render(), FrameOutcome::SwapchainRecreated);
    assert_eq!(ctx.render(), FrameOutcome::Presented);
    assert_eq!(ctx.renderer.swapchain().extent, restored);
    ctx.finish();
}

// ============================================================================
// Deferred release
// ============================================================================

#[test]
fn test_released_mesh_outlives_the_frames_that_drew_it() {
    let mut ctx = TestContext::new();
    let mesh = ctx.load_quad("doomed");
    let material = ctx.solid_material("blue", [0, 0, 255, 255]);
    let info = ctx.renderer.pool().get_mesh(mesh).draw_info();

    ctx.renderer
        .jobs()
        .add_static(StaticRenderJob::new(mesh, material, Mat4::IDENTITY));
    ctx.render();

    assert!(ctx.renderer.pool_mut().release_mesh(mesh));
    assert!(ctx.renderer.pool().try_get_mesh(mesh).is_none());
    assert_eq!(ctx.renderer.pool().pending_deletions(), 2);

    let destroyed = |ctx: &TestContext| {
        let buffers = ctx.backend.destroyed_buffers();
        [info.vertex_buffer, info.index_buffer]
            .iter()
            .map(|buffer| buffers.iter().filter(|b| *b == buffer).count())
            .collect::<Vec<_>>()
    };

    ctx.render();
    assert_eq!(destroyed(&ctx), vec![0, 0], "released one frame ago");

    ctx.render();
    assert_eq!(destroyed(&ctx), vec![1, 1]);
    assert_eq!(ctx.renderer.pool().pending_deletions(), 0);

    for _ in 0..3 {
        ctx.render();
    }
    assert_eq!(destroyed(&ctx), vec![1, 1], "destroyed exactly once");
    assert!(ctx.backend.hazards().is_empty(), "{:?}", ctx.backend.hazards());
    ctx.finish();
}

#[test]
fn test_double_release_is_rejected() {
    let mut ctx = TestContext::new();
    let mesh = ctx.load_quad("once");
    assert!(ctx.renderer.pool_mut().release_mesh(mesh));
    assert!(!ctx.renderer.pool_mut().release_mesh(mesh));
    assert_eq!(ctx.renderer.pool().pending_deletions(), 2);
    ctx.finish();
}

// ============================================================================
// Image uploads
// ============================================================================

#[test]
fn test_uploaded_images_are_acquired_within_the_frame_cap() {
    let mut config = RendererConfig::default();
    config.frame.max_transitions_per_frame = 1;
    let mut ctx = TestContext::with_config(config);
    assert_eq!(ctx.renderer.scheduler().pending_transitions(), 0);

    for (i, color) in [[255, 0, 0, 255], [0, 255, 0, 255], [0, 0, 255, 255]]
        .into_iter()
        .enumerate()
    {
        ctx.solid_material(&format!("layer{i}"), color);
    }
    assert_eq!(ctx.renderer.scheduler().pending_transitions(), 3);

    for remaining in [2, 1, 0, 0] {
        ctx.render();
        assert_eq!(ctx.renderer.scheduler().pending_transitions(), remaining);
    }
    assert!(ctx.backend.hazards().is_empty(), "{:?}", ctx.backend.hazards());
    ctx.finish();
}

#[test]
fn test_bulk_load_before_first_frame_overflows_the_transition_queue() {
    let mut ctx = TestContext::new();
    let count = TRANSITION_QUEUE_SLOTS + 8;
    for i in 0..count {
        let shade = (i % 256) as u8;
        ctx.renderer
            .load_image(
                &format!("tile{i}"),
                &ImageData::solid([shade, shade, shade, 255], ImageFormat::Rgba8Srgb),
            )
            .expect("upload past a full transition queue");
    }
    assert_eq!(
        ctx.renderer.scheduler().pending_transitions(),
        count - (TRANSITION_QUEUE_SLOTS - 1)
    );

    assert_eq!(ctx.render(), FrameOutcome::Presented);
    assert!(ctx.backend.hazards().is_empty(), "{:?}", ctx.backend.hazards());
    ctx.finish();
}

#[test]
fn test_shutdown_with_queued_uploads_releases_everything() {
    let mut ctx = TestContext::new();
    ctx.solid_material("late", [9, 9, 9, 255]);
    assert_eq!(ctx.renderer.scheduler().pending_transitions(), 1);
    ctx.finish();
}
