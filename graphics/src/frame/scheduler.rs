//! The per-frame state machine.

use std::sync::Arc;
use std::time::Duration;

use ember_core::profiling::{frame_mark, profile_function, profile_scope};

use crate::backend::{
    FenceHandle, GpuBackend, QueueKind, SemaphoreWait, Submission, SwapchainInfo,
};
use crate::command::{CommandList, PipelineStages};
use crate::config::{FRAME_OVERLAP, FrameConfig, RendererConfig};
use crate::error::{GraphicsError, GraphicsResult};
use crate::renderer::DrawableSurface;
use crate::transition::{ImageTransition, TransitionReceiver};

use super::slot::FrameSlot;

/// Where the scheduler is within a frame.
///
/// ```text
/// Idle → AcquireImage → RecordCompute → RecordGraphics → Submit → Present → Idle
/// ```
///
/// Any state may fall back to `Idle` when the frame is abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    AcquireImage,
    RecordCompute,
    RecordGraphics,
    Submit,
    Present,
}

impl FrameState {
    fn successor(self) -> FrameState {
        match self {
            Self::Idle => Self::AcquireImage,
            Self::AcquireImage => Self::RecordCompute,
            Self::RecordCompute => Self::RecordGraphics,
            Self::RecordGraphics => Self::Submit,
            Self::Submit => Self::Present,
            Self::Present => Self::Idle,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::AcquireImage => "AcquireImage",
            Self::RecordCompute => "RecordCompute",
            Self::RecordGraphics => "RecordGraphics",
            Self::Submit => "Submit",
            Self::Present => "Present",
        }
    }
}

/// How a call to [`FrameScheduler::render_frame`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The frame was submitted and presented.
    Presented,
    /// The frame was presented but the surface went stale; the swapchain has
    /// been rebuilt.
    PresentedThenRecreated,
    /// Acquire found a stale swapchain. Nothing was submitted and the slot
    /// did not advance.
    SwapchainRecreated,
    /// The surface has no area (minimised window).
    Skipped,
}

/// What the recorder sees while building a frame.
#[derive(Clone, Copy)]
pub struct FrameContext<'a> {
    pub backend: &'a dyn GpuBackend,
    pub frame_index: u64,
    pub slot: &'a FrameSlot,
    /// The slot used by the previous frame; its particle buffer holds last
    /// frame's survivors.
    pub previous_slot: &'a FrameSlot,
    pub image_index: u32,
    pub swapchain: SwapchainInfo,
}

impl std::fmt::Debug for FrameContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameContext")
            .field("frame_index", &self.frame_index)
            .field("slot", &self.slot.index)
            .field("image_index", &self.image_index)
            .finish()
    }
}

/// The work the scheduler drives each frame.
pub trait FrameRecorder {
    /// Called once the slot's previous use has completed; destroys resources
    /// released at least `FRAME_OVERLAP` frames ago.
    fn retire_resources(&mut self, frame_index: u64);

    /// Fill the slot's buffers and record the compute queue's work.
    fn record_compute(
        &mut self,
        ctx: &FrameContext<'_>,
        commands: &mut CommandList,
    ) -> GraphicsResult<()>;

    /// Record the graphics queue's work, ending with the swapchain image in
    /// the present layout.
    fn record_graphics(
        &mut self,
        ctx: &FrameContext<'_>,
        commands: &mut CommandList,
    ) -> GraphicsResult<()>;

    /// Rebuild everything sized by the swapchain. The device is idle.
    fn recreate_surface_resources(
        &mut self,
        backend: &dyn GpuBackend,
        swapchain: &SwapchainInfo,
    ) -> GraphicsResult<()>;
}

/// Drives acquire, compute, graphics and present for one frame at a time.
pub struct FrameScheduler {
    backend: Arc<dyn GpuBackend>,
    config: FrameConfig,
    slots: Vec<FrameSlot>,
    slot_index: usize,
    frame_index: u64,
    state: FrameState,
    transitions: TransitionReceiver,
    swapchain: SwapchainInfo,
    compute_commands: CommandList,
    graphics_commands: CommandList,
    abandoned: Option<GraphicsError>,
}

impl FrameScheduler {
    pub fn new(
        backend: Arc<dyn GpuBackend>,
        config: &RendererConfig,
        transitions: TransitionReceiver,
    ) -> GraphicsResult<Self> {
        let mut slots = Vec::with_capacity(FRAME_OVERLAP);
        for index in 0..FRAME_OVERLAP {
            match FrameSlot::create(&*backend, config, index) {
                Ok(slot) => slots.push(slot),
                Err(e) => {
                    for slot in slots {
                        slot.destroy(&*backend);
                    }
                    return Err(e);
                }
            }
        }

        let swapchain = backend.swapchain_info();
        log::info!(
            "Frame scheduler ready: {} slots, swapchain {}x{}",
            FRAME_OVERLAP,
            swapchain.extent.width,
            swapchain.extent.height
        );

        Ok(Self {
            backend,
            config: config.frame.clone(),
            slots,
            slot_index: 0,
            frame_index: 0,
            state: FrameState::Idle,
            transitions,
            swapchain,
            compute_commands: CommandList::new(),
            graphics_commands: CommandList::new(),
            abandoned: None,
        })
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn slot_index(&self) -> usize {
        self.slot_index
    }

    pub fn slot(&self, index: usize) -> &FrameSlot {
        &self.slots[index]
    }

    pub fn slots(&self) -> &[FrameSlot] {
        &self.slots
    }

    pub fn swapchain(&self) -> SwapchainInfo {
        self.swapchain
    }

    pub fn pending_transitions(&self) -> usize {
        self.transitions.pending()
    }

    /// The error that ended rendering, if a frame failed after acquire.
    pub fn abandoned(&self) -> Option<&GraphicsError> {
        self.abandoned.as_ref()
    }

    fn enter(&mut self, next: FrameState) {
        if next != FrameState::Idle && next != self.state.successor() {
            panic!("illegal frame state transition {:?} -> {:?}", self.state, next);
        }
        log::trace!("Frame {}: {:?} -> {:?}", self.frame_index, self.state, next);
        self.state = next;
    }

    /// Render one frame.
    ///
    /// Errors before the swapchain image is acquired leave the scheduler
    /// usable. Any error after it is returned as a fatal
    /// [`GraphicsError::FrameAbandoned`], repeated by every later call; the
    /// transitions the frame had drained stay queued for `shutdown`.
    pub fn render_frame(
        &mut self,
        surface: &dyn DrawableSurface,
        recorder: &mut dyn FrameRecorder,
    ) -> GraphicsResult<FrameOutcome> {
        profile_function!();
        if self.state != FrameState::Idle {
            panic!("render_frame called while a frame is in state {:?}", self.state);
        }
        if let Some(error) = &self.abandoned {
            return Err(error.clone());
        }

        let result = self.run_frame(surface, recorder);
        self.enter(FrameState::Idle);
        if matches!(
            result,
            Ok(FrameOutcome::Presented | FrameOutcome::PresentedThenRecreated)
        ) {
            frame_mark!();
        }
        result
    }

    fn run_frame(
        &mut self,
        surface: &dyn DrawableSurface,
        recorder: &mut dyn FrameRecorder,
    ) -> GraphicsResult<FrameOutcome> {
        if surface.drawable_extent().is_empty() {
            log::trace!("Frame {}: surface has no area, skipping", self.frame_index);
            return Ok(FrameOutcome::Skipped);
        }
        let backend = Arc::clone(&self.backend);
        let slot_index = self.slot_index;
        let previous_index = (slot_index + FRAME_OVERLAP - 1) % FRAME_OVERLAP;

        // Acquire
        self.enter(FrameState::AcquireImage);
        let image_index = {
            profile_scope!("acquire_image");
            // The slot's last graphics submission must have consumed
            // image_available before acquire can signal it again.
            let slot = &self.slots[slot_index];
            self.wait_fences(&[slot.compute_fence, slot.graphics_fence])?;
            match backend.acquire_next_image(slot.image_available) {
                Ok(index) => index,
                Err(e) if e.is_surface_stale() => {
                    log::warn!("Swapchain out of date on acquire ({}), recreating", e);
                    self.recreate_swapchain(surface, recorder)?;
                    return Ok(FrameOutcome::SwapchainRecreated);
                }
                Err(e) => return Err(e),
            }
        };

        let frame = self.frame_index;
        self.submit_frame(surface, recorder, slot_index, previous_index, image_index)
            .map_err(|source| {
                let error = GraphicsError::FrameAbandoned {
                    frame,
                    state: self.state.name(),
                    source: Box::new(source),
                };
                log::error!("{}", error);
                self.abandoned = Some(error.clone());
                error
            })
    }

    /// Everything after a successful acquire.
    fn submit_frame(
        &mut self,
        surface: &dyn DrawableSurface,
        recorder: &mut dyn FrameRecorder,
        slot_index: usize,
        previous_index: usize,
        image_index: u32,
    ) -> GraphicsResult<FrameOutcome> {
        let backend = Arc::clone(&self.backend);

        // Compute
        self.enter(FrameState::RecordCompute);
        {
            profile_scope!("record_compute");
            for semaphore in self.slots[slot_index].take_retired_semaphores() {
                backend.destroy_semaphore(semaphore);
            }
            recorder.retire_resources(self.frame_index);

            self.compute_commands.clear();
            let ctx = frame_context(
                &*backend,
                &self.slots,
                slot_index,
                previous_index,
                self.frame_index,
                image_index,
                self.swapchain,
            );
            recorder.record_compute(&ctx, &mut self.compute_commands)?;

            let slot = &self.slots[slot_index];
            backend.reset_fence(slot.compute_fence)?;
            backend.submit(&Submission {
                queue: QueueKind::Compute,
                command_buffer: slot.compute_commands,
                commands: &self.compute_commands,
                waits: &[],
                signals: &[slot.compute_finished],
                fence: Some(slot.compute_fence),
            })?;
        }

        // Graphics
        self.enter(FrameState::RecordGraphics);
        let transitions = self.transitions.drain(self.config.max_transitions_per_frame);
        if !transitions.is_empty() {
            log::debug!(
                "Frame {}: acquiring {} uploaded images ({} still queued)",
                self.frame_index,
                transitions.len(),
                self.transitions.pending()
            );
        }
        let submitted = self
            .record_graphics(recorder, &transitions, slot_index, previous_index, image_index)
            .and_then(|()| self.submit_graphics(&transitions, slot_index));
        if let Err(e) = submitted {
            // Never waited on; shutdown flushes them.
            self.transitions.requeue_front(transitions);
            return Err(e);
        }
        // Destroyed once this slot's fence is next waited on.
        self.slots[slot_index].retire_semaphores(transitions.iter().map(|t| t.semaphore));

        self.enter(FrameState::Present);
        let presented = {
            profile_scope!("present");
            backend.present(image_index, self.slots[slot_index].render_finished)
        };
        self.slot_index = (slot_index + 1) % FRAME_OVERLAP;
        self.frame_index += 1;

        match presented {
            Ok(()) => Ok(FrameOutcome::Presented),
            Err(e) if e.is_surface_stale() => {
                log::warn!("Swapchain out of date on present ({}), recreating", e);
                self.recreate_swapchain(surface, recorder)?;
                Ok(FrameOutcome::PresentedThenRecreated)
            }
            Err(e) => Err(e),
        }
    }

    fn record_graphics(
        &mut self,
        recorder: &mut dyn FrameRecorder,
        transitions: &[ImageTransition],
        slot_index: usize,
        previous_index: usize,
        image_index: u32,
    ) -> GraphicsResult<()> {
        profile_scope!("record_graphics");
        self.graphics_commands.clear();
        for transition in transitions {
            self.graphics_commands.barrier(transition.acquire_barrier());
        }
        let ctx = frame_context(
            &*self.backend,
            &self.slots,
            slot_index,
            previous_index,
            self.frame_index,
            image_index,
            self.swapchain,
        );
        recorder.record_graphics(&ctx, &mut self.graphics_commands)
    }

    fn submit_graphics(
        &mut self,
        transitions: &[ImageTransition],
        slot_index: usize,
    ) -> GraphicsResult<()> {
        self.enter(FrameState::Submit);
        profile_scope!("submit");
        let slot = &self.slots[slot_index];
        let mut waits = vec![
            SemaphoreWait {
                semaphore: slot.image_available,
                stages: PipelineStages::COLOR_ATTACHMENT_OUTPUT,
            },
            SemaphoreWait {
                semaphore: slot.compute_finished,
                stages: PipelineStages::VERTEX_SHADER | PipelineStages::DRAW_INDIRECT,
            },
        ];
        waits.extend(transitions.iter().map(|t| t.wait()));

        self.backend.reset_fence(slot.graphics_fence)?;
        self.backend.submit(&Submission {
            queue: QueueKind::Graphics,
            command_buffer: slot.graphics_commands,
            commands: &self.graphics_commands,
            waits: &waits,
            signals: &[slot.render_finished],
            fence: Some(slot.graphics_fence),
        })
    }

    fn wait_fences(&self, fences: &[FenceHandle]) -> GraphicsResult<()> {
        let timeout = Duration::from_millis(self.config.fence_timeout_ms);
        for &fence in fences {
            if !self.backend.wait_fence(fence, timeout)? {
                return Err(GraphicsError::Internal(format!(
                    "frame slot {} fence {:?} did not signal within {:?}",
                    self.slot_index, fence, timeout
                )));
            }
        }
        Ok(())
    }

    fn recreate_swapchain(
        &mut self,
        surface: &dyn DrawableSurface,
        recorder: &mut dyn FrameRecorder,
    ) -> GraphicsResult<()> {
        profile_scope!("recreate_swapchain");
        self.backend.wait_idle()?;

        let extent = surface.drawable_extent();
        if extent.is_empty() {
            log::debug!("Surface minimised, deferring swapchain recreation");
            return Ok(());
        }

        let swapchain = self.backend.recreate_swapchain(extent)?;
        log::info!(
            "Swapchain recreated: {}x{}, {} images",
            swapchain.extent.width,
            swapchain.extent.height,
            swapchain.image_count
        );
        self.swapchain = swapchain;
        recorder.recreate_surface_resources(&*self.backend, &swapchain)
    }

    /// Acquire every queued image on the graphics queue and wait for it, so
    /// no transition semaphore is left unwaited. Returns how many were
    /// flushed.
    pub fn flush_transitions(&mut self) -> GraphicsResult<usize> {
        let transitions = self.transitions.drain(usize::MAX);
        if transitions.is_empty() {
            return Ok(0);
        }

        let backend = &self.backend;
        let command_buffer = backend.create_command_buffer(QueueKind::Graphics)?;
        let fence = match backend.create_fence(false) {
            Ok(fence) => fence,
            Err(e) => {
                backend.destroy_command_buffer(command_buffer);
                return Err(e);
            }
        };

        let mut commands = CommandList::new();
        for transition in &transitions {
            commands.barrier(transition.acquire_barrier());
        }
        let waits: Vec<SemaphoreWait> = transitions.iter().map(|t| t.wait()).collect();
        let timeout = Duration::from_millis(self.config.fence_timeout_ms);

        let completed = backend
            .submit(&Submission {
                queue: QueueKind::Graphics,
                command_buffer,
                commands: &commands,
                waits: &waits,
                signals: &[],
                fence: Some(fence),
            })
            .and_then(|()| backend.wait_fence(fence, timeout));

        backend.destroy_fence(fence);
        backend.destroy_command_buffer(command_buffer);
        for transition in &transitions {
            backend.destroy_semaphore(transition.semaphore);
        }

        match completed {
            Ok(true) => {
                log::debug!("Flushed {} pending image transitions", transitions.len());
                Ok(transitions.len())
            }
            Ok(false) => Err(GraphicsError::Internal(format!(
                "transition flush did not complete within {:?}",
                timeout
            ))),
            Err(e) => Err(e),
        }
    }

    /// Drain pending transitions, wait for the device and destroy the slots.
    pub fn shutdown(&mut self) -> GraphicsResult<()> {
        let flushed = self.flush_transitions();
        self.backend.wait_idle()?;
        for slot in self.slots.drain(..) {
            slot.destroy(&*self.backend);
        }
        log::info!("Frame scheduler shut down after {} frames", self.frame_index);
        flushed.map(|_| ())
    }
}

fn frame_context<'a>(
    backend: &'a dyn GpuBackend,
    slots: &'a [FrameSlot],
    slot_index: usize,
    previous_index: usize,
    frame_index: u64,
    image_index: u32,
    swapchain: SwapchainInfo,
) -> FrameContext<'a> {
    FrameContext {
        backend,
        frame_index,
        slot: &slots[slot_index],
        previous_slot: &slots[previous_index],
        image_index,
        swapchain,
    }
}

impl Drop for FrameScheduler {
    fn drop(&mut self) {
        if !self.slots.is_empty() {
            log::warn!("Frame scheduler dropped without shutdown; {} slots leaked", self.slots.len());
        }
    }
}

impl std::fmt::Debug for FrameScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameScheduler")
            .field("backend", &self.backend.name())
            .field("state", &self.state)
            .field("slot_index", &self.slot_index)
            .field("frame_index", &self.frame_index)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::{BackendEvent, DummyBackend};
    use crate::transition::transition_channel;
    use crate::types::{Extent2d, ImageDescriptor, ImageFormat, ImageUsage};

    #[derive(Default)]
    struct CountingRecorder {
        retired: Vec<u64>,
        compute: usize,
        graphics: usize,
        recreated: Vec<Extent2d>,
        fail_graphics: bool,
    }

    impl FrameRecorder for CountingRecorder {
        fn retire_resources(&mut self, frame_index: u64) {
            self.retired.push(frame_index);
        }

        fn record_compute(
            &mut self,
            _ctx: &FrameContext<'_>,
            _commands: &mut CommandList,
        ) -> GraphicsResult<()> {
            self.compute += 1;
            Ok(())
        }

        fn record_graphics(
            &mut self,
            _ctx: &FrameContext<'_>,
            _commands: &mut CommandList,
        ) -> GraphicsResult<()> {
            if self.fail_graphics {
                return Err(GraphicsError::InvalidParameter("unknown material".into()));
            }
            self.graphics += 1;
            Ok(())
        }

        fn recreate_surface_resources(
            &mut self,
            _backend: &dyn GpuBackend,
            swapchain: &SwapchainInfo,
        ) -> GraphicsResult<()> {
            self.recreated.push(swapchain.extent);
            Ok(())
        }
    }

    fn scheduler(backend: &Arc<DummyBackend>) -> FrameScheduler {
        let (_sender, receiver) = transition_channel();
        FrameScheduler::new(backend.clone(), &RendererConfig::default(), receiver).unwrap()
    }

    #[test]
    fn test_frame_cycles_slots() {
        let backend = Arc::new(DummyBackend::new());
        let mut scheduler = scheduler(&backend);
        let mut recorder = CountingRecorder::default();

        for expected_slot in [1, 0, 1] {
            let outcome = scheduler.render_frame(&*backend, &mut recorder).unwrap();
            assert_eq!(outcome, FrameOutcome::Presented);
            assert_eq!(scheduler.slot_index(), expected_slot);
            assert_eq!(scheduler.state(), FrameState::Idle);
        }
        assert_eq!(scheduler.frame_index(), 3);
        assert_eq!(recorder.retired, vec![0, 1, 2]);
        scheduler.shutdown().unwrap();
    }

    #[test]
    fn test_graphics_waits_on_compute_and_acquire() {
        let backend = Arc::new(DummyBackend::new());
        let mut scheduler = scheduler(&backend);
        let mut recorder = CountingRecorder::default();
        scheduler.render_frame(&*backend, &mut recorder).unwrap();

        let submissions = backend.submissions();
        assert_eq!(submissions.len(), 2);
        assert_eq!(submissions[0].queue, QueueKind::Compute);
        let slot = scheduler.slot(0);
        assert_eq!(submissions[0].signals, vec![slot.compute_finished]);

        let graphics = &submissions[1];
        assert_eq!(graphics.queue, QueueKind::Graphics);
        assert!(graphics.waits.contains(&SemaphoreWait {
            semaphore: slot.compute_finished,
            stages: PipelineStages::VERTEX_SHADER | PipelineStages::DRAW_INDIRECT,
        }));
        assert!(graphics.waits.contains(&SemaphoreWait {
            semaphore: slot.image_available,
            stages: PipelineStages::COLOR_ATTACHMENT_OUTPUT,
        }));
        assert_eq!(graphics.signals, vec![slot.render_finished]);
        scheduler.shutdown().unwrap();
    }

    #[test]
    fn test_zero_extent_skips() {
        let backend = Arc::new(DummyBackend::new());
        let mut scheduler = scheduler(&backend);
        let mut recorder = CountingRecorder::default();
        backend.set_surface_extent(Extent2d::new(0, 0));

        let outcome = scheduler.render_frame(&*backend, &mut recorder).unwrap();
        assert_eq!(outcome, FrameOutcome::Skipped);
        assert!(backend.submissions().is_empty());
        assert_eq!(scheduler.frame_index(), 0);
        scheduler.shutdown().unwrap();
    }

    #[test]
    fn test_stale_present_recreates_after_presenting() {
        let backend = Arc::new(DummyBackend::new());
        let mut scheduler = scheduler(&backend);
        let mut recorder = CountingRecorder::default();
        backend.fail_next_present();

        let outcome = scheduler.render_frame(&*backend, &mut recorder).unwrap();
        assert_eq!(outcome, FrameOutcome::PresentedThenRecreated);
        assert_eq!(scheduler.slot_index(), 1);
        assert_eq!(recorder.recreated.len(), 1);
        assert!(backend.events().contains(&BackendEvent::WaitIdle));
        scheduler.shutdown().unwrap();
    }

    #[test]
    fn test_failed_graphics_recording_abandons_frame() {
        let backend = Arc::new(DummyBackend::new());
        let (mut sender, receiver) = transition_channel();
        let mut scheduler =
            FrameScheduler::new(backend.clone(), &RendererConfig::default(), receiver).unwrap();
        let image = backend
            .create_image(&ImageDescriptor::new_2d(
                1,
                1,
                ImageFormat::Rgba8Unorm,
                ImageUsage::SAMPLED | ImageUsage::COPY_DST,
            ))
            .unwrap();
        let semaphore = backend.create_semaphore().unwrap();
        sender.send(ImageTransition::sampled(image, semaphore)).unwrap();

        let mut recorder = CountingRecorder {
            fail_graphics: true,
            ..Default::default()
        };
        let err = scheduler.render_frame(&*backend, &mut recorder).unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(
            err,
            GraphicsError::FrameAbandoned {
                frame: 0,
                state: "RecordGraphics",
                ..
            }
        ));
        assert_eq!(scheduler.state(), FrameState::Idle);
        assert_eq!(scheduler.pending_transitions(), 1);
        assert!(!backend.destroyed_semaphores().contains(&semaphore));
        assert!(backend
            .submissions()
            .iter()
            .all(|s| s.queue != QueueKind::Graphics));

        // Later frames repeat the error without touching the GPU.
        recorder.fail_graphics = false;
        let submitted = backend.submissions().len();
        assert_eq!(scheduler.render_frame(&*backend, &mut recorder).unwrap_err(), err);
        assert_eq!(backend.submissions().len(), submitted);
        assert_eq!(recorder.compute, 1);
        assert_eq!(scheduler.abandoned(), Some(&err));

        // Shutdown still acquires the image before destroying its semaphore.
        scheduler.shutdown().unwrap();
        assert!(backend.submissions().iter().any(|s| {
            s.queue == QueueKind::Graphics && s.waits.iter().any(|w| w.semaphore == semaphore)
        }));
        assert!(backend.destroyed_semaphores().contains(&semaphore));
        backend.destroy_image(image);
    }
}
