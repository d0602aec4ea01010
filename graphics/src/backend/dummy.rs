//! Dummy GPU backend for testing and development.
//!
//! Nothing executes, but the backend keeps enough state to check that the
//! renderer drives a real GPU correctly:
//!
//! - every submission is recorded with its command list, waits and signals
//! - a submission stays *in flight* until the CPU observes its fence (or a
//!   later fence on the same queue, or `wait_idle`)
//! - `write_buffer` on a buffer referenced by an in-flight submission, and
//!   destroying a resource an in-flight submission uses, are recorded as
//!   hazards
//! - the surface extent can be changed to make the next acquire stale

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use parking_lot::Mutex;

use crate::command::{Command, CommandList};
use crate::error::{GraphicsError, GraphicsResult};
use crate::renderer::DrawableSurface;
use crate::types::{
    BufferDescriptor, BufferUsage, ComputePipelineDescriptor, Extent2d,
    GraphicsPipelineDescriptor, ImageDescriptor, ImageFormat, SamplerDescriptor,
};

use super::{
    Binding, BindingResource, BindingSetHandle, BufferHandle, CommandBufferHandle, FenceHandle,
    GpuBackend, ImageHandle, PipelineHandle, QueueKind, SamplerHandle, SemaphoreHandle,
    SemaphoreWait, Submission, SwapchainInfo,
};

/// Number of swapchain images the dummy surface pretends to have.
const DUMMY_SWAPCHAIN_IMAGES: u32 = 3;

/// Observable backend activity, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    Acquire { image_index: u32 },
    AcquireOutdated,
    Submit { queue: QueueKind },
    Present { image_index: u32 },
    PresentOutdated,
    Recreate { extent: Extent2d },
    WaitIdle,
    WriteBuffer { buffer: BufferHandle },
}

/// A submission as the backend received it.
#[derive(Debug, Clone)]
pub struct RecordedSubmission {
    pub queue: QueueKind,
    pub command_buffer: CommandBufferHandle,
    pub commands: CommandList,
    pub waits: Vec<SemaphoreWait>,
    pub signals: Vec<SemaphoreHandle>,
    pub fence: Option<FenceHandle>,
}

/// CPU access to a resource the GPU may still be using.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hazard {
    /// `write_buffer` while an in-flight submission referenced the buffer.
    WriteInFlight {
        buffer: BufferHandle,
        submission: usize,
    },
    /// A buffer was destroyed while an in-flight submission referenced it.
    BufferDestroyedInFlight {
        buffer: BufferHandle,
        submission: usize,
    },
    /// An image was destroyed while an in-flight submission referenced it.
    ImageDestroyedInFlight {
        image: ImageHandle,
        submission: usize,
    },
}

#[derive(Debug)]
struct DummyBuffer {
    size: u64,
    usage: BufferUsage,
    data: Vec<u8>,
}

#[derive(Debug, Default)]
struct FenceState {
    signaled: bool,
}

#[derive(Debug)]
struct InFlight {
    submission: usize,
    queue: QueueKind,
    fence: Option<FenceHandle>,
    buffers: HashSet<BufferHandle>,
    images: HashSet<ImageHandle>,
}

#[derive(Debug)]
struct State {
    next_id: u64,
    buffers: HashMap<BufferHandle, DummyBuffer>,
    images: HashMap<ImageHandle, ImageDescriptor>,
    samplers: HashSet<SamplerHandle>,
    pipelines: HashSet<PipelineHandle>,
    binding_sets: HashMap<BindingSetHandle, Vec<Binding>>,
    command_buffers: HashMap<CommandBufferHandle, QueueKind>,
    fences: HashMap<FenceHandle, FenceState>,
    semaphores: HashSet<SemaphoreHandle>,

    in_flight: Vec<InFlight>,
    submissions: Vec<RecordedSubmission>,
    events: Vec<BackendEvent>,
    hazards: Vec<Hazard>,
    destroyed_semaphores: Vec<SemaphoreHandle>,
    destroyed_buffers: Vec<BufferHandle>,
    destroyed_images: Vec<ImageHandle>,

    swapchain: SwapchainInfo,
    surface_extent: Extent2d,
    next_image: u32,
    fail_next_present: bool,
    fail_next_semaphore: bool,
}

impl State {
    fn next_raw(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Retire the submission guarded by `fence` together with every earlier
    /// submission on the same queue.
    fn complete_fence(&mut self, fence: FenceHandle) -> bool {
        let Some(pos) = self.in_flight.iter().position(|f| f.fence == Some(fence)) else {
            return false;
        };
        let queue = self.in_flight[pos].queue;
        let last = self.in_flight[pos].submission;
        self.in_flight
            .retain(|f| !(f.queue == queue && f.submission <= last));
        if let Some(state) = self.fences.get_mut(&fence) {
            state.signaled = true;
        }
        true
    }

    fn complete_all(&mut self) {
        for flight in self.in_flight.drain(..) {
            if let Some(fence) = flight.fence
                && let Some(state) = self.fences.get_mut(&fence)
            {
                state.signaled = true;
            }
        }
    }

    fn referenced_resources(
        &self,
        commands: &CommandList,
    ) -> (HashSet<BufferHandle>, HashSet<ImageHandle>) {
        let mut buffers: HashSet<_> = commands.direct_buffers().into_iter().collect();
        let mut images = HashSet::new();
        for set in commands.binding_sets() {
            for binding in self.binding_sets.get(&set).into_iter().flatten() {
                match binding.resource {
                    BindingResource::Buffer { buffer, .. } => {
                        buffers.insert(buffer);
                    }
                    BindingResource::SampledImage { image, .. }
                    | BindingResource::StorageImage(image) => {
                        images.insert(image);
                    }
                }
            }
        }
        for command in commands.commands() {
            match command {
                Command::CopyBufferToImage { image, .. } => {
                    images.insert(*image);
                }
                Command::BeginRendering { depth: Some(depth), .. } => {
                    images.insert(depth.image);
                }
                _ => {}
            }
        }
        (buffers, images)
    }

    /// Buffer-to-image copies must address an existing mip level and stay
    /// inside the source buffer.
    fn validate_copies(&self, commands: &CommandList) -> GraphicsResult<()> {
        for command in commands.commands() {
            let Command::CopyBufferToImage {
                buffer,
                buffer_offset,
                image,
                mip_level,
                extent,
            } = command
            else {
                continue;
            };
            let descriptor = self
                .images
                .get(image)
                .ok_or_else(|| GraphicsError::InvalidParameter(format!("copy into unknown image {image:?}")))?;
            if *mip_level >= descriptor.mip_level_count {
                return Err(GraphicsError::InvalidParameter(format!(
                    "copy into mip {} of {:?} with {} levels",
                    mip_level, image, descriptor.mip_level_count
                )));
            }
            if *extent != descriptor.extent.mip(*mip_level) {
                return Err(GraphicsError::InvalidParameter(format!(
                    "copy extent {:?} does not match mip {} of {:?}",
                    extent, mip_level, image
                )));
            }
            let source = self
                .buffers
                .get(buffer)
                .ok_or_else(|| GraphicsError::InvalidParameter(format!("copy from unknown buffer {buffer:?}")))?;
            let end = buffer_offset + descriptor.format.byte_size(*extent);
            if end > source.size {
                return Err(GraphicsError::InvalidParameter(format!(
                    "copy reads {} bytes past the end of {:?}",
                    end - source.size,
                    buffer
                )));
            }
        }
        Ok(())
    }
}

/// Dummy GPU backend.
#[derive(Debug)]
pub struct DummyBackend {
    state: Mutex<State>,
}

impl Default for DummyBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DummyBackend {
    /// Create a dummy backend with a 1280x720 surface.
    pub fn new() -> Self {
        Self::with_surface(Extent2d::new(1280, 720))
    }

    /// Create a dummy backend whose swapchain matches `extent`.
    pub fn with_surface(extent: Extent2d) -> Self {
        Self {
            state: Mutex::new(State {
                next_id: 0,
                buffers: HashMap::new(),
                images: HashMap::new(),
                samplers: HashSet::new(),
                pipelines: HashSet::new(),
                binding_sets: HashMap::new(),
                command_buffers: HashMap::new(),
                fences: HashMap::new(),
                semaphores: HashSet::new(),
                in_flight: Vec::new(),
                submissions: Vec::new(),
                events: Vec::new(),
                hazards: Vec::new(),
                destroyed_semaphores: Vec::new(),
                destroyed_buffers: Vec::new(),
                destroyed_images: Vec::new(),
                swapchain: SwapchainInfo {
                    extent,
                    format: ImageFormat::Bgra8Srgb,
                    image_count: DUMMY_SWAPCHAIN_IMAGES,
                },
                surface_extent: extent,
                next_image: 0,
                fail_next_present: false,
                fail_next_semaphore: false,
            }),
        }
    }

    /// Resize the pretend window. The next acquire reports an outdated
    /// swapchain unless the extent is unchanged.
    pub fn set_surface_extent(&self, extent: Extent2d) {
        self.state.lock().surface_extent = extent;
    }

    /// Make the next present report an outdated surface.
    pub fn fail_next_present(&self) {
        self.state.lock().fail_next_present = true;
    }

    /// Make the next `create_semaphore` report out of memory.
    pub fn fail_next_semaphore(&self) {
        self.state.lock().fail_next_semaphore = true;
    }

    pub fn events(&self) -> Vec<BackendEvent> {
        self.state.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }

    pub fn submissions(&self) -> Vec<RecordedSubmission> {
        self.state.lock().submissions.clone()
    }

    pub fn hazards(&self) -> Vec<Hazard> {
        self.state.lock().hazards.clone()
    }

    pub fn in_flight_count(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    pub fn destroyed_semaphores(&self) -> Vec<SemaphoreHandle> {
        self.state.lock().destroyed_semaphores.clone()
    }

    pub fn destroyed_buffers(&self) -> Vec<BufferHandle> {
        self.state.lock().destroyed_buffers.clone()
    }

    pub fn destroyed_images(&self) -> Vec<ImageHandle> {
        self.state.lock().destroyed_images.clone()
    }

    pub fn live_buffer_count(&self) -> usize {
        self.state.lock().buffers.len()
    }

    pub fn live_image_count(&self) -> usize {
        self.state.lock().images.len()
    }

    pub fn live_semaphore_count(&self) -> usize {
        self.state.lock().semaphores.len()
    }

    pub fn live_fence_count(&self) -> usize {
        self.state.lock().fences.len()
    }

    pub fn live_command_buffer_count(&self) -> usize {
        self.state.lock().command_buffers.len()
    }

    pub fn live_pipeline_count(&self) -> usize {
        self.state.lock().pipelines.len()
    }

    pub fn live_binding_set_count(&self) -> usize {
        self.state.lock().binding_sets.len()
    }

    /// Bytes written to a buffer so far, zero-filled up to the last write.
    pub fn buffer_contents(&self, buffer: BufferHandle) -> Option<Vec<u8>> {
        self.state.lock().buffers.get(&buffer).map(|b| b.data.clone())
    }

    pub fn image_descriptor(&self, image: ImageHandle) -> Option<ImageDescriptor> {
        self.state.lock().images.get(&image).cloned()
    }

    /// Resources bound to a binding set.
    pub fn binding_set_contents(&self, binding_set: BindingSetHandle) -> Option<Vec<Binding>> {
        self.state.lock().binding_sets.get(&binding_set).cloned()
    }
}

impl DrawableSurface for DummyBackend {
    fn drawable_extent(&self) -> Extent2d {
        self.state.lock().surface_extent
    }
}

impl GpuBackend for DummyBackend {
    fn name(&self) -> &'static str {
        "Dummy Backend"
    }

    fn create_buffer(&self, descriptor: &BufferDescriptor) -> GraphicsResult<BufferHandle> {
        if descriptor.size == 0 {
            return Err(GraphicsError::InvalidParameter(format!(
                "buffer {:?} has zero size",
                descriptor.label
            )));
        }
        log::trace!(
            "DummyBackend: creating buffer {:?} (size: {})",
            descriptor.label,
            descriptor.size
        );
        let mut state = self.state.lock();
        let handle = BufferHandle::from_raw(state.next_raw());
        state.buffers.insert(
            handle,
            DummyBuffer {
                size: descriptor.size,
                usage: descriptor.usage,
                data: Vec::new(),
            },
        );
        Ok(handle)
    }

    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> GraphicsResult<()> {
        let mut state = self.state.lock();
        let in_flight: Vec<usize> = state
            .in_flight
            .iter()
            .filter(|f| f.buffers.contains(&buffer))
            .map(|f| f.submission)
            .collect();
        for submission in in_flight {
            log::warn!("DummyBackend: write to {buffer:?} used by in-flight submission {submission}");
            state.hazards.push(Hazard::WriteInFlight { buffer, submission });
        }

        let target = state.buffers.get_mut(&buffer).ok_or_else(|| {
            GraphicsError::InvalidParameter(format!("write to unknown buffer {buffer:?}"))
        })?;
        if !target.usage.contains(BufferUsage::HOST_WRITE) {
            return Err(GraphicsError::InvalidParameter(format!(
                "buffer {buffer:?} is not host-visible"
            )));
        }
        let end = offset + data.len() as u64;
        if end > target.size {
            return Err(GraphicsError::InvalidParameter(format!(
                "write of {} bytes at {offset} overflows buffer {buffer:?} of {} bytes",
                data.len(),
                target.size
            )));
        }
        if target.data.len() < end as usize {
            target.data.resize(end as usize, 0);
        }
        target.data[offset as usize..end as usize].copy_from_slice(data);
        state.events.push(BackendEvent::WriteBuffer { buffer });
        Ok(())
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        let mut state = self.state.lock();
        let users: Vec<usize> = state
            .in_flight
            .iter()
            .filter(|f| f.buffers.contains(&buffer))
            .map(|f| f.submission)
            .collect();
        for submission in users {
            state
                .hazards
                .push(Hazard::BufferDestroyedInFlight { buffer, submission });
        }
        if state.buffers.remove(&buffer).is_some() {
            state.destroyed_buffers.push(buffer);
        }
    }

    fn create_image(&self, descriptor: &ImageDescriptor) -> GraphicsResult<ImageHandle> {
        if descriptor.extent.is_empty() {
            return Err(GraphicsError::InvalidParameter(format!(
                "image {:?} has an empty extent",
                descriptor.label
            )));
        }
        log::trace!(
            "DummyBackend: creating image {:?} ({}x{})",
            descriptor.label,
            descriptor.extent.width,
            descriptor.extent.height
        );
        let mut state = self.state.lock();
        let handle = ImageHandle::from_raw(state.next_raw());
        state.images.insert(handle, descriptor.clone());
        Ok(handle)
    }

    fn destroy_image(&self, image: ImageHandle) {
        let mut state = self.state.lock();
        let users: Vec<usize> = state
            .in_flight
            .iter()
            .filter(|f| f.images.contains(&image))
            .map(|f| f.submission)
            .collect();
        for submission in users {
            state
                .hazards
                .push(Hazard::ImageDestroyedInFlight { image, submission });
        }
        if state.images.remove(&image).is_some() {
            state.destroyed_images.push(image);
        }
    }

    fn create_sampler(&self, descriptor: &SamplerDescriptor) -> GraphicsResult<SamplerHandle> {
        log::trace!("DummyBackend: creating sampler {:?}", descriptor.label);
        let mut state = self.state.lock();
        let handle = SamplerHandle::from_raw(state.next_raw());
        state.samplers.insert(handle);
        Ok(handle)
    }

    fn destroy_sampler(&self, sampler: SamplerHandle) {
        self.state.lock().samplers.remove(&sampler);
    }

    fn create_compute_pipeline(
        &self,
        descriptor: &ComputePipelineDescriptor,
    ) -> GraphicsResult<PipelineHandle> {
        log::trace!("DummyBackend: creating compute pipeline {:?}", descriptor.label);
        let mut state = self.state.lock();
        let handle = PipelineHandle::from_raw(state.next_raw());
        state.pipelines.insert(handle);
        Ok(handle)
    }

    fn create_graphics_pipeline(
        &self,
        descriptor: &GraphicsPipelineDescriptor,
    ) -> GraphicsResult<PipelineHandle> {
        log::trace!("DummyBackend: creating graphics pipeline {:?}", descriptor.label);
        let mut state = self.state.lock();
        let handle = PipelineHandle::from_raw(state.next_raw());
        state.pipelines.insert(handle);
        Ok(handle)
    }

    fn destroy_pipeline(&self, pipeline: PipelineHandle) {
        self.state.lock().pipelines.remove(&pipeline);
    }

    fn create_binding_set(
        &self,
        pipeline: PipelineHandle,
        set_index: u32,
        bindings: &[Binding],
    ) -> GraphicsResult<BindingSetHandle> {
        let mut state = self.state.lock();
        if !state.pipelines.contains(&pipeline) {
            return Err(GraphicsError::InvalidParameter(format!(
                "binding set {set_index} for unknown pipeline {pipeline:?}"
            )));
        }
        let handle = BindingSetHandle::from_raw(state.next_raw());
        state.binding_sets.insert(handle, bindings.to_vec());
        Ok(handle)
    }

    fn destroy_binding_set(&self, binding_set: BindingSetHandle) {
        self.state.lock().binding_sets.remove(&binding_set);
    }

    fn create_command_buffer(&self, queue: QueueKind) -> GraphicsResult<CommandBufferHandle> {
        let mut state = self.state.lock();
        let handle = CommandBufferHandle::from_raw(state.next_raw());
        state.command_buffers.insert(handle, queue);
        Ok(handle)
    }

    fn destroy_command_buffer(&self, command_buffer: CommandBufferHandle) {
        self.state.lock().command_buffers.remove(&command_buffer);
    }

    fn create_fence(&self, signaled: bool) -> GraphicsResult<FenceHandle> {
        let mut state = self.state.lock();
        let handle = FenceHandle::from_raw(state.next_raw());
        state.fences.insert(handle, FenceState { signaled });
        Ok(handle)
    }

    fn wait_fence(&self, fence: FenceHandle, _timeout: Duration) -> GraphicsResult<bool> {
        let mut state = self.state.lock();
        let signaled = state
            .fences
            .get(&fence)
            .map(|f| f.signaled)
            .ok_or_else(|| GraphicsError::InvalidParameter(format!("unknown fence {fence:?}")))?;
        // An unsignaled fence with no submission behind it never signals.
        Ok(signaled || state.complete_fence(fence))
    }

    fn reset_fence(&self, fence: FenceHandle) -> GraphicsResult<()> {
        let mut state = self.state.lock();
        if state.in_flight.iter().any(|f| f.fence == Some(fence)) {
            return Err(GraphicsError::InvalidParameter(format!(
                "fence {fence:?} reset while its submission is in flight"
            )));
        }
        let entry = state
            .fences
            .get_mut(&fence)
            .ok_or_else(|| GraphicsError::InvalidParameter(format!("unknown fence {fence:?}")))?;
        entry.signaled = false;
        Ok(())
    }

    fn is_fence_signaled(&self, fence: FenceHandle) -> GraphicsResult<bool> {
        self.wait_fence(fence, Duration::ZERO)
    }

    fn destroy_fence(&self, fence: FenceHandle) {
        self.state.lock().fences.remove(&fence);
    }

    fn create_semaphore(&self) -> GraphicsResult<SemaphoreHandle> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_next_semaphore) {
            return Err(GraphicsError::OutOfMemory);
        }
        let handle = SemaphoreHandle::from_raw(state.next_raw());
        state.semaphores.insert(handle);
        Ok(handle)
    }

    fn destroy_semaphore(&self, semaphore: SemaphoreHandle) {
        let mut state = self.state.lock();
        if state.semaphores.remove(&semaphore) {
            state.destroyed_semaphores.push(semaphore);
        }
    }

    fn submit(&self, submission: &Submission<'_>) -> GraphicsResult<()> {
        let mut state = self.state.lock();
        match state.command_buffers.get(&submission.command_buffer) {
            Some(queue) if *queue == submission.queue => {}
            Some(queue) => {
                return Err(GraphicsError::InvalidParameter(format!(
                    "command buffer for the {} queue submitted to {}",
                    queue.name(),
                    submission.queue.name()
                )));
            }
            None => {
                return Err(GraphicsError::InvalidParameter(format!(
                    "unknown command buffer {:?}",
                    submission.command_buffer
                )));
            }
        }
        if let Some(fence) = submission.fence {
            let state_fence = state.fences.get_mut(&fence).ok_or_else(|| {
                GraphicsError::InvalidParameter(format!("unknown fence {fence:?}"))
            })?;
            if state_fence.signaled {
                return Err(GraphicsError::InvalidParameter(format!(
                    "fence {fence:?} submitted while still signaled"
                )));
            }
        }
        for wait in submission.waits {
            if !state.semaphores.contains(&wait.semaphore) {
                return Err(GraphicsError::InvalidParameter(format!(
                    "wait on destroyed semaphore {:?}",
                    wait.semaphore
                )));
            }
        }

        state.validate_copies(submission.commands)?;

        let (buffers, images) = state.referenced_resources(submission.commands);
        let index = state.submissions.len();
        state.submissions.push(RecordedSubmission {
            queue: submission.queue,
            command_buffer: submission.command_buffer,
            commands: submission.commands.clone(),
            waits: submission.waits.to_vec(),
            signals: submission.signals.to_vec(),
            fence: submission.fence,
        });
        state.in_flight.push(InFlight {
            submission: index,
            queue: submission.queue,
            fence: submission.fence,
            buffers,
            images,
        });
        state.events.push(BackendEvent::Submit {
            queue: submission.queue,
        });
        Ok(())
    }

    fn acquire_next_image(&self, signal: SemaphoreHandle) -> GraphicsResult<u32> {
        let mut state = self.state.lock();
        if !state.semaphores.contains(&signal) {
            return Err(GraphicsError::InvalidParameter(format!(
                "acquire signals unknown semaphore {signal:?}"
            )));
        }
        if state.surface_extent != state.swapchain.extent {
            state.events.push(BackendEvent::AcquireOutdated);
            return Err(GraphicsError::SurfaceOutdated);
        }
        let image_index = state.next_image;
        state.next_image = (image_index + 1) % state.swapchain.image_count;
        state.events.push(BackendEvent::Acquire { image_index });
        Ok(image_index)
    }

    fn present(&self, image_index: u32, wait: SemaphoreHandle) -> GraphicsResult<()> {
        let mut state = self.state.lock();
        if !state.semaphores.contains(&wait) {
            return Err(GraphicsError::InvalidParameter(format!(
                "present waits on unknown semaphore {wait:?}"
            )));
        }
        if std::mem::take(&mut state.fail_next_present)
            || state.surface_extent != state.swapchain.extent
        {
            state.events.push(BackendEvent::PresentOutdated);
            return Err(GraphicsError::SurfaceOutdated);
        }
        state.events.push(BackendEvent::Present { image_index });
        Ok(())
    }

    fn recreate_swapchain(&self, extent: Extent2d) -> GraphicsResult<SwapchainInfo> {
        let mut state = self.state.lock();
        if !state.in_flight.is_empty() {
            return Err(GraphicsError::Internal(
                "swapchain recreated while submissions are in flight".to_string(),
            ));
        }
        state.swapchain.extent = extent;
        state.next_image = 0;
        state.events.push(BackendEvent::Recreate { extent });
        Ok(state.swapchain)
    }

    fn swapchain_info(&self) -> SwapchainInfo {
        self.state.lock().swapchain
    }

    fn wait_idle(&self) -> GraphicsResult<()> {
        let mut state = self.state.lock();
        state.complete_all();
        state.events.push(BackendEvent::WaitIdle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandList;

    fn host_buffer(backend: &DummyBackend, size: u64) -> BufferHandle {
        backend
            .create_buffer(&BufferDescriptor::new(
                size,
                BufferUsage::STORAGE | BufferUsage::HOST_WRITE,
            ))
            .unwrap()
    }

    fn submit_touching(
        backend: &DummyBackend,
        buffer: BufferHandle,
        fence: Option<FenceHandle>,
    ) {
        let cmd = backend.create_command_buffer(QueueKind::Compute).unwrap();
        let mut list = CommandList::new();
        list.fill_buffer(buffer, 0, 4, 0);
        backend
            .submit(&Submission {
                queue: QueueKind::Compute,
                command_buffer: cmd,
                commands: &list,
                waits: &[],
                signals: &[],
                fence,
            })
            .unwrap();
    }

    #[test]
    fn test_write_after_fence_wait_is_clean() {
        let backend = DummyBackend::new();
        let buffer = host_buffer(&backend, 16);
        let fence = backend.create_fence(false).unwrap();

        submit_touching(&backend, buffer, Some(fence));
        assert!(backend.wait_fence(fence, Duration::from_secs(1)).unwrap());
        backend.write_buffer(buffer, 0, &[1, 2, 3, 4]).unwrap();

        assert!(backend.hazards().is_empty());
        assert_eq!(backend.buffer_contents(buffer).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_write_in_flight_is_a_hazard() {
        let backend = DummyBackend::new();
        let buffer = host_buffer(&backend, 16);
        let fence = backend.create_fence(false).unwrap();

        submit_touching(&backend, buffer, Some(fence));
        backend.write_buffer(buffer, 0, &[0; 4]).unwrap();

        assert_eq!(
            backend.hazards(),
            vec![Hazard::WriteInFlight {
                buffer,
                submission: 0
            }]
        );
    }

    #[test]
    fn test_fence_completes_earlier_work_on_same_queue() {
        let backend = DummyBackend::new();
        let buffer = host_buffer(&backend, 16);
        let fence = backend.create_fence(false).unwrap();

        submit_touching(&backend, buffer, None);
        submit_touching(&backend, buffer, Some(fence));
        assert_eq!(backend.in_flight_count(), 2);
        assert!(backend.is_fence_signaled(fence).unwrap());
        assert_eq!(backend.in_flight_count(), 0);
    }

    #[test]
    fn test_unsubmitted_fence_times_out() {
        let backend = DummyBackend::new();
        let fence = backend.create_fence(false).unwrap();
        assert!(!backend.wait_fence(fence, Duration::from_millis(1)).unwrap());
    }

    #[test]
    fn test_resize_makes_acquire_stale() {
        let backend = DummyBackend::with_surface(Extent2d::new(100, 100));
        let semaphore = backend.create_semaphore().unwrap();
        assert_eq!(backend.acquire_next_image(semaphore).unwrap(), 0);

        backend.set_surface_extent(Extent2d::new(200, 100));
        assert_eq!(
            backend.acquire_next_image(semaphore),
            Err(GraphicsError::SurfaceOutdated)
        );
        backend.recreate_swapchain(Extent2d::new(200, 100)).unwrap();
        assert_eq!(backend.acquire_next_image(semaphore).unwrap(), 0);
    }

    #[test]
    fn test_write_rejects_overflow_and_device_local() {
        let backend = DummyBackend::new();
        let buffer = host_buffer(&backend, 8);
        assert!(backend.write_buffer(buffer, 4, &[0; 8]).is_err());

        let device_local = backend
            .create_buffer(&BufferDescriptor::new(8, BufferUsage::STORAGE))
            .unwrap();
        assert!(backend.write_buffer(device_local, 0, &[0; 4]).is_err());
    }
}
