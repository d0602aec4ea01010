//! Per-frame resources.

use crate::backend::{
    BufferHandle, CommandBufferHandle, FenceHandle, GpuBackend, QueueKind, SemaphoreHandle,
};
use crate::config::RendererConfig;
use crate::error::GraphicsResult;
use crate::resources::GpuResource;
use crate::types::{
    AnimationInstanceData, BufferDescriptor, BufferUsage, DrawIndirectCommand, EmitterData,
    LineVertex, ParticleData, ParticleHeader, SceneUniforms, SkeletalInstanceData,
    SpriteInstanceData, StaticInstanceData,
};

/// Vertices per particle quad.
pub const PARTICLE_QUAD_VERTICES: u32 = 6;

/// Buffers a frame writes from the CPU or produces on the GPU.
///
/// Each slot owns its own set, so the CPU can fill slot `i` while the GPU is
/// still reading slot `i - 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameBuffers {
    pub uniforms: BufferHandle,
    pub static_instances: BufferHandle,
    pub skeletal_instances: BufferHandle,
    pub animation_instances: BufferHandle,
    /// Skinned bone matrices written by the skinning dispatch,
    /// `max_bones` matrices per skeletal instance.
    pub bone_matrices: BufferHandle,
    pub sprites: BufferHandle,
    /// [`ParticleHeader`] followed by `max_particles` [`ParticleData`].
    pub particles: BufferHandle,
    pub emitters: BufferHandle,
    /// One [`DrawIndirectCommand`] drawing the live particles.
    pub draw_indirect: BufferHandle,
    pub lines: BufferHandle,
}

impl FrameBuffers {
    /// Size in bytes of a particle buffer holding `capacity` particles.
    pub fn particle_buffer_size(capacity: u32) -> u64 {
        ParticleHeader::SIZE + u64::from(capacity) * std::mem::size_of::<ParticleData>() as u64
    }

    fn create(
        backend: &dyn GpuBackend,
        config: &RendererConfig,
        index: usize,
        created: &mut Vec<GpuResource>,
    ) -> GraphicsResult<Self> {
        let host = BufferUsage::HOST_WRITE;
        let storage = BufferUsage::STORAGE;
        let mut buffer = |name: &str, size: u64, usage: BufferUsage| -> GraphicsResult<BufferHandle> {
            let handle = backend.create_buffer(
                &BufferDescriptor::new(size, usage).with_label(format!("frame {index} {name}")),
            )?;
            created.push(GpuResource::Buffer(handle));
            Ok(handle)
        };

        let instances = &config.instances;
        let skinning = &config.skinning;
        let particles = &config.particles;

        let buffers = Self {
            uniforms: buffer(
                "uniforms",
                size_of_n::<SceneUniforms>(1),
                BufferUsage::UNIFORM | host,
            )?,
            static_instances: buffer(
                "static instances",
                size_of_n::<StaticInstanceData>(instances.max_static_instances),
                storage | host,
            )?,
            skeletal_instances: buffer(
                "skeletal instances",
                size_of_n::<SkeletalInstanceData>(skinning.max_skeletal_instances),
                storage | host,
            )?,
            animation_instances: buffer(
                "animation instances",
                size_of_n::<AnimationInstanceData>(skinning.max_animation_instances),
                storage | host,
            )?,
            bone_matrices: buffer(
                "bone matrices",
                size_of_n::<glam::Mat4>(skinning.max_skeletal_instances)
                    * u64::from(skinning.max_bones),
                storage,
            )?,
            sprites: buffer(
                "sprites",
                size_of_n::<SpriteInstanceData>(instances.max_sprites),
                storage | host,
            )?,
            particles: buffer(
                "particles",
                Self::particle_buffer_size(particles.max_particles),
                storage | BufferUsage::COPY_SRC | BufferUsage::COPY_DST,
            )?,
            emitters: buffer(
                "emitters",
                size_of_n::<EmitterData>(particles.max_emitters),
                storage | host,
            )?,
            draw_indirect: buffer(
                "particle draw",
                DrawIndirectCommand::SIZE,
                BufferUsage::INDIRECT | BufferUsage::COPY_DST | host,
            )?,
            lines: buffer(
                "lines",
                size_of_n::<LineVertex>(instances.max_lines) * 2,
                BufferUsage::VERTEX | host,
            )?,
        };

        // Only instance_count changes per frame; the compute queue copies it in.
        let draw = DrawIndirectCommand::new(PARTICLE_QUAD_VERTICES, 0);
        backend.write_buffer(buffers.draw_indirect, 0, bytemuck::bytes_of(&draw))?;
        Ok(buffers)
    }
}

fn size_of_n<T>(count: u32) -> u64 {
    std::mem::size_of::<T>() as u64 * u64::from(count)
}

/// One of the [`FRAME_OVERLAP`](crate::config::FRAME_OVERLAP) sets of
/// per-frame command buffers, synchronization objects and buffers.
#[derive(Debug)]
pub struct FrameSlot {
    pub index: usize,
    pub graphics_commands: CommandBufferHandle,
    pub compute_commands: CommandBufferHandle,
    /// Signalled by acquire, waited on by the graphics submission.
    pub image_available: SemaphoreHandle,
    /// Signalled by the compute submission, waited on by graphics.
    pub compute_finished: SemaphoreHandle,
    /// Signalled by the graphics submission, waited on by present.
    pub render_finished: SemaphoreHandle,
    pub compute_fence: FenceHandle,
    pub graphics_fence: FenceHandle,
    pub buffers: FrameBuffers,
    /// Transition semaphores waited on by this slot's last graphics submission.
    retired_semaphores: Vec<SemaphoreHandle>,
}

impl FrameSlot {
    /// Allocate a slot. Fences start signalled so the first wait returns.
    pub fn create(
        backend: &dyn GpuBackend,
        config: &RendererConfig,
        index: usize,
    ) -> GraphicsResult<Self> {
        let mut created = Vec::new();
        match Self::create_tracked(backend, config, index, &mut created) {
            Ok(slot) => Ok(slot),
            Err(e) => {
                for resource in created.into_iter().rev() {
                    resource.destroy(backend);
                }
                Err(e)
            }
        }
    }

    fn create_tracked(
        backend: &dyn GpuBackend,
        config: &RendererConfig,
        index: usize,
        created: &mut Vec<GpuResource>,
    ) -> GraphicsResult<Self> {
        let graphics_commands = backend.create_command_buffer(QueueKind::Graphics)?;
        created.push(GpuResource::CommandBuffer(graphics_commands));
        let compute_commands = backend.create_command_buffer(QueueKind::Compute)?;
        created.push(GpuResource::CommandBuffer(compute_commands));

        let mut semaphore = || -> GraphicsResult<SemaphoreHandle> {
            let handle = backend.create_semaphore()?;
            created.push(GpuResource::Semaphore(handle));
            Ok(handle)
        };
        let image_available = semaphore()?;
        let compute_finished = semaphore()?;
        let render_finished = semaphore()?;

        let compute_fence = backend.create_fence(true)?;
        created.push(GpuResource::Fence(compute_fence));
        let graphics_fence = backend.create_fence(true)?;
        created.push(GpuResource::Fence(graphics_fence));

        let buffers = FrameBuffers::create(backend, config, index, created)?;

        log::debug!("Created frame slot {}", index);
        Ok(Self {
            index,
            graphics_commands,
            compute_commands,
            image_available,
            compute_finished,
            render_finished,
            compute_fence,
            graphics_fence,
            buffers,
            retired_semaphores: Vec::new(),
        })
    }

    /// Remember transition semaphores this slot's submission waits on.
    pub fn retire_semaphores(&mut self, semaphores: impl IntoIterator<Item = SemaphoreHandle>) {
        self.retired_semaphores.extend(semaphores);
    }

    /// Hand back the semaphores from the slot's previous use. Only valid once
    /// the slot's fences have been waited on.
    pub fn take_retired_semaphores(&mut self) -> Vec<SemaphoreHandle> {
        std::mem::take(&mut self.retired_semaphores)
    }

    /// Every backend object the slot owns.
    pub fn gpu_resources(&self) -> Vec<GpuResource> {
        let b = &self.buffers;
        let mut resources = vec![
            GpuResource::CommandBuffer(self.graphics_commands),
            GpuResource::CommandBuffer(self.compute_commands),
            GpuResource::Semaphore(self.image_available),
            GpuResource::Semaphore(self.compute_finished),
            GpuResource::Semaphore(self.render_finished),
            GpuResource::Fence(self.compute_fence),
            GpuResource::Fence(self.graphics_fence),
        ];
        resources.extend(
            [
                b.uniforms,
                b.static_instances,
                b.skeletal_instances,
                b.animation_instances,
                b.bone_matrices,
                b.sprites,
                b.particles,
                b.emitters,
                b.draw_indirect,
                b.lines,
            ]
            .into_iter()
            .map(GpuResource::Buffer),
        );
        resources.extend(self.retired_semaphores.iter().copied().map(GpuResource::Semaphore));
        resources
    }

    /// Destroy the slot. The device must be idle.
    pub fn destroy(self, backend: &dyn GpuBackend) {
        for resource in self.gpu_resources() {
            resource.destroy(backend);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;

    #[test]
    fn test_slot_fences_start_signaled() {
        let backend = DummyBackend::new();
        let slot = FrameSlot::create(&backend, &RendererConfig::default(), 0).unwrap();
        assert!(backend.is_fence_signaled(slot.compute_fence).unwrap());
        assert!(backend.is_fence_signaled(slot.graphics_fence).unwrap());
    }

    #[test]
    fn test_indirect_draw_initialized() {
        let backend = DummyBackend::new();
        let slot = FrameSlot::create(&backend, &RendererConfig::default(), 1).unwrap();
        let bytes = backend.buffer_contents(slot.buffers.draw_indirect).unwrap();
        let draw: DrawIndirectCommand = bytemuck::pod_read_unaligned(&bytes);
        assert_eq!(draw, DrawIndirectCommand::new(PARTICLE_QUAD_VERTICES, 0));
    }

    #[test]
    fn test_particle_buffer_layout() {
        assert_eq!(FrameBuffers::particle_buffer_size(4), 16 + 4 * 64);
    }

    #[test]
    fn test_destroy_releases_everything() {
        let backend = DummyBackend::new();
        let mut slot = FrameSlot::create(&backend, &RendererConfig::default(), 0).unwrap();
        let extra = backend.create_semaphore().unwrap();
        slot.retire_semaphores([extra]);
        slot.destroy(&backend);
        assert_eq!(backend.live_buffer_count(), 0);
        assert_eq!(backend.live_semaphore_count(), 0);
    }
}
