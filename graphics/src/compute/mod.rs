//! Compute queue work.
//!
//! Three stages are recorded into the compute list of every frame, always
//! in this order:
//!
//! | Stage | Reads | Writes |
//! |-------|-------|--------|
//! | [`skinning`] | instances, animation blends, frame pool, bones | bone matrices |
//! | [`particles`] | previous slot's particles, emitters | current slot's particles |
//! | [`bitonic`] depth sort | current particles | current particles, draw-indirect count |
//!
//! The graphics submission waits on the slot's `compute_finished`
//! semaphore, which orders all of it before any vertex shader or indirect
//! draw of the same frame.

pub mod bitonic;
pub mod particles;
pub mod skinning;

pub use bitonic::{BitonicSchedule, DepthSort, SortStep, sort_host};
pub use particles::{
    PARTICLE_WORKGROUP, ParticleSimulation, ParticleStage, clamp_emission, prepare_emitters,
};
pub use skinning::{
    SKINNING_WORKGROUP, SkinningPacket, SkinningStage, blend_local_pose, skin_instance,
};

use ember_core::profiling::profile_scope;
use glam::Mat4;

use crate::backend::GpuBackend;
use crate::command::{Access, Barrier, CommandList, PipelineStages};
use crate::config::RendererConfig;
use crate::error::GraphicsResult;
use crate::frame::{FrameContext, FrameSlot};
use crate::resources::ResourcePool;
use crate::shader::ShaderSource;
use crate::types::EmitterData;

/// CPU-side inputs of one frame's compute work.
#[derive(Debug, Clone, Copy)]
pub struct ComputeInputs<'a> {
    pub skinning: &'a SkinningPacket,
    /// Already clamped to the particle capacity.
    pub emitters: &'a [EmitterData],
    /// Camera view matrix, for particle sort depth.
    pub view: Mat4,
    pub delta_time: f32,
}

/// Skinning, particles and depth sort.
pub struct ComputeSubsystem {
    skinning: SkinningStage,
    particles: ParticleStage,
    sort: DepthSort,
}

impl ComputeSubsystem {
    /// Create every pipeline and the binding sets of each frame slot.
    pub fn new(
        backend: &dyn GpuBackend,
        shaders: &dyn ShaderSource,
        slots: &[FrameSlot],
        pool: &ResourcePool,
        config: &RendererConfig,
    ) -> GraphicsResult<Self> {
        let skinning = SkinningStage::new(
            backend,
            shaders,
            slots,
            pool.animation_frame_buffer().buffer(),
            pool.bone_buffer().buffer(),
            config.skinning.max_bones,
        )?;
        let particles =
            match ParticleStage::new(backend, shaders, slots, config.particles.max_particles) {
                Ok(particles) => particles,
                Err(e) => {
                    skinning.destroy(backend);
                    return Err(e);
                }
            };
        let sort = match DepthSort::new(
            backend,
            shaders,
            slots,
            config.particles.max_particles,
            config.particles.sort_workgroup_size,
        ) {
            Ok(sort) => sort,
            Err(e) => {
                skinning.destroy(backend);
                particles.destroy(backend);
                return Err(e);
            }
        };

        log::info!(
            "Compute subsystem ready: {} particles, sort in {} steps",
            config.particles.max_particles,
            sort.schedule().steps().len()
        );
        Ok(Self {
            skinning,
            particles,
            sort,
        })
    }

    pub fn sort_schedule(&self) -> &BitonicSchedule {
        self.sort.schedule()
    }

    /// Write this frame's records into the slot and record every stage.
    pub fn record(
        &self,
        ctx: &FrameContext<'_>,
        inputs: &ComputeInputs<'_>,
        commands: &mut CommandList,
    ) -> GraphicsResult<()> {
        {
            profile_scope!("skinning");
            self.skinning.write(ctx.backend, ctx.slot, inputs.skinning)?;
            self.skinning
                .record(ctx.slot, inputs.skinning.instance_count(), commands);
            if inputs.skinning.instance_count() > 0 {
                commands.barrier(
                    Barrier::new(PipelineStages::COMPUTE_SHADER, PipelineStages::COMPUTE_SHADER)
                        .buffer(
                            ctx.slot.buffers.bone_matrices,
                            Access::SHADER_WRITE,
                            Access::SHADER_READ,
                        ),
                );
            }
        }
        {
            profile_scope!("particles");
            self.particles.write(ctx.backend, ctx.slot, inputs.emitters)?;
            self.particles
                .record(ctx, inputs.emitters, &inputs.view, inputs.delta_time, commands);
            commands.barrier(
                Barrier::new(PipelineStages::COMPUTE_SHADER, PipelineStages::COMPUTE_SHADER)
                    .buffer(
                        ctx.slot.buffers.particles,
                        Access::SHADER_WRITE,
                        Access::SHADER_READ | Access::SHADER_WRITE,
                    ),
            );
        }
        {
            profile_scope!("depth_sort");
            self.sort.record(ctx.slot, commands);
        }
        log::trace!(
            "Frame {}: compute recorded ({} skinned, {} emitters, {} commands)",
            ctx.frame_index,
            inputs.skinning.instance_count(),
            inputs.emitters.len(),
            commands.len()
        );
        Ok(())
    }

    pub fn destroy(self, backend: &dyn GpuBackend) {
        self.skinning.destroy(backend);
        self.particles.destroy(backend);
        self.sort.destroy(backend);
    }
}
