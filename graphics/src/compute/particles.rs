//! GPU particle simulation.
//!
//! Particles live only on the GPU, in one buffer per frame slot: a 16-byte
//! header holding the live count followed by `max_particles` records. Each
//! frame ping-pongs between the previous slot's buffer and the current one:
//!
//! ```text
//! fill     current.count = 0
//! update   previous[0..previous.count] --(age, move, cull)--> current
//! emit     emitter i appends up to spawn_count particles to current
//! ```
//!
//! The CPU never learns the live count. It only caps the total requested
//! spawn count at the capacity; the kernels clamp against the live count
//! with an atomic. [`ParticleSimulation`] runs the same update and emit
//! rules on the CPU.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

use crate::backend::{Binding, BindingResource, BindingSetHandle, GpuBackend, PipelineHandle};
use crate::command::{Access, Barrier, CommandList, PipelineStages};
use crate::config::{FRAME_OVERLAP, ParticleConfig};
use crate::error::GraphicsResult;
use crate::frame::{FrameContext, FrameSlot};
use crate::graph::EmitterJob;
use crate::shader::{names, ShaderSource};
use crate::types::{
    BindingLayoutDescriptor, BindingType, ComputePipelineDescriptor, EmitterData, ParticleData,
    ShaderStages,
};

/// Invocations per particle workgroup.
pub const PARTICLE_WORKGROUP: u32 = 64;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
struct UpdatePushConstants {
    view: Mat4,
    delta_time: f32,
    capacity: u32,
    _pad: [u32; 2],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
struct EmitPushConstants {
    emitter_index: u32,
    capacity: u32,
    _pad: [u32; 2],
}

/// PCG hash, shared with the emit kernel.
pub fn pcg_hash(input: u32) -> u32 {
    let state = input.wrapping_mul(747_796_405).wrapping_add(2_891_336_453);
    let word = ((state >> ((state >> 28) + 4)) ^ state).wrapping_mul(277_803_737);
    (word >> 22) ^ word
}

fn unit_float(hash: u32) -> f32 {
    (hash >> 8) as f32 / (1u32 << 24) as f32
}

/// View-space depth of `position`, growing away from the camera.
pub fn view_depth(view: &Mat4, position: Vec3) -> f32 {
    -view.transform_point3(position).z
}

/// Initial velocity of the `index`th particle spawned by `emitter`: the
/// emitter velocity rotated into a random direction inside its cone.
pub fn spawn_velocity(emitter: &EmitterData, index: u32) -> Vec3 {
    let speed = emitter.velocity.length();
    let Some(axis) = emitter.velocity.try_normalize() else {
        return Vec3::ZERO;
    };

    let r1 = unit_float(pcg_hash(emitter.seed ^ index.wrapping_mul(2)));
    let r2 = unit_float(pcg_hash(emitter.seed ^ index.wrapping_mul(2).wrapping_add(1)));
    let cos_theta = 1.0 - r1 * (1.0 - emitter.spread.cos());
    let sin_theta = (1.0 - cos_theta * cos_theta).max(0.0).sqrt();
    let phi = std::f32::consts::TAU * r2;
    let (u, v) = axis.any_orthonormal_pair();
    (axis * cos_theta + (u * phi.cos() + v * phi.sin()) * sin_theta) * speed
}

/// Cap the summed spawn counts at `capacity`, trimming later emitters
/// first. Returns how many spawns were dropped.
pub fn clamp_emission(emitters: &mut [EmitterData], capacity: u32) -> u32 {
    let mut budget = capacity;
    let mut dropped = 0;
    for emitter in emitters.iter_mut() {
        let granted = emitter.spawn_count.min(budget);
        dropped += emitter.spawn_count - granted;
        emitter.spawn_count = granted;
        budget -= granted;
    }
    dropped
}

/// Turn this frame's emitter jobs into GPU records: at most `max_emitters`
/// of them, each seeded by frame, with emission clamped to the capacity.
pub fn prepare_emitters(
    jobs: &[EmitterJob],
    frame_index: u64,
    config: &ParticleConfig,
) -> Vec<EmitterData> {
    if jobs.len() > config.max_emitters as usize {
        log::warn!(
            "{} particle emitters exceed the limit of {}, dropping {}",
            jobs.len(),
            config.max_emitters,
            jobs.len() - config.max_emitters as usize
        );
    }
    let frame_seed = pcg_hash(frame_index as u32 ^ (frame_index >> 32) as u32);
    let mut emitters: Vec<EmitterData> = jobs
        .iter()
        .take(config.max_emitters as usize)
        .enumerate()
        .map(|(i, job)| job.to_gpu(pcg_hash(frame_seed ^ i as u32)))
        .collect();

    let dropped = clamp_emission(&mut emitters, config.max_particles);
    if dropped > 0 {
        log::debug!(
            "Frame {}: particle emission over capacity, dropped {} spawns",
            frame_index,
            dropped
        );
    }
    emitters.retain(|e| e.spawn_count > 0);
    emitters
}

/// CPU model of the particle kernels.
#[derive(Debug, Clone)]
pub struct ParticleSimulation {
    capacity: u32,
    particles: Vec<ParticleData>,
}

impl ParticleSimulation {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            particles: Vec::with_capacity(capacity as usize),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn live(&self) -> u32 {
        self.particles.len() as u32
    }

    pub fn particles(&self) -> &[ParticleData] {
        &self.particles
    }

    /// Age every particle by `delta_time`, cull the dead and move the rest.
    pub fn update(&mut self, delta_time: f32, view: &Mat4) {
        self.particles.retain_mut(|p| {
            p.age += delta_time;
            if !p.is_alive() {
                return false;
            }
            p.position += p.velocity * delta_time;
            p.depth = view_depth(view, p.position);
            true
        });
    }

    /// Spawn from `emitter` into the free capacity. Returns how many
    /// particles were spawned.
    pub fn emit(&mut self, emitter: &EmitterData, view: &Mat4) -> u32 {
        let spawned = emitter.spawn_count.min(self.capacity - self.live());
        for i in 0..spawned {
            let mut particle = ParticleData::new(
                emitter.position,
                spawn_velocity(emitter, i),
                emitter.lifetime,
                emitter.color,
                emitter.size,
            );
            particle.depth = view_depth(view, particle.position);
            self.particles.push(particle);
        }
        spawned
    }

    /// One frame: update, then every emitter in order.
    pub fn step(&mut self, delta_time: f32, view: &Mat4, emitters: &[EmitterData]) {
        self.update(delta_time, view);
        for emitter in emitters {
            self.emit(emitter, view);
        }
    }

    /// Sort keys of the whole buffer as the depth sort sees it: live depths,
    /// then `-inf` for every free record.
    pub fn sort_keys(&self) -> Vec<f32> {
        let mut keys: Vec<f32> = self.particles.iter().map(|p| p.depth).collect();
        keys.resize(self.capacity as usize, f32::NEG_INFINITY);
        keys
    }
}

/// The update and emit pipelines and their per-slot binding sets.
pub struct ParticleStage {
    update_pipeline: PipelineHandle,
    emit_pipeline: PipelineHandle,
    update_sets: Vec<BindingSetHandle>,
    emit_sets: Vec<BindingSetHandle>,
    capacity: u32,
}

impl ParticleStage {
    /// Set 0 of the update kernel: previous particles, current particles.
    pub fn update_layout() -> BindingLayoutDescriptor {
        BindingLayoutDescriptor::new()
            .with_entry(0, BindingType::StorageBuffer, ShaderStages::COMPUTE)
            .with_entry(1, BindingType::StorageBuffer, ShaderStages::COMPUTE)
            .with_label("particle update")
    }

    /// Set 0 of the emit kernel: current particles, emitters.
    pub fn emit_layout() -> BindingLayoutDescriptor {
        BindingLayoutDescriptor::new()
            .with_entry(0, BindingType::StorageBuffer, ShaderStages::COMPUTE)
            .with_entry(1, BindingType::StorageBuffer, ShaderStages::COMPUTE)
            .with_label("particle emit")
    }

    pub fn new(
        backend: &dyn GpuBackend,
        shaders: &dyn ShaderSource,
        slots: &[FrameSlot],
        capacity: u32,
    ) -> GraphicsResult<Self> {
        let update_pipeline = backend.create_compute_pipeline(
            &ComputePipelineDescriptor::new(shaders.load(names::PARTICLE_UPDATE)?)
                .with_label("particle update")
                .with_binding_layout(Self::update_layout())
                .with_push_constants(std::mem::size_of::<UpdatePushConstants>() as u32),
        )?;
        let emit_pipeline = shaders
            .load(names::PARTICLE_EMIT)
            .and_then(|words| {
                backend.create_compute_pipeline(
                    &ComputePipelineDescriptor::new(words)
                        .with_label("particle emit")
                        .with_binding_layout(Self::emit_layout())
                        .with_push_constants(std::mem::size_of::<EmitPushConstants>() as u32),
                )
            })
            .inspect_err(|_| backend.destroy_pipeline(update_pipeline))?;

        let mut stage = Self {
            update_pipeline,
            emit_pipeline,
            update_sets: Vec::with_capacity(slots.len()),
            emit_sets: Vec::with_capacity(slots.len()),
            capacity,
        };
        if let Err(e) = stage.create_binding_sets(backend, slots) {
            stage.destroy(backend);
            return Err(e);
        }
        Ok(stage)
    }

    fn create_binding_sets(
        &mut self,
        backend: &dyn GpuBackend,
        slots: &[FrameSlot],
    ) -> GraphicsResult<()> {
        for slot in slots {
            let previous = &slots[(slot.index + FRAME_OVERLAP - 1) % FRAME_OVERLAP];
            let current = slot.buffers.particles;
            self.update_sets.push(backend.create_binding_set(
                self.update_pipeline,
                0,
                &[
                    Binding::new(0, BindingResource::buffer(previous.buffers.particles)),
                    Binding::new(1, BindingResource::buffer(current)),
                ],
            )?);
            self.emit_sets.push(backend.create_binding_set(
                self.emit_pipeline,
                0,
                &[
                    Binding::new(0, BindingResource::buffer(current)),
                    Binding::new(1, BindingResource::buffer(slot.buffers.emitters)),
                ],
            )?);
        }
        Ok(())
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn write(
        &self,
        backend: &dyn GpuBackend,
        slot: &FrameSlot,
        emitters: &[EmitterData],
    ) -> GraphicsResult<()> {
        if emitters.is_empty() {
            return Ok(());
        }
        backend.write_buffer(slot.buffers.emitters, 0, bytemuck::cast_slice(emitters))
    }

    /// Record fill, update and one emit dispatch per emitter.
    pub fn record(
        &self,
        ctx: &FrameContext<'_>,
        emitters: &[EmitterData],
        view: &Mat4,
        delta_time: f32,
        commands: &mut CommandList,
    ) {
        let current = ctx.slot.buffers.particles;
        let previous = ctx.previous_slot.buffers.particles;

        commands.barrier(
            Barrier::new(
                PipelineStages::COMPUTE_SHADER | PipelineStages::TRANSFER,
                PipelineStages::COMPUTE_SHADER | PipelineStages::TRANSFER,
            )
            .buffer(
                previous,
                Access::SHADER_WRITE | Access::TRANSFER_WRITE,
                Access::SHADER_READ | Access::TRANSFER_WRITE,
            )
            .buffer(current, Access::SHADER_READ | Access::TRANSFER_READ, Access::TRANSFER_WRITE),
        );
        // Nothing has written the previous slot before the first frame.
        if ctx.frame_index == 0 {
            commands.fill_buffer(previous, 0, 4, 0);
        }
        commands.fill_buffer(current, 0, 4, 0);
        commands.barrier(
            Barrier::new(PipelineStages::TRANSFER, PipelineStages::COMPUTE_SHADER)
                .buffer(previous, Access::TRANSFER_WRITE, Access::SHADER_READ)
                .buffer(
                    current,
                    Access::TRANSFER_WRITE,
                    Access::SHADER_READ | Access::SHADER_WRITE,
                ),
        );

        commands.bind_pipeline(self.update_pipeline);
        commands.bind_binding_set(0, self.update_sets[ctx.slot.index]);
        commands.push_constants(&UpdatePushConstants {
            view: *view,
            delta_time,
            capacity: self.capacity,
            _pad: [0; 2],
        });
        commands.dispatch(self.capacity.div_ceil(PARTICLE_WORKGROUP), 1, 1);

        if emitters.is_empty() {
            return;
        }
        commands.barrier(
            Barrier::new(PipelineStages::COMPUTE_SHADER, PipelineStages::COMPUTE_SHADER).buffer(
                current,
                Access::SHADER_WRITE,
                Access::SHADER_READ | Access::SHADER_WRITE,
            ),
        );
        commands.bind_pipeline(self.emit_pipeline);
        commands.bind_binding_set(0, self.emit_sets[ctx.slot.index]);
        for (index, emitter) in emitters.iter().enumerate() {
            commands.push_constants(&EmitPushConstants {
                emitter_index: index as u32,
                capacity: self.capacity,
                _pad: [0; 2],
            });
            commands.dispatch(emitter.spawn_count.div_ceil(PARTICLE_WORKGROUP), 1, 1);
        }
    }

    pub fn destroy(self, backend: &dyn GpuBackend) {
        for set in self.update_sets.into_iter().chain(self.emit_sets) {
            backend.destroy_binding_set(set);
        }
        backend.destroy_pipeline(self.update_pipeline);
        backend.destroy_pipeline(self.emit_pipeline);
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec4;

    use super::*;

    fn emitter(spawn_count: u32) -> EmitterData {
        let mut data = EmitterData::new(Vec3::ZERO, Vec3::Y, spawn_count);
        data.lifetime = 1.0;
        data
    }

    #[test]
    fn test_clamp_emission_caps_total() {
        let mut emitters = [emitter(40), emitter(40), emitter(40)];
        let dropped = clamp_emission(&mut emitters, 64);
        let counts: Vec<u32> = emitters.iter().map(|e| e.spawn_count).collect();
        assert_eq!(counts, vec![40, 24, 0]);
        assert_eq!(dropped, 56);
    }

    #[test]
    fn test_prepare_emitters_limits_count() {
        let config = ParticleConfig {
            max_particles: 16,
            max_emitters: 2,
            sort_workgroup_size: 4,
        };
        let jobs = [
            EmitterJob::new(Vec3::ZERO, Vec3::Y, 10),
            EmitterJob::new(Vec3::ZERO, Vec3::Y, 10),
            EmitterJob::new(Vec3::ZERO, Vec3::Y, 10),
        ];
        let emitters = prepare_emitters(&jobs, 5, &config);
        assert_eq!(emitters.len(), 2);
        assert_eq!(emitters.iter().map(|e| e.spawn_count).sum::<u32>(), 16);
        assert_ne!(emitters[0].seed, emitters[1].seed);
    }

    #[test]
    fn test_live_count_never_exceeds_capacity() {
        let view = Mat4::IDENTITY;
        let mut sim = ParticleSimulation::new(64);
        let mut emitters = [emitter(50), emitter(50)];
        clamp_emission(&mut emitters, sim.capacity());

        for _ in 0..10 {
            sim.step(0.05, &view, &emitters);
            assert!(sim.live() <= sim.capacity());
        }
        assert_eq!(sim.live(), 64);
    }

    #[test]
    fn test_emit_clamps_against_live_count() {
        let view = Mat4::IDENTITY;
        let mut sim = ParticleSimulation::new(8);
        assert_eq!(sim.emit(&emitter(5), &view), 5);
        assert_eq!(sim.emit(&emitter(5), &view), 3);
        assert_eq!(sim.emit(&emitter(5), &view), 0);
    }

    #[test]
    fn test_dead_particles_are_culled() {
        let view = Mat4::IDENTITY;
        let mut sim = ParticleSimulation::new(16);
        sim.emit(&emitter(4), &view);
        sim.update(0.5, &view);
        assert_eq!(sim.live(), 4);
        assert!(sim.particles().iter().all(|p| (p.position.y - 0.5).abs() < 1e-3));

        sim.update(0.6, &view);
        assert_eq!(sim.live(), 0);
    }

    #[test]
    fn test_spawn_velocity_stays_in_cone() {
        let mut data = EmitterData::new(Vec3::ZERO, Vec3::new(0.0, 0.0, 3.0), 100);
        data.spread = 0.25;
        data.seed = 1234;
        for i in 0..100 {
            let v = spawn_velocity(&data, i);
            assert!((v.length() - 3.0).abs() < 1e-3);
            assert!(v.normalize().dot(Vec3::Z) >= 0.25f32.cos() - 1e-4);
        }
        assert_eq!(spawn_velocity(&EmitterData::new(Vec3::ZERO, Vec3::ZERO, 1), 0), Vec3::ZERO);
    }

    #[test]
    fn test_sort_keys_pad_with_negative_infinity() {
        let view = Mat4::from_translation(Vec3::new(0.0, 0.0, -5.0));
        let mut sim = ParticleSimulation::new(4);
        let mut data = emitter(1);
        data.color = Vec4::ONE;
        sim.emit(&data, &view);

        let keys = sim.sort_keys();
        assert_eq!(keys.len(), 4);
        assert!((keys[0] - 5.0).abs() < 1e-5);
        assert!(keys[1..].iter().all(|k| *k == f32::NEG_INFINITY));
    }
}
