//! CPU side of a frame: batches plus the instance records that back them.

use crate::backend::GpuBackend;
use crate::config::InstanceConfig;
use crate::error::GraphicsResult;
use crate::frame::FrameSlot;
use crate::resources::{Mesh, ResourcePool, SkeletalMesh};
use crate::types::{LineVertex, SceneUniforms, SpriteInstanceData, StaticInstanceData};

use super::batch::{BatchBuilder, BatchPlan, SpriteBatch, batch_sprites};
use super::jobs::FrameJobs;

/// Everything the graph draws this frame, in instance buffer order.
#[derive(Debug, Default)]
pub struct FramePlan {
    pub static_batches: BatchPlan<Mesh>,
    pub skeletal_batches: BatchPlan<SkeletalMesh>,
    pub sprite_batches: Vec<SpriteBatch>,
    /// Glyph sprites, stored after the plain sprites.
    pub text_batches: Vec<SpriteBatch>,
    static_instances: Vec<StaticInstanceData>,
    sprites: Vec<SpriteInstanceData>,
    lines: Vec<LineVertex>,
}

impl FramePlan {
    /// Batch `jobs` within the capacities of `instances`. Skeletal jobs are
    /// capped at `max_skeletal_instances`.
    pub fn build(
        jobs: &FrameJobs,
        pool: &ResourcePool,
        instances: &InstanceConfig,
        max_skeletal_instances: u32,
    ) -> Self {
        let static_batches =
            BatchBuilder::build(&jobs.static_jobs, instances.max_static_instances, "static");
        let static_instances = static_batches
            .order
            .iter()
            .map(|&i| {
                let job = &jobs.static_jobs[i];
                StaticInstanceData::new(job.transform, job.color)
            })
            .collect();

        let skeletal_batches =
            BatchBuilder::build(&jobs.skeletal_jobs, max_skeletal_instances, "skeletal");

        let (sprite_batches, sprite_order) = batch_sprites(&jobs.sprites, instances.max_sprites);
        let mut sprites: Vec<SpriteInstanceData> =
            sprite_order.iter().map(|&i| jobs.sprites[i].sprite).collect();

        let mut text_batches = Vec::new();
        let mut dropped_glyphs = 0usize;
        for text in &jobs.texts {
            let Some(font) = pool.try_get_font_atlas(text.font) else {
                log::warn!("Text job references unknown font {}", text.font);
                continue;
            };
            let mut glyphs = font.layout(&text.text, text.origin, text.height, text.color);
            let room = (instances.max_sprites as usize).saturating_sub(sprites.len());
            if glyphs.len() > room {
                dropped_glyphs += glyphs.len() - room;
                glyphs.truncate(room);
            }
            if glyphs.is_empty() {
                continue;
            }
            text_batches.push(SpriteBatch {
                material: font.material(),
                first_instance: sprites.len() as u32,
                instance_count: glyphs.len() as u32,
            });
            sprites.extend(glyphs);
        }
        if dropped_glyphs > 0 {
            log::warn!(
                "Sprite buffer full ({}), dropped {} glyphs",
                instances.max_sprites,
                dropped_glyphs
            );
        }

        let line_capacity = instances.max_lines as usize;
        if jobs.lines.len() > line_capacity {
            log::warn!(
                "{} debug lines exceed the capacity of {}, dropping {}",
                jobs.lines.len(),
                line_capacity,
                jobs.lines.len() - line_capacity
            );
        }
        let lines = jobs
            .lines
            .iter()
            .take(line_capacity)
            .flat_map(|line| line.vertices())
            .collect();

        Self {
            static_batches,
            skeletal_batches,
            sprite_batches,
            text_batches,
            static_instances,
            sprites,
            lines,
        }
    }

    pub fn static_instances(&self) -> &[StaticInstanceData] {
        &self.static_instances
    }

    pub fn sprite_instances(&self) -> &[SpriteInstanceData] {
        &self.sprites
    }

    pub fn line_vertex_count(&self) -> u32 {
        self.lines.len() as u32
    }

    /// Copy the uniforms and instance records into the slot's buffers.
    pub fn write(
        &self,
        backend: &dyn GpuBackend,
        slot: &FrameSlot,
        uniforms: &SceneUniforms,
    ) -> GraphicsResult<()> {
        let buffers = &slot.buffers;
        backend.write_buffer(buffers.uniforms, 0, bytemuck::bytes_of(uniforms))?;
        if !self.static_instances.is_empty() {
            backend.write_buffer(
                buffers.static_instances,
                0,
                bytemuck::cast_slice(&self.static_instances),
            )?;
        }
        if !self.sprites.is_empty() {
            backend.write_buffer(buffers.sprites, 0, bytemuck::cast_slice(&self.sprites))?;
        }
        if !self.lines.is_empty() {
            backend.write_buffer(buffers.lines, 0, bytemuck::cast_slice(&self.lines))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ember_core::Handle;
    use glam::{Mat4, Vec3, Vec4};

    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::config::SkinningConfig;
    use crate::graph::jobs::StaticRenderJob;

    fn pool(backend: &DummyBackend) -> ResourcePool {
        ResourcePool::new(backend, &SkinningConfig::default()).unwrap()
    }

    #[test]
    fn test_static_instances_follow_batch_order() {
        let backend = DummyBackend::new();
        let pool = pool(&backend);
        let mut jobs = FrameJobs::new();
        let a = Mat4::from_translation(Vec3::X);
        let b = Mat4::from_translation(Vec3::Y);
        let c = Mat4::from_translation(Vec3::Z);
        jobs.add_static(StaticRenderJob::new(Handle::from_raw(1), Handle::from_raw(1), a));
        jobs.add_static(StaticRenderJob::new(Handle::from_raw(2), Handle::from_raw(1), b));
        jobs.add_static(StaticRenderJob::new(Handle::from_raw(1), Handle::from_raw(1), c));

        let plan = FramePlan::build(&jobs, &pool, &InstanceConfig::default(), 16);
        let models: Vec<Mat4> = plan.static_instances().iter().map(|i| i.model).collect();
        assert_eq!(models, vec![a, c, b]);
        assert_eq!(plan.static_batches.batches.len(), 2);
    }

    #[test]
    fn test_lines_are_capped() {
        let backend = DummyBackend::new();
        let pool = pool(&backend);
        let mut jobs = FrameJobs::new();
        for _ in 0..5 {
            jobs.add_line(Vec3::ZERO, Vec3::ONE, Vec4::ONE);
        }
        let config = InstanceConfig {
            max_lines: 3,
            ..Default::default()
        };
        let plan = FramePlan::build(&jobs, &pool, &config, 16);
        assert_eq!(plan.line_vertex_count(), 6);
    }

    #[test]
    fn test_unknown_font_is_skipped() {
        let backend = DummyBackend::new();
        let pool = pool(&backend);
        let mut jobs = FrameJobs::new();
        jobs.add_text(Handle::from_raw(9), "hi", [0.0, 0.0], 16.0, [1.0; 4]);
        let plan = FramePlan::build(&jobs, &pool, &InstanceConfig::default(), 16);
        assert!(plan.text_batches.is_empty());
        assert!(plan.sprite_instances().is_empty());
    }
}
