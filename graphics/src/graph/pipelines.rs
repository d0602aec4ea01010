//! Graphics pipelines of the render graph and the binding layouts they share.
//!
//! | Set | Layout | Bound by |
//! |-----|--------|----------|
//! | 0 | [`frame_binding_layout`] | every scene pass, sprites |
//! | 1 | [`material_binding_layout`] | scene meshes, sprites |
//! | 2 | [`shadow_binding_layout`] | scene meshes |
//! | 3 | [`environment_binding_layout`] | scene meshes, skybox |
//!
//! The composite pass has its own set 0 with the HDR target and bloom.

use bytemuck::{Pod, Zeroable};

use crate::backend::{GpuBackend, PipelineHandle};
use crate::error::GraphicsResult;
use crate::resources::{environment_binding_layout, material_binding_layout};
use crate::shader::{names, ShaderSource};
use crate::types::{
    BindingLayoutDescriptor, BindingType, BlendMode, DepthTest, GraphicsPipelineDescriptor,
    ImageFormat, LineVertex, PrimitiveTopology, ShaderStages, SkinnedVertex, Vertex,
};

use super::target::{DEPTH_FORMAT, HDR_FORMAT};

/// Vertices per sprite quad.
pub const SPRITE_QUAD_VERTICES: u32 = 6;
/// Vertices of the fullscreen triangle used by composite and skybox.
pub const FULLSCREEN_VERTICES: u32 = 3;

/// Push constants of the skinned passes.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct SkinnedPushConstants {
    /// Bone matrices reserved per skeletal instance.
    pub max_bones: u32,
    pub _pad: [u32; 3],
}

/// Push constants of the sprite pass.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct SpritePushConstants {
    pub screen_size: [f32; 2],
    pub _pad: [f32; 2],
}

/// Push constants of the composite pass.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct CompositePushConstants {
    pub bloom_strength: f32,
    pub _pad: [f32; 3],
}

/// Per-slot frame data: uniforms and the instance buffers.
pub fn frame_binding_layout() -> BindingLayoutDescriptor {
    BindingLayoutDescriptor::new()
        .with_label("frame")
        .with_entry(0, BindingType::UniformBuffer, ShaderStages::GRAPHICS)
        .with_entry(1, BindingType::StorageBuffer, ShaderStages::VERTEX)
        .with_entry(2, BindingType::StorageBuffer, ShaderStages::VERTEX)
        .with_entry(3, BindingType::StorageBuffer, ShaderStages::VERTEX)
        .with_entry(4, BindingType::StorageBuffer, ShaderStages::VERTEX)
        .with_entry(5, BindingType::StorageBuffer, ShaderStages::VERTEX)
}

/// The shadow map, sampled with a depth comparison.
pub fn shadow_binding_layout() -> BindingLayoutDescriptor {
    BindingLayoutDescriptor::new()
        .with_label("shadow")
        .with_entry(0, BindingType::SampledImage, ShaderStages::FRAGMENT)
}

/// HDR scene color and the top bloom mip.
pub fn composite_binding_layout() -> BindingLayoutDescriptor {
    BindingLayoutDescriptor::new()
        .with_label("composite")
        .with_entry(0, BindingType::SampledImage, ShaderStages::FRAGMENT)
        .with_entry(1, BindingType::SampledImage, ShaderStages::FRAGMENT)
}

fn scene_layouts(descriptor: GraphicsPipelineDescriptor) -> GraphicsPipelineDescriptor {
    descriptor
        .with_binding_layout(frame_binding_layout())
        .with_binding_layout(material_binding_layout())
        .with_binding_layout(shadow_binding_layout())
        .with_binding_layout(environment_binding_layout())
}

/// Creates pipelines and remembers them so a failure part way through
/// can destroy what was already built.
struct PipelineBuilder<'a> {
    backend: &'a dyn GpuBackend,
    shaders: &'a dyn ShaderSource,
    created: Vec<PipelineHandle>,
}

impl PipelineBuilder<'_> {
    fn build(
        &mut self,
        label: &str,
        vertex: &str,
        fragment: Option<&str>,
        configure: impl FnOnce(GraphicsPipelineDescriptor) -> GraphicsPipelineDescriptor,
    ) -> GraphicsResult<PipelineHandle> {
        let mut descriptor =
            GraphicsPipelineDescriptor::new(self.shaders.load(vertex)?).with_label(label);
        if let Some(fragment) = fragment {
            descriptor = descriptor.with_fragment(self.shaders.load(fragment)?);
        }
        let pipeline = self.backend.create_graphics_pipeline(&configure(descriptor))?;
        self.created.push(pipeline);
        Ok(pipeline)
    }
}

/// Every graphics pipeline the graph binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphPipelines {
    pub shadow_static: PipelineHandle,
    pub shadow_skinned: PipelineHandle,
    pub scene_static: PipelineHandle,
    pub scene_skinned: PipelineHandle,
    pub skybox: PipelineHandle,
    pub particles: PipelineHandle,
    pub lines: PipelineHandle,
    pub composite: PipelineHandle,
    pub sprites: PipelineHandle,
}

impl GraphPipelines {
    /// Build every pipeline. Composite and sprites render to `surface_format`.
    pub fn new(
        backend: &dyn GpuBackend,
        shaders: &dyn ShaderSource,
        surface_format: ImageFormat,
    ) -> GraphicsResult<Self> {
        let mut builder = PipelineBuilder {
            backend,
            shaders,
            created: Vec::new(),
        };
        match Self::build(&mut builder, surface_format) {
            Ok(pipelines) => {
                log::debug!("Created {} graph pipelines", builder.created.len());
                Ok(pipelines)
            }
            Err(e) => {
                for pipeline in builder.created {
                    backend.destroy_pipeline(pipeline);
                }
                Err(e)
            }
        }
    }

    fn build(builder: &mut PipelineBuilder<'_>, surface_format: ImageFormat) -> GraphicsResult<Self> {
        let skinned_push = std::mem::size_of::<SkinnedPushConstants>() as u32;

        let shadow_static = builder.build("shadow static", names::SHADOW_VERT, None, |d| {
            d.with_vertex_layout(Vertex::layout())
                .with_binding_layout(frame_binding_layout())
                .with_depth(DEPTH_FORMAT, DepthTest::ReadWrite)
                .with_depth_bias()
        })?;
        let shadow_skinned =
            builder.build("shadow skinned", names::SHADOW_SKINNED_VERT, None, |d| {
                d.with_vertex_layout(SkinnedVertex::layout())
                    .with_binding_layout(frame_binding_layout())
                    .with_push_constants(skinned_push)
                    .with_depth(DEPTH_FORMAT, DepthTest::ReadWrite)
                    .with_depth_bias()
            })?;

        let scene_static =
            builder.build("scene static", names::STATIC_VERT, Some(names::PBR_FRAG), |d| {
                scene_layouts(d.with_vertex_layout(Vertex::layout()))
                    .with_color(HDR_FORMAT, BlendMode::Opaque)
                    .with_depth(DEPTH_FORMAT, DepthTest::ReadWrite)
                    .with_back_face_culling()
            })?;
        let scene_skinned =
            builder.build("scene skinned", names::SKINNED_VERT, Some(names::PBR_FRAG), |d| {
                scene_layouts(d.with_vertex_layout(SkinnedVertex::layout()))
                    .with_push_constants(skinned_push)
                    .with_color(HDR_FORMAT, BlendMode::Opaque)
                    .with_depth(DEPTH_FORMAT, DepthTest::ReadWrite)
                    .with_back_face_culling()
            })?;
        let skybox = builder.build("skybox", names::SKYBOX_VERT, Some(names::SKYBOX_FRAG), |d| {
            scene_layouts(d)
                .with_color(HDR_FORMAT, BlendMode::Opaque)
                .with_depth(DEPTH_FORMAT, DepthTest::ReadOnly)
        })?;
        let particles =
            builder.build("particles", names::PARTICLE_VERT, Some(names::PARTICLE_FRAG), |d| {
                d.with_binding_layout(frame_binding_layout())
                    .with_color(HDR_FORMAT, BlendMode::Additive)
                    .with_depth(DEPTH_FORMAT, DepthTest::ReadOnly)
            })?;
        let lines = builder.build("lines", names::LINE_VERT, Some(names::LINE_FRAG), |d| {
            d.with_vertex_layout(LineVertex::layout())
                .with_binding_layout(frame_binding_layout())
                .with_topology(PrimitiveTopology::LineList)
                .with_color(HDR_FORMAT, BlendMode::Opaque)
                .with_depth(DEPTH_FORMAT, DepthTest::ReadOnly)
        })?;

        let composite =
            builder.build("composite", names::FULLSCREEN_VERT, Some(names::COMPOSITE_FRAG), |d| {
                d.with_binding_layout(composite_binding_layout())
                    .with_push_constants(std::mem::size_of::<CompositePushConstants>() as u32)
                    .with_color(surface_format, BlendMode::Opaque)
            })?;
        let sprites = builder.build("sprites", names::SPRITE_VERT, Some(names::SPRITE_FRAG), |d| {
            d.with_binding_layout(frame_binding_layout())
                .with_binding_layout(material_binding_layout())
                .with_push_constants(std::mem::size_of::<SpritePushConstants>() as u32)
                .with_color(surface_format, BlendMode::Alpha)
        })?;

        Ok(Self {
            shadow_static,
            shadow_skinned,
            scene_static,
            scene_skinned,
            skybox,
            particles,
            lines,
            composite,
            sprites,
        })
    }

    pub fn all(&self) -> [PipelineHandle; 9] {
        [
            self.shadow_static,
            self.shadow_skinned,
            self.scene_static,
            self.scene_skinned,
            self.skybox,
            self.particles,
            self.lines,
            self.composite,
            self.sprites,
        ]
    }

    pub fn destroy(self, backend: &dyn GpuBackend) {
        for pipeline in self.all() {
            backend.destroy_pipeline(pipeline);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::shader::MemoryShaderSource;

    #[test]
    fn test_pipelines_are_distinct() {
        let backend = DummyBackend::new();
        let pipelines =
            GraphPipelines::new(&backend, &MemoryShaderSource::with_fallback(), ImageFormat::Bgra8Srgb)
                .unwrap();
        let mut all = pipelines.all().to_vec();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 9);
    }

    #[test]
    fn test_missing_shader_destroys_partial_pipelines() {
        let backend = DummyBackend::new();
        let mut shaders = MemoryShaderSource::new();
        shaders.insert(names::SHADOW_VERT, MemoryShaderSource::empty_module());
        shaders.insert(names::SHADOW_SKINNED_VERT, MemoryShaderSource::empty_module());

        let result = GraphPipelines::new(&backend, &shaders, ImageFormat::Bgra8Srgb);
        assert!(result.is_err());
        assert_eq!(backend.live_pipeline_count(), 0);
    }

    #[test]
    fn test_scene_layouts_order() {
        let descriptor = scene_layouts(GraphicsPipelineDescriptor::default());
        let labels: Vec<_> = descriptor
            .binding_layouts
            .iter()
            .map(|l| l.label.as_deref())
            .collect();
        assert_eq!(
            labels,
            vec![Some("frame"), Some("material"), Some("shadow"), Some("environment")]
        );
    }
}
