//! Render graph.
//!
//! A fixed sequence of passes recorded into the graphics command list of
//! every frame:
//!
//! ```text
//!  shadow map ──► scene (HDR + depth) ──► bloom chain ──► composite ──► present
//!   depth only     static, skinned,        compute on       HDR + bloom,
//!   casters only   skybox, particles,      the graphics     sprites, text
//!                  lines                   queue
//! ```
//!
//! | Pass | Target | Ends with |
//! |------|--------|-----------|
//! | Shadow | [`ShadowMap`] | depth → shader-read |
//! | Scene | [`SurfaceTargets`] | HDR → shader-read |
//! | Bloom | [`BloomChain`] mips | mip 0 → shader-read |
//! | Composite | swapchain image | color → present |
//!
//! Jobs are collected in [`FrameJobs`], batched into a [`FramePlan`] and
//! written into the frame slot before any of this is recorded.

pub mod batch;
pub mod bloom;
pub mod jobs;
pub mod pipelines;
pub mod plan;
pub mod target;

pub use batch::{
    BatchBuilder, BatchJob, BatchMesh, BatchPlan, RenderBatch, SpriteBatch, batch_hash,
    batch_sprites,
};
pub use bloom::{BloomChain, bloom_mip_extent};
pub use jobs::{
    AnimationBlend, Camera, DirectionalLight, EmitterJob, FrameJobs, LineSegment,
    SkeletalRenderJob, SpriteRenderJob, StaticRenderJob, TextRenderJob,
};
pub use pipelines::GraphPipelines;
pub use plan::FramePlan;
pub use target::{DEPTH_FORMAT, HDR_FORMAT, ShadowMap, SurfaceTargets};

use ember_core::profiling::profile_scope;

use crate::backend::{
    Binding, BindingResource, BindingSetHandle, GpuBackend, SamplerHandle, SwapchainInfo,
};
use crate::command::{
    Access, Barrier, ColorAttachment, CommandList, DepthAttachment, ImageBarrier, ImageLayout,
    ImageRef, PipelineStages,
};
use crate::config::RendererConfig;
use crate::error::{GraphicsError, GraphicsResult};
use crate::frame::{FrameContext, FrameSlot};
use crate::resources::{GpuResource, MaterialDefaults, ResourcePool};
use crate::shader::ShaderSource;
use crate::types::{ClearValue, Extent2d, SamplerDescriptor};

use pipelines::{
    CompositePushConstants, FULLSCREEN_VERTICES, SPRITE_QUAD_VERTICES, SkinnedPushConstants,
    SpritePushConstants,
};

/// Set index of material bindings in every scene pipeline.
pub const MATERIAL_SET: u32 = 1;
pub const SHADOW_SET: u32 = 2;
pub const ENVIRONMENT_SET: u32 = 3;

/// What the graph needs besides the frame slot.
#[derive(Debug, Clone, Copy)]
pub struct GraphInputs<'a> {
    pub pool: &'a ResourcePool,
    pub plan: &'a FramePlan,
    /// Binding set of the active environment map. Without one the skybox
    /// is skipped and lighting samples black maps.
    pub environment: Option<BindingSetHandle>,
    pub bloom_strength: f32,
}

/// Objects that live as long as the graph.
#[derive(Debug)]
struct FixedResources {
    linear_sampler: SamplerHandle,
    shadow_sampler: SamplerHandle,
    shadow_map: ShadowMap,
    /// One per frame slot, indexed by slot.
    frame_sets: Vec<BindingSetHandle>,
    shadow_set: BindingSetHandle,
    fallback_environment: BindingSetHandle,
}

impl FixedResources {
    fn create(
        backend: &dyn GpuBackend,
        pipelines: &GraphPipelines,
        slots: &[FrameSlot],
        defaults: &MaterialDefaults,
        shadow_map_size: u32,
        created: &mut Vec<GpuResource>,
    ) -> GraphicsResult<Self> {
        let linear_sampler = backend.create_sampler(
            &SamplerDescriptor::linear().with_label("graph linear"),
        )?;
        created.push(GpuResource::Sampler(linear_sampler));
        let shadow_sampler = backend.create_sampler(
            &SamplerDescriptor::shadow_compare(),
        )?;
        created.push(GpuResource::Sampler(shadow_sampler));

        let shadow_map = ShadowMap::create(backend, shadow_map_size)?;
        created.push(GpuResource::Image(shadow_map.image));

        let mut frame_sets = Vec::with_capacity(slots.len());
        for slot in slots {
            let buffers = &slot.buffers;
            let set = backend.create_binding_set(
                pipelines.scene_static,
                0,
                &[
                    Binding::new(0, BindingResource::buffer(buffers.uniforms)),
                    Binding::new(1, BindingResource::buffer(buffers.static_instances)),
                    Binding::new(2, BindingResource::buffer(buffers.skeletal_instances)),
                    Binding::new(3, BindingResource::buffer(buffers.bone_matrices)),
                    Binding::new(4, BindingResource::buffer(buffers.particles)),
                    Binding::new(5, BindingResource::buffer(buffers.sprites)),
                ],
            )?;
            created.push(GpuResource::BindingSet(set));
            frame_sets.push(set);
        }

        let shadow_set = backend.create_binding_set(
            pipelines.scene_static,
            SHADOW_SET,
            &[Binding::new(
                0,
                BindingResource::SampledImage {
                    image: shadow_map.image,
                    sampler: shadow_sampler,
                },
            )],
        )?;
        created.push(GpuResource::BindingSet(shadow_set));

        let black = BindingResource::SampledImage {
            image: defaults.black,
            sampler: linear_sampler,
        };
        let fallback_environment = backend.create_binding_set(
            pipelines.scene_static,
            ENVIRONMENT_SET,
            &[Binding::new(0, black), Binding::new(1, black), Binding::new(2, black)],
        )?;
        created.push(GpuResource::BindingSet(fallback_environment));

        Ok(Self {
            linear_sampler,
            shadow_sampler,
            shadow_map,
            frame_sets,
            shadow_set,
            fallback_environment,
        })
    }

    fn destroy(self, backend: &dyn GpuBackend) {
        backend.destroy_binding_set(self.fallback_environment);
        backend.destroy_binding_set(self.shadow_set);
        for set in self.frame_sets {
            backend.destroy_binding_set(set);
        }
        self.shadow_map.destroy(backend);
        backend.destroy_sampler(self.shadow_sampler);
        backend.destroy_sampler(self.linear_sampler);
    }
}

/// Objects sized by the swapchain.
#[derive(Debug, Clone, Copy)]
struct SurfaceResources {
    targets: SurfaceTargets,
    composite_set: BindingSetHandle,
}

/// The passes of a frame and everything they render into.
pub struct RenderGraph {
    pipelines: GraphPipelines,
    bloom: BloomChain,
    fixed: FixedResources,
    surface: Option<SurfaceResources>,
    max_bones: u32,
}

impl RenderGraph {
    /// Create pipelines, per-slot frame sets and the targets for the
    /// current swapchain.
    pub fn new(
        backend: &dyn GpuBackend,
        shaders: &dyn ShaderSource,
        slots: &[FrameSlot],
        defaults: &MaterialDefaults,
        config: &RendererConfig,
        swapchain: &SwapchainInfo,
    ) -> GraphicsResult<Self> {
        let pipelines = GraphPipelines::new(backend, shaders, swapchain.format)?;
        let bloom = match BloomChain::new(backend, shaders, config.graph.bloom_mip_count) {
            Ok(bloom) => bloom,
            Err(e) => {
                pipelines.destroy(backend);
                return Err(e);
            }
        };

        let mut created = Vec::new();
        let fixed = match FixedResources::create(
            backend,
            &pipelines,
            slots,
            defaults,
            config.graph.shadow_map_size,
            &mut created,
        ) {
            Ok(fixed) => fixed,
            Err(e) => {
                for resource in created.into_iter().rev() {
                    resource.destroy(backend);
                }
                bloom.destroy(backend);
                pipelines.destroy(backend);
                return Err(e);
            }
        };

        let mut graph = Self {
            pipelines,
            bloom,
            fixed,
            surface: None,
            max_bones: config.skinning.max_bones,
        };
        if let Err(e) = graph.resize(backend, swapchain.extent) {
            graph.destroy(backend);
            return Err(e);
        }

        log::info!(
            "Render graph ready: shadow map {}, {} bloom mips",
            config.graph.shadow_map_size,
            config.graph.bloom_mip_count
        );
        Ok(graph)
    }

    pub fn pipelines(&self) -> &GraphPipelines {
        &self.pipelines
    }

    pub fn bloom(&self) -> &BloomChain {
        &self.bloom
    }

    pub fn shadow_map(&self) -> &ShadowMap {
        &self.fixed.shadow_map
    }

    /// The surface targets, `None` after a failed resize.
    pub fn targets(&self) -> Option<&SurfaceTargets> {
        self.surface.as_ref().map(|surface| &surface.targets)
    }

    /// Rebuild everything sized by the swapchain. The device must be idle.
    pub fn resize(&mut self, backend: &dyn GpuBackend, extent: Extent2d) -> GraphicsResult<()> {
        if let Some(old) = self.surface.take() {
            backend.destroy_binding_set(old.composite_set);
            old.targets.destroy(backend);
        }

        let targets = SurfaceTargets::create(backend, extent)?;
        if let Err(e) = self
            .bloom
            .resize(backend, targets.hdr, extent, self.fixed.linear_sampler)
        {
            targets.destroy(backend);
            return Err(e);
        }

        let sampler = self.fixed.linear_sampler;
        let bloom = self.bloom.output().unwrap_or(targets.hdr);
        let composite_set = backend
            .create_binding_set(
                self.pipelines.composite,
                0,
                &[
                    Binding::new(
                        0,
                        BindingResource::SampledImage {
                            image: targets.hdr,
                            sampler,
                        },
                    ),
                    Binding::new(
                        1,
                        BindingResource::SampledImage {
                            image: bloom,
                            sampler,
                        },
                    ),
                ],
            )
            .inspect_err(|_| targets.destroy(backend))?;

        self.surface = Some(SurfaceResources {
            targets,
            composite_set,
        });
        log::debug!("Render graph resized to {}x{}", extent.width, extent.height);
        Ok(())
    }

    /// Record every pass of the frame. The slot's buffers must already hold
    /// this frame's records.
    pub fn record(
        &self,
        ctx: &FrameContext<'_>,
        inputs: &GraphInputs<'_>,
        commands: &mut CommandList,
    ) -> GraphicsResult<()> {
        let surface = self.surface.ok_or_else(|| {
            GraphicsError::Internal("render graph has no surface targets".to_string())
        })?;
        let frame_set = *self.fixed.frame_sets.get(ctx.slot.index).ok_or_else(|| {
            GraphicsError::Internal(format!("no frame binding set for slot {}", ctx.slot.index))
        })?;

        {
            profile_scope!("shadow_pass");
            self.record_shadow(inputs, frame_set, commands);
        }
        {
            profile_scope!("scene_pass");
            self.record_scene(ctx, inputs, frame_set, &surface.targets, commands);
        }
        {
            profile_scope!("bloom");
            self.bloom.record(commands);
        }
        {
            profile_scope!("composite_pass");
            self.record_composite(ctx, inputs, frame_set, surface.composite_set, commands);
        }

        log::trace!(
            "Frame {}: graph recorded ({} static batches, {} skeletal batches, {} commands)",
            ctx.frame_index,
            inputs.plan.static_batches.batches.len(),
            inputs.plan.skeletal_batches.batches.len(),
            commands.len()
        );
        Ok(())
    }

    fn record_shadow(
        &self,
        inputs: &GraphInputs<'_>,
        frame_set: BindingSetHandle,
        commands: &mut CommandList,
    ) {
        let shadow = &self.fixed.shadow_map;
        commands.barrier(
            Barrier::new(
                PipelineStages::TOP_OF_PIPE,
                PipelineStages::EARLY_FRAGMENT_TESTS | PipelineStages::LATE_FRAGMENT_TESTS,
            )
            .image(
                ImageBarrier::new(
                    shadow.image,
                    ImageLayout::Undefined,
                    ImageLayout::DepthAttachment,
                    Access::empty(),
                    Access::DEPTH_ATTACHMENT_READ | Access::DEPTH_ATTACHMENT_WRITE,
                )
                .depth(),
            ),
        );
        commands.begin_rendering(
            None,
            Some(DepthAttachment {
                image: shadow.image,
                clear: ClearValue::Depth(1.0),
            }),
            shadow.extent(),
        );
        commands.set_viewport_and_scissor(shadow.extent());

        let plan = inputs.plan;
        if plan.static_batches.batches.iter().any(|b| b.shadow_range().is_some()) {
            commands.bind_pipeline(self.pipelines.shadow_static);
            commands.bind_binding_set(0, frame_set);
            draw_batches(commands, inputs.pool, &plan.static_batches.batches, BatchPass::Shadow);
        }
        if plan.skeletal_batches.batches.iter().any(|b| b.shadow_range().is_some()) {
            commands.bind_pipeline(self.pipelines.shadow_skinned);
            commands.bind_binding_set(0, frame_set);
            commands.push_constants(&self.skinned_push_constants());
            draw_batches(commands, inputs.pool, &plan.skeletal_batches.batches, BatchPass::Shadow);
        }

        commands.end_rendering();
        commands.barrier(
            Barrier::new(PipelineStages::LATE_FRAGMENT_TESTS, PipelineStages::FRAGMENT_SHADER)
                .image(
                    ImageBarrier::new(
                        shadow.image,
                        ImageLayout::DepthAttachment,
                        ImageLayout::ShaderReadOnly,
                        Access::DEPTH_ATTACHMENT_WRITE,
                        Access::SHADER_READ,
                    )
                    .depth(),
                ),
        );
    }

    fn record_scene(
        &self,
        ctx: &FrameContext<'_>,
        inputs: &GraphInputs<'_>,
        frame_set: BindingSetHandle,
        targets: &SurfaceTargets,
        commands: &mut CommandList,
    ) {
        commands.barrier(
            Barrier::new(
                PipelineStages::TOP_OF_PIPE,
                PipelineStages::COLOR_ATTACHMENT_OUTPUT
                    | PipelineStages::EARLY_FRAGMENT_TESTS
                    | PipelineStages::LATE_FRAGMENT_TESTS,
            )
            .image(ImageBarrier::new(
                targets.hdr,
                ImageLayout::Undefined,
                ImageLayout::ColorAttachment,
                Access::empty(),
                Access::COLOR_ATTACHMENT_WRITE,
            ))
            .image(
                ImageBarrier::new(
                    targets.depth,
                    ImageLayout::Undefined,
                    ImageLayout::DepthAttachment,
                    Access::empty(),
                    Access::DEPTH_ATTACHMENT_READ | Access::DEPTH_ATTACHMENT_WRITE,
                )
                .depth(),
            ),
        );
        commands.begin_rendering(
            Some(ColorAttachment {
                target: targets.hdr.into(),
                clear: ClearValue::color(0.0, 0.0, 0.0, 1.0),
            }),
            Some(DepthAttachment {
                image: targets.depth,
                clear: ClearValue::Depth(1.0),
            }),
            targets.extent,
        );
        commands.set_viewport_and_scissor(targets.extent);

        let environment = inputs
            .environment
            .unwrap_or(self.fixed.fallback_environment);
        let bind_scene_sets = |commands: &mut CommandList| {
            commands.bind_binding_set(0, frame_set);
            commands.bind_binding_set(SHADOW_SET, self.fixed.shadow_set);
            commands.bind_binding_set(ENVIRONMENT_SET, environment);
        };

        let plan = inputs.plan;
        if !plan.static_batches.batches.is_empty() {
            commands.bind_pipeline(self.pipelines.scene_static);
            bind_scene_sets(commands);
            draw_batches(commands, inputs.pool, &plan.static_batches.batches, BatchPass::Scene);
        }
        if !plan.skeletal_batches.batches.is_empty() {
            commands.bind_pipeline(self.pipelines.scene_skinned);
            bind_scene_sets(commands);
            commands.push_constants(&self.skinned_push_constants());
            draw_batches(commands, inputs.pool, &plan.skeletal_batches.batches, BatchPass::Scene);
        }
        if let Some(environment) = inputs.environment {
            commands.bind_pipeline(self.pipelines.skybox);
            commands.bind_binding_set(0, frame_set);
            commands.bind_binding_set(ENVIRONMENT_SET, environment);
            commands.draw(FULLSCREEN_VERTICES, 1);
        }

        commands.bind_pipeline(self.pipelines.particles);
        commands.bind_binding_set(0, frame_set);
        commands.draw_indirect(ctx.slot.buffers.draw_indirect, 0);

        if plan.line_vertex_count() > 0 {
            commands.bind_pipeline(self.pipelines.lines);
            commands.bind_binding_set(0, frame_set);
            commands.bind_vertex_buffer(ctx.slot.buffers.lines);
            commands.draw(plan.line_vertex_count(), 1);
        }

        commands.end_rendering();
        commands.barrier(
            Barrier::new(
                PipelineStages::COLOR_ATTACHMENT_OUTPUT,
                PipelineStages::COMPUTE_SHADER | PipelineStages::FRAGMENT_SHADER,
            )
            .image(ImageBarrier::new(
                targets.hdr,
                ImageLayout::ColorAttachment,
                ImageLayout::ShaderReadOnly,
                Access::COLOR_ATTACHMENT_WRITE,
                Access::SHADER_READ,
            )),
        );
    }

    fn record_composite(
        &self,
        ctx: &FrameContext<'_>,
        inputs: &GraphInputs<'_>,
        frame_set: BindingSetHandle,
        composite_set: BindingSetHandle,
        commands: &mut CommandList,
    ) {
        let swapchain_image = ImageRef::Swapchain(ctx.image_index);
        let extent = ctx.swapchain.extent;
        commands.barrier(
            Barrier::new(
                PipelineStages::TOP_OF_PIPE,
                PipelineStages::COLOR_ATTACHMENT_OUTPUT,
            )
            .image(ImageBarrier::new(
                swapchain_image,
                ImageLayout::Undefined,
                ImageLayout::ColorAttachment,
                Access::empty(),
                Access::COLOR_ATTACHMENT_WRITE,
            )),
        );
        commands.begin_rendering(
            Some(ColorAttachment {
                target: swapchain_image,
                clear: ClearValue::DontCare,
            }),
            None,
            extent,
        );
        commands.set_viewport_and_scissor(extent);

        commands.bind_pipeline(self.pipelines.composite);
        commands.bind_binding_set(0, composite_set);
        commands.push_constants(&CompositePushConstants {
            bloom_strength: inputs.bloom_strength,
            _pad: [0.0; 3],
        });
        commands.draw(FULLSCREEN_VERTICES, 1);

        let plan = inputs.plan;
        if !plan.sprite_batches.is_empty() || !plan.text_batches.is_empty() {
            commands.bind_pipeline(self.pipelines.sprites);
            commands.bind_binding_set(0, frame_set);
            commands.push_constants(&SpritePushConstants {
                screen_size: [extent.width as f32, extent.height as f32],
                _pad: [0.0; 2],
            });
            for batch in plan.sprite_batches.iter().chain(&plan.text_batches) {
                let Some(material) = inputs.pool.try_get_material(batch.material) else {
                    log::warn!("Sprite batch references unknown material {}", batch.material);
                    continue;
                };
                commands.bind_binding_set(MATERIAL_SET, material.binding_set());
                commands.draw_instances(
                    SPRITE_QUAD_VERTICES,
                    batch.first_instance,
                    batch.instance_count,
                );
            }
        }

        commands.end_rendering();
        commands.barrier(
            Barrier::new(
                PipelineStages::COLOR_ATTACHMENT_OUTPUT,
                PipelineStages::BOTTOM_OF_PIPE,
            )
            .image(ImageBarrier::new(
                swapchain_image,
                ImageLayout::ColorAttachment,
                ImageLayout::Present,
                Access::COLOR_ATTACHMENT_WRITE,
                Access::empty(),
            )),
        );
    }

    fn skinned_push_constants(&self) -> SkinnedPushConstants {
        SkinnedPushConstants {
            max_bones: self.max_bones,
            _pad: [0; 3],
        }
    }

    /// Destroy everything the graph owns. The device must be idle.
    pub fn destroy(mut self, backend: &dyn GpuBackend) {
        if let Some(surface) = self.surface.take() {
            backend.destroy_binding_set(surface.composite_set);
            surface.targets.destroy(backend);
        }
        self.bloom.destroy(backend);
        self.fixed.destroy(backend);
        self.pipelines.destroy(backend);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchPass {
    /// Shadow casters only, no materials.
    Shadow,
    Scene,
}

fn draw_batches<M: BatchMesh>(
    commands: &mut CommandList,
    pool: &ResourcePool,
    batches: &[RenderBatch<M>],
    pass: BatchPass,
) {
    let mut bound_material = None;
    for batch in batches {
        let (first_instance, instance_count) = match pass {
            BatchPass::Shadow => match batch.shadow_range() {
                Some(range) => range,
                None => continue,
            },
            BatchPass::Scene => (batch.first_instance, batch.instance_count),
        };
        let Some(mesh) = pool.try_drawable(M::mesh_ref(batch.mesh)) else {
            log::warn!("Batch references released mesh {}", batch.mesh);
            continue;
        };
        if pass == BatchPass::Scene && bound_material != Some(batch.material) {
            let Some(material) = pool.try_get_material(batch.material) else {
                log::warn!("Batch references unknown material {}", batch.material);
                continue;
            };
            commands.bind_binding_set(MATERIAL_SET, material.binding_set());
            bound_material = Some(batch.material);
        }

        let info = mesh.draw_info();
        commands.bind_vertex_buffer(info.vertex_buffer);
        commands.bind_index_buffer(info.index_buffer);
        commands.draw_indexed(info.index_count, first_instance, instance_count);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ember_core::Handle;
    use glam::Mat4;

    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::command::Command;
    use crate::resources::{Material, MaterialDescriptor, MeshData};
    use crate::shader::MemoryShaderSource;
    use crate::types::{ImageDescriptor, ImageFormat, ImageUsage, Vertex};

    struct Fixture {
        backend: Arc<DummyBackend>,
        slots: Vec<FrameSlot>,
        pool: ResourcePool,
        graph: RenderGraph,
        defaults: MaterialDefaults,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(DummyBackend::new());
        let config = RendererConfig::default();
        let slots: Vec<FrameSlot> = (0..2)
            .map(|i| FrameSlot::create(&*backend, &config, i).unwrap())
            .collect();
        let image = |label: &str| {
            backend
                .create_image(
                    &ImageDescriptor::new_2d(1, 1, ImageFormat::Rgba8Unorm, ImageUsage::SAMPLED)
                        .with_label(label),
                )
                .unwrap()
        };
        let defaults = MaterialDefaults {
            white: image("white"),
            flat_normal: image("normal"),
            black: image("black"),
        };
        let pool = ResourcePool::new(&*backend, &config.skinning).unwrap();
        let graph = RenderGraph::new(
            &*backend,
            &MemoryShaderSource::with_fallback(),
            &slots,
            &defaults,
            &config,
            &backend.swapchain_info(),
        )
        .unwrap();
        Fixture {
            backend,
            slots,
            pool,
            graph,
            defaults,
        }
    }

    fn context<'a>(fixture: &'a Fixture) -> FrameContext<'a> {
        FrameContext {
            backend: &*fixture.backend,
            frame_index: 0,
            slot: &fixture.slots[0],
            previous_slot: &fixture.slots[1],
            image_index: 1,
            swapchain: fixture.backend.swapchain_info(),
        }
    }

    fn add_material(fixture: &mut Fixture) -> Handle<Material> {
        let sampler = fixture
            .backend
            .create_sampler(&SamplerDescriptor::linear())
            .unwrap();
        let d = fixture.defaults;
        let material = Material::create(
            &*fixture.backend,
            fixture.graph.pipelines().scene_static,
            MATERIAL_SET,
            MaterialDescriptor::Textured {
                base_color: Handle::from_raw(1),
            },
            [d.white, d.flat_normal, d.white, d.black],
            sampler,
        )
        .unwrap();
        fixture.pool.add_material("m", material)
    }

    fn record(fixture: &Fixture, plan: &FramePlan, environment: Option<BindingSetHandle>) -> CommandList {
        let mut commands = CommandList::new();
        let inputs = GraphInputs {
            pool: &fixture.pool,
            plan,
            environment,
            bloom_strength: 0.04,
        };
        fixture.graph.record(&context(fixture), &inputs, &mut commands).unwrap();
        commands
    }

    fn render_extents(commands: &CommandList) -> Vec<Extent2d> {
        commands
            .commands()
            .iter()
            .filter_map(|c| match c {
                Command::BeginRendering { extent, .. } => Some(*extent),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_pass_order_and_present_transition() {
        let fixture = fixture();
        let commands = record(&fixture, &FramePlan::default(), None);

        assert_eq!(
            render_extents(&commands),
            vec![
                Extent2d::new(2048, 2048),
                Extent2d::new(1280, 720),
                Extent2d::new(1280, 720),
            ]
        );
        let Some(Command::Barrier(last)) = commands.commands().last() else {
            panic!("frame must end with a barrier");
        };
        assert_eq!(last.images[0].image, ImageRef::Swapchain(1));
        assert_eq!(last.images[0].new_layout, ImageLayout::Present);
        // Bloom ran between scene and composite.
        assert!(commands.dispatch_count() > 0);
    }

    #[test]
    fn test_shadow_pass_skips_non_casters() {
        let mut fixture = fixture();
        let material = add_material(&mut fixture);
        let mesh = fixture
            .pool
            .load_mesh(
                &*fixture.backend,
                "tri",
                &MeshData {
                    vertices: vec![Vertex::default(); 3],
                    indices: vec![0, 1, 2],
                },
            )
            .unwrap();

        let mut jobs = FrameJobs::new();
        jobs.add_static(StaticRenderJob::new(mesh, material, Mat4::IDENTITY));
        jobs.add_static(StaticRenderJob::new(mesh, material, Mat4::IDENTITY).without_shadows());
        jobs.add_static(StaticRenderJob::new(mesh, material, Mat4::IDENTITY));
        let plan = FramePlan::build(
            &jobs,
            &fixture.pool,
            &RendererConfig::default().instances,
            16,
        );
        let commands = record(&fixture, &plan, None);

        let draws: Vec<(u32, u32)> = commands
            .commands()
            .iter()
            .filter_map(|c| match c {
                Command::DrawIndexed {
                    first_instance,
                    instance_count,
                    ..
                } => Some((*first_instance, *instance_count)),
                _ => None,
            })
            .collect();
        assert_eq!(draws, vec![(1, 2), (0, 3)]);
    }

    #[test]
    fn test_skybox_only_with_environment() {
        let fixture = fixture();
        let fullscreen_draws = |commands: &CommandList| {
            commands
                .commands()
                .iter()
                .filter(|c| matches!(c, Command::Draw { vertex_count: 3, .. }))
                .count()
        };

        let without = record(&fixture, &FramePlan::default(), None);
        assert_eq!(fullscreen_draws(&without), 1);

        let environment = fixture.graph.fixed.fallback_environment;
        let with = record(&fixture, &FramePlan::default(), Some(environment));
        assert_eq!(fullscreen_draws(&with), 2);
    }

    #[test]
    fn test_resize_rebuilds_targets() {
        let mut fixture = fixture();
        let images_before = fixture.backend.live_image_count();
        fixture
            .graph
            .resize(&*fixture.backend, Extent2d::new(640, 360))
            .unwrap();

        assert_eq!(fixture.backend.live_image_count(), images_before);
        assert_eq!(
            fixture.graph.targets().map(|t| t.extent),
            Some(Extent2d::new(640, 360))
        );
        assert_eq!(fixture.graph.bloom().mip_extents()[0], Extent2d::new(320, 180));
    }

    #[test]
    fn test_destroy_releases_everything() {
        let fixture = fixture();
        let Fixture {
            backend,
            slots,
            pool,
            graph,
            ..
        } = fixture;
        graph.destroy(&*backend);
        pool.destroy(&*backend);
        for slot in slots {
            slot.destroy(&*backend);
        }
        assert_eq!(backend.live_pipeline_count(), 0);
        assert_eq!(backend.live_binding_set_count(), 0);
        // Only the three default images remain.
        assert_eq!(backend.live_image_count(), 3);
    }
}
