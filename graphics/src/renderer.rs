//! The renderer context: every subsystem, owned in one place.
//!
//! A [`Renderer`] is created once per device and passed explicitly to
//! whoever loads assets or submits frames. Loading is synchronous on the
//! calling thread; images go through the transfer queue and become
//! visible to the graphics queue through the transition ring.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ember_core::Handle;
use ember_core::profiling::profile_function;

use crate::backend::{GpuBackend, ImageHandle, NativeWindow, SamplerHandle, SwapchainInfo};
use crate::command::CommandList;
use crate::compute::{ComputeInputs, ComputeSubsystem, SkinningPacket, prepare_emitters};
use crate::config::RendererConfig;
use crate::error::{GraphicsError, GraphicsResult};
use crate::frame::{FrameContext, FrameOutcome, FrameRecorder, FrameScheduler};
use crate::graph::{ENVIRONMENT_SET, FrameJobs, FramePlan, GraphInputs, MATERIAL_SET, RenderGraph};
use crate::resources::{
    Animation, AnimationData, EnvironmentMap, FontAtlas, FontAtlasData, GpuImage, ImageData,
    ImageUploader, MATERIAL_TEXTURE_SLOTS, Material, MaterialDefaults, MaterialDescriptor, Mesh,
    MeshData, ResourcePool, SkeletalMesh, SkeletalMeshData,
};
use crate::shader::{ShaderDirectory, ShaderSource};
use crate::transition::transition_channel;
use crate::types::{Extent2d, ImageFormat, SamplerDescriptor};

/// Anything the renderer can present to.
pub trait DrawableSurface {
    /// Current drawable size in pixels; zero while minimised.
    fn drawable_extent(&self) -> Extent2d;
}

/// Per-frame work driven by the scheduler.
struct RenderWork {
    backend: Arc<dyn GpuBackend>,
    config: RendererConfig,
    pool: ResourcePool,
    compute: ComputeSubsystem,
    graph: RenderGraph,
    jobs: FrameJobs,
    plan: FramePlan,
    environment: Option<Handle<EnvironmentMap>>,
}

impl RenderWork {
    fn environment_set(&self) -> Option<crate::backend::BindingSetHandle> {
        self.environment
            .and_then(|handle| self.pool.try_get_environment_map(handle))
            .map(EnvironmentMap::binding_set)
    }
}

impl FrameRecorder for RenderWork {
    fn retire_resources(&mut self, frame_index: u64) {
        self.pool.process_deletions(frame_index, &*self.backend);
    }

    fn record_compute(
        &mut self,
        ctx: &FrameContext<'_>,
        commands: &mut CommandList,
    ) -> GraphicsResult<()> {
        let plan = FramePlan::build(
            &self.jobs,
            &self.pool,
            &self.config.instances,
            self.config.skinning.max_skeletal_instances,
        );
        let uniforms = self
            .jobs
            .uniforms(self.environment_set().is_some(), self.config.particles.max_particles);
        plan.write(ctx.backend, ctx.slot, &uniforms)?;

        let skinning = SkinningPacket::pack(
            &self.jobs.skeletal_jobs,
            &plan.skeletal_batches.order,
            &self.pool,
            &self.config.skinning,
        );
        let emitters = prepare_emitters(&self.jobs.emitters, ctx.frame_index, &self.config.particles);
        let inputs = ComputeInputs {
            skinning: &skinning,
            emitters: &emitters,
            view: self.jobs.camera.view,
            delta_time: self.jobs.delta_time,
        };
        self.compute.record(ctx, &inputs, commands)?;
        self.plan = plan;
        Ok(())
    }

    fn record_graphics(
        &mut self,
        ctx: &FrameContext<'_>,
        commands: &mut CommandList,
    ) -> GraphicsResult<()> {
        let inputs = GraphInputs {
            pool: &self.pool,
            plan: &self.plan,
            environment: self.environment_set(),
            bloom_strength: self.jobs.bloom_strength,
        };
        self.graph.record(ctx, &inputs, commands)
    }

    fn recreate_surface_resources(
        &mut self,
        backend: &dyn GpuBackend,
        swapchain: &SwapchainInfo,
    ) -> GraphicsResult<()> {
        self.graph.resize(backend, swapchain.extent)
    }
}

/// What has been built so far during [`Renderer::new`], torn down in
/// reverse when a later stage fails.
#[derive(Default)]
struct PartialRenderer {
    scheduler: Option<FrameScheduler>,
    uploader: Option<ImageUploader>,
    pool: Option<ResourcePool>,
    sampler: Option<SamplerHandle>,
    defaults: Option<MaterialDefaults>,
    compute: Option<ComputeSubsystem>,
    graph: Option<RenderGraph>,
}

impl PartialRenderer {
    fn abort(self, backend: &dyn GpuBackend) {
        if let Some(mut uploader) = self.uploader
            && let Err(e) = uploader.finish(Duration::from_secs(1))
        {
            log::warn!("Pending uploads not completed during teardown: {}", e);
        }
        if let Some(mut scheduler) = self.scheduler
            && let Err(e) = scheduler.shutdown()
        {
            log::warn!("Frame scheduler teardown failed: {}", e);
        }
        if let Some(graph) = self.graph {
            graph.destroy(backend);
        }
        if let Some(compute) = self.compute {
            compute.destroy(backend);
        }
        if let Some(sampler) = self.sampler {
            backend.destroy_sampler(sampler);
        }
        if let Some(pool) = self.pool {
            pool.destroy(backend);
        }
    }
}

fn stage<T>(name: &str, result: GraphicsResult<T>) -> GraphicsResult<T> {
    result.inspect_err(|e| log::error!("Failed to initialize {}: {}", name, e))
}

/// Owns the backend, the frame loop and every loaded resource.
pub struct Renderer {
    backend: Arc<dyn GpuBackend>,
    scheduler: FrameScheduler,
    uploader: ImageUploader,
    sampler: SamplerHandle,
    defaults: MaterialDefaults,
    work: RenderWork,
}

impl Renderer {
    /// Create the backend for `window` and a renderer on top of it. Shaders
    /// are read from `config.device.shader_dir`.
    pub fn with_window(
        config: RendererConfig,
        window: &dyn NativeWindow,
        extent: Extent2d,
    ) -> GraphicsResult<Self> {
        stage("config", config.validate())?;
        let backend = stage(
            "backend",
            crate::backend::create_backend(&config.device, Some(window), extent),
        )?;
        let shaders = ShaderDirectory::new(&config.device.shader_dir);
        Self::new(backend, &shaders, config)
    }

    /// Build every subsystem on `backend`, in dependency order.
    pub fn new(
        backend: Arc<dyn GpuBackend>,
        shaders: &dyn ShaderSource,
        config: RendererConfig,
    ) -> GraphicsResult<Self> {
        stage("config", config.validate())?;
        let mut partial = PartialRenderer::default();
        if let Err(e) = Self::build(&backend, shaders, &config, &mut partial) {
            partial.abort(&*backend);
            return Err(e);
        }

        let PartialRenderer {
            scheduler: Some(scheduler),
            uploader: Some(uploader),
            pool: Some(pool),
            sampler: Some(sampler),
            defaults: Some(defaults),
            compute: Some(compute),
            graph: Some(graph),
        } = partial
        else {
            return Err(GraphicsError::Internal(
                "renderer initialization finished with missing stages".to_string(),
            ));
        };

        log::info!(
            "Renderer ready on {} ({}x{} swapchain)",
            backend.name(),
            scheduler.swapchain().extent.width,
            scheduler.swapchain().extent.height
        );
        Ok(Self {
            backend: Arc::clone(&backend),
            scheduler,
            uploader,
            sampler,
            defaults,
            work: RenderWork {
                backend,
                config,
                pool,
                compute,
                graph,
                jobs: FrameJobs::new(),
                plan: FramePlan::default(),
                environment: None,
            },
        })
    }

    fn build(
        backend: &Arc<dyn GpuBackend>,
        shaders: &dyn ShaderSource,
        config: &RendererConfig,
        partial: &mut PartialRenderer,
    ) -> GraphicsResult<()> {
        let (sender, receiver) = transition_channel();
        let scheduler = partial.scheduler.insert(stage(
            "frame scheduler",
            FrameScheduler::new(Arc::clone(backend), config, receiver),
        )?);
        let uploader = partial.uploader.insert(ImageUploader::new(
            Arc::clone(backend),
            sender,
            Duration::from_millis(config.frame.transition_send_timeout_ms),
        ));
        let pool = partial.pool.insert(stage(
            "resource pool",
            ResourcePool::new(&**backend, &config.skinning),
        )?);
        partial.sampler = Some(stage(
            "material sampler",
            backend.create_sampler(&SamplerDescriptor::material()),
        )?);

        let defaults = *partial.defaults.insert(stage(
            "default images",
            Self::create_defaults(uploader, pool),
        )?);
        // Defaults are bound by the graph's fallback sets, so they must be
        // owned by the graphics queue before the first frame.
        stage("default images", scheduler.flush_transitions())?;

        partial.compute = Some(stage(
            "compute subsystem",
            ComputeSubsystem::new(&**backend, shaders, scheduler.slots(), pool, config),
        )?);
        partial.graph = Some(stage(
            "render graph",
            RenderGraph::new(
                &**backend,
                shaders,
                scheduler.slots(),
                &defaults,
                config,
                &scheduler.swapchain(),
            ),
        )?);
        Ok(())
    }

    fn create_defaults(
        uploader: &mut ImageUploader,
        pool: &mut ResourcePool,
    ) -> GraphicsResult<MaterialDefaults> {
        let mut upload = |name: &str, color: [u8; 4]| -> GraphicsResult<ImageHandle> {
            let image = uploader.upload(name, &ImageData::solid(color, ImageFormat::Rgba8Unorm))?;
            let handle = image.image;
            pool.add_image(name, image);
            Ok(handle)
        };
        Ok(MaterialDefaults {
            white: upload("default white", [255, 255, 255, 255])?,
            flat_normal: upload("default normal", [128, 128, 255, 255])?,
            black: upload("default black", [0, 0, 0, 255])?,
        })
    }

    pub fn backend(&self) -> &Arc<dyn GpuBackend> {
        &self.backend
    }

    pub fn config(&self) -> &RendererConfig {
        &self.work.config
    }

    pub fn pool(&self) -> &ResourcePool {
        &self.work.pool
    }

    /// Mutable pool access, for lookups and `release_*`.
    pub fn pool_mut(&mut self) -> &mut ResourcePool {
        &mut self.work.pool
    }

    /// Jobs of the frame being built. Cleared by every [`render_frame`](Self::render_frame).
    pub fn jobs(&mut self) -> &mut FrameJobs {
        &mut self.work.jobs
    }

    pub fn frame_index(&self) -> u64 {
        self.scheduler.frame_index()
    }

    pub fn swapchain(&self) -> SwapchainInfo {
        self.scheduler.swapchain()
    }

    pub fn scheduler(&self) -> &FrameScheduler {
        &self.scheduler
    }

    pub fn graph(&self) -> &RenderGraph {
        &self.work.graph
    }

    pub fn compute(&self) -> &ComputeSubsystem {
        &self.work.compute
    }

    pub fn defaults(&self) -> &MaterialDefaults {
        &self.defaults
    }

    pub fn load_mesh(&mut self, name: &str, data: &MeshData) -> GraphicsResult<Handle<Mesh>> {
        self.work.pool.load_mesh(&*self.backend, name, data)
    }

    pub fn load_skeletal_mesh(
        &mut self,
        name: &str,
        data: &SkeletalMeshData,
    ) -> GraphicsResult<Handle<SkeletalMesh>> {
        self.work.pool.load_skeletal_mesh(&*self.backend, name, data)
    }

    pub fn load_animation(
        &mut self,
        name: &str,
        data: &AnimationData,
    ) -> GraphicsResult<Handle<Animation>> {
        self.work.pool.load_animation(&*self.backend, name, data)
    }

    /// Upload an image through the transfer queue and add it to the pool.
    ///
    /// Transitions are drained by frames on this same thread, so a full
    /// transition queue is flushed here instead of waiting for a frame.
    pub fn load_image(&mut self, name: &str, data: &ImageData) -> GraphicsResult<Handle<GpuImage>> {
        if self.uploader.is_queue_full() {
            let flushed = self.scheduler.flush_transitions()?;
            log::debug!("Transition queue full, acquired {} images before '{}'", flushed, name);
        }
        let image = self.uploader.upload(name, data)?;
        Ok(self.work.pool.add_image(name, image))
    }

    /// Decode and upload an image file. 8-bit images get a generated mip
    /// chain; `.mips` files carry their own and are read as `Rgba8Srgb` or
    /// `Rgba8Unorm` per `srgb`.
    pub fn load_image_file(&mut self, path: &Path, srgb: bool) -> GraphicsResult<Handle<GpuImage>> {
        let is_chain = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("mips"));
        let data = if is_chain {
            let format = if srgb {
                ImageFormat::Rgba8Srgb
            } else {
                ImageFormat::Rgba8Unorm
            };
            ImageData::load_mip_chain(path, format)?
        } else {
            let data = ImageData::load(path, srgb)?;
            if data.format == ImageFormat::Rgba32Float {
                data
            } else {
                data.with_generated_mips()?
            }
        };
        self.load_image(&path.display().to_string(), &data)
    }

    fn resolve_image(&self, handle: Handle<GpuImage>) -> GraphicsResult<ImageHandle> {
        self.work
            .pool
            .try_get_image(handle)
            .map(|image| image.image)
            .ok_or_else(|| {
                GraphicsError::InvalidParameter(format!("unknown image handle {}", handle))
            })
    }

    /// Create a material; slots the descriptor leaves empty sample the defaults.
    pub fn create_material(
        &mut self,
        name: &str,
        descriptor: MaterialDescriptor,
    ) -> GraphicsResult<Handle<Material>> {
        let mut images = [self.defaults.white; MATERIAL_TEXTURE_SLOTS];
        for (slot, image) in descriptor.slots().into_iter().enumerate() {
            images[slot] = match image {
                Some(handle) => self.resolve_image(handle)?,
                None => self.defaults.for_slot(slot),
            };
        }
        let material = Material::create(
            &*self.backend,
            self.work.graph.pipelines().scene_static,
            MATERIAL_SET,
            descriptor,
            images,
            self.sampler,
        )?;
        Ok(self.work.pool.add_material(name, material))
    }

    /// Upload a font atlas and create the material its glyph sprites use.
    pub fn load_font(&mut self, name: &str, data: &FontAtlasData) -> GraphicsResult<Handle<FontAtlas>> {
        data.validate()?;
        let image = self.load_image(&format!("{name} atlas"), &data.image)?;
        let material = self.create_material(
            &format!("{name} material"),
            MaterialDescriptor::Textured { base_color: image },
        )?;
        let font = FontAtlas::new(image, material, &data.glyphs);
        log::debug!("Loaded font '{}' with {} glyphs", name, font.glyph_count());
        Ok(self.work.pool.add_font_atlas(name, font))
    }

    /// Upload the three maps of an environment. See [`crate::environment`]
    /// for generating irradiance and prefiltered maps.
    pub fn load_environment(
        &mut self,
        name: &str,
        skybox: &ImageData,
        irradiance: &ImageData,
        prefiltered: &ImageData,
    ) -> GraphicsResult<Handle<EnvironmentMap>> {
        let handles = [
            self.load_image(&format!("{name} skybox"), skybox)?,
            self.load_image(&format!("{name} irradiance"), irradiance)?,
            self.load_image(&format!("{name} prefiltered"), prefiltered)?,
        ];
        let images = [
            self.resolve_image(handles[0])?,
            self.resolve_image(handles[1])?,
            self.resolve_image(handles[2])?,
        ];
        let environment = EnvironmentMap::create(
            &*self.backend,
            self.work.graph.pipelines().scene_static,
            ENVIRONMENT_SET,
            handles,
            images,
            self.sampler,
        )?;
        Ok(self.work.pool.add_environment_map(name, environment))
    }

    /// Select the environment used for the skybox and image-based lighting.
    pub fn set_environment(&mut self, environment: Option<Handle<EnvironmentMap>>) {
        self.work.environment = environment;
    }

    pub fn environment(&self) -> Option<Handle<EnvironmentMap>> {
        self.work.environment
    }

    /// Render the jobs collected since the last call and clear them.
    pub fn render_frame(&mut self, surface: &dyn DrawableSurface) -> GraphicsResult<FrameOutcome> {
        profile_function!();
        let reclaimed = self.uploader.reclaim()?;
        if reclaimed > 0 {
            log::trace!("Reclaimed {} upload staging buffers", reclaimed);
        }
        let outcome = self.scheduler.render_frame(surface, &mut self.work);
        self.work.jobs.clear();
        outcome
    }

    /// Wait for the GPU and destroy everything. The first error is
    /// returned after teardown has finished. Dropping a renderer without
    /// calling this leaks its GPU objects.
    pub fn shutdown(mut self) -> GraphicsResult<()> {
        let timeout = Duration::from_millis(self.work.config.frame.fence_timeout_ms);
        let uploads = self.uploader.finish(timeout);
        let scheduler = self.scheduler.shutdown();

        let backend = Arc::clone(&self.backend);
        let RenderWork {
            pool,
            compute,
            graph,
            ..
        } = self.work;
        graph.destroy(&*backend);
        compute.destroy(&*backend);
        backend.destroy_sampler(self.sampler);
        pool.destroy(&*backend);
        log::info!("Renderer shut down");
        uploads.and(scheduler)
    }
}

impl std::fmt::Debug for Renderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Renderer")
            .field("backend", &self.backend.name())
            .field("frame_index", &self.scheduler.frame_index())
            .field("uploader", &self.uploader)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::shader::MemoryShaderSource;

    fn renderer() -> (Arc<DummyBackend>, Renderer) {
        let backend = Arc::new(DummyBackend::new());
        let renderer = Renderer::new(
            backend.clone(),
            &MemoryShaderSource::with_fallback(),
            RendererConfig::default(),
        )
        .unwrap();
        (backend, renderer)
    }

    #[test]
    fn test_empty_frame_presents() {
        let (backend, mut renderer) = renderer();
        let outcome = renderer.render_frame(&*backend).unwrap();
        assert_eq!(outcome, FrameOutcome::Presented);
        assert_eq!(renderer.frame_index(), 1);
        renderer.shutdown().unwrap();
    }

    #[test]
    fn test_missing_shader_fails_and_cleans_up() {
        let backend = Arc::new(DummyBackend::new());
        let result = Renderer::new(
            backend.clone(),
            &MemoryShaderSource::new(),
            RendererConfig::default(),
        );
        assert!(result.is_err());
        assert_eq!(backend.live_buffer_count(), 0);
        assert_eq!(backend.live_image_count(), 0);
        assert_eq!(backend.live_pipeline_count(), 0);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let backend = Arc::new(DummyBackend::new());
        let mut config = RendererConfig::default();
        config.particles.max_particles = 1000;
        let result = Renderer::new(backend, &MemoryShaderSource::with_fallback(), config);
        assert!(matches!(result, Err(GraphicsError::Config(_))));
    }

    #[test]
    fn test_material_defaults_fill_empty_slots() {
        let (backend, mut renderer) = renderer();
        let albedo = renderer
            .load_image("albedo", &ImageData::solid([10, 20, 30, 255], ImageFormat::Rgba8Srgb))
            .unwrap();
        let material = renderer
            .create_material("plain", MaterialDescriptor::Textured { base_color: albedo })
            .unwrap();

        let set = renderer.pool().get_material(material).binding_set();
        let bindings = backend.binding_set_contents(set).unwrap();
        let albedo_image = renderer.pool().get_image(albedo).image;
        let defaults = *renderer.defaults();
        let bound: Vec<_> = bindings
            .iter()
            .map(|b| match b.resource {
                crate::backend::BindingResource::SampledImage { image, .. } => image,
                ref other => panic!("unexpected binding {other:?}"),
            })
            .collect();
        assert_eq!(
            bound,
            vec![albedo_image, defaults.flat_normal, defaults.white, defaults.black]
        );
        renderer.shutdown().unwrap();
    }

    #[test]
    fn test_unknown_image_is_rejected() {
        let (_backend, mut renderer) = renderer();
        let result = renderer.create_material(
            "broken",
            MaterialDescriptor::Textured {
                base_color: Handle::from_raw(999),
            },
        );
        assert!(matches!(result, Err(GraphicsError::InvalidParameter(_))));
        renderer.shutdown().unwrap();
    }

    #[test]
    fn test_shutdown_releases_everything() {
        let (backend, mut renderer) = renderer();
        renderer
            .load_image("extra", &ImageData::solid([1, 2, 3, 4], ImageFormat::Rgba8Unorm))
            .unwrap();
        renderer.render_frame(&*backend).unwrap();
        renderer.shutdown().unwrap();
        assert_eq!(backend.live_buffer_count(), 0);
        assert_eq!(backend.live_image_count(), 0);
        assert_eq!(backend.live_pipeline_count(), 0);
        assert_eq!(backend.live_binding_set_count(), 0);
        assert_eq!(backend.live_semaphore_count(), 0);
    }
}
