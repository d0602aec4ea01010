//! Shared setup for the renderer integration tests.
//!
//! Every test runs against the dummy backend, which records submissions and
//! flags CPU access to resources the GPU may still be using.

#![allow(dead_code)]

use std::sync::Arc;

use ember_core::Handle;
use ember_graphics::resources::{Material, Mesh};
use ember_graphics::shader::MemoryShaderSource;
use ember_graphics::types::Vertex;
use ember_graphics::{
    DummyBackend, FrameOutcome, ImageData, ImageFormat, MaterialDescriptor, MeshData, Renderer,
    RendererConfig,
};

/// A renderer on a fresh dummy backend.
pub struct TestContext {
    pub backend: Arc<DummyBackend>,
    pub renderer: Renderer,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_config(RendererConfig::default())
    }

    pub fn with_config(config: RendererConfig) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let backend = Arc::new(DummyBackend::new());
        let renderer = Renderer::new(
            backend.clone(),
            &MemoryShaderSource::with_fallback(),
            config,
        )
        .expect("renderer on the dummy backend");
        Self { backend, renderer }
    }

    pub fn render(&mut self) -> FrameOutcome {
        self.renderer
            .render_frame(&*self.backend)
            .expect("frame should render")
    }

    /// A unit quad in the XY plane.
    pub fn load_quad(&mut self, name: &str) -> Handle<Mesh> {
        self.renderer
            .load_mesh(name, &quad())
            .expect("quad upload")
    }

    /// A material textured with a single solid color.
    pub fn solid_material(&mut self, name: &str, color: [u8; 4]) -> Handle<Material> {
        let image = self
            .renderer
            .load_image(name, &ImageData::solid(color, ImageFormat::Rgba8Srgb))
            .expect("image upload");
        self.renderer
            .create_material(name, MaterialDescriptor::Textured { base_color: image })
            .expect("material")
    }

    /// Shut the renderer down and check nothing was left behind.
    pub fn finish(self) {
        let Self { backend, renderer } = self;
        renderer.shutdown().expect("clean shutdown");
        assert!(backend.hazards().is_empty(), "hazards: {:?}", backend.hazards());
        assert_eq!(backend.live_buffer_count(), 0);
        assert_eq!(backend.live_image_count(), 0);
        assert_eq!(backend.live_semaphore_count(), 0);
    }
}

pub fn quad() -> MeshData {
    let corner = |x: f32, y: f32| Vertex {
        position: [x, y, 0.0],
        normal: [0.0, 0.0, 1.0],
        uv: [x + 0.5, 0.5 - y],
        tangent: [1.0, 0.0, 0.0, 1.0],
    };
    MeshData {
        vertices: vec![
            corner(-0.5, -0.5),
            corner(0.5, -0.5),
            corner(0.5, 0.5),
            corner(-0.5, 0.5),
        ],
        indices: vec![0, 1, 2, 2, 3, 0],
    }
}
