//! # Ember Graphics
//!
//! Frame orchestration and GPU synchronization for a real-time renderer on
//! an explicit, multi-queue GPU model.
//!
//! ## Overview
//!
//! This crate provides:
//! - [`Renderer`] - The context owning every subsystem below
//! - [`FrameScheduler`] - Double-buffered acquire, compute, graphics and present
//! - [`ComputeSubsystem`] - Skinning, particle simulation and bitonic depth sort
//! - [`RenderGraph`] - Shadow, scene, bloom and composite passes
//! - [`ResourcePool`] - Handle-addressed long-lived resources with deferred release
//! - [`GpuBackend`] - The device abstraction, with Vulkan and dummy implementations
//! - [`environment`] - Offline irradiance and prefiltered map generation
//!
//! ## Example
//!
//! ```ignore
//! use ember_graphics::{Renderer, RendererConfig, StaticRenderJob};
//!
//! let mut renderer = Renderer::with_window(RendererConfig::default(), &window, extent)?;
//! let mesh = renderer.load_mesh("cube", &cube)?;
//! loop {
//!     renderer.jobs().add_static(StaticRenderJob::new(mesh, material, transform));
//!     renderer.render_frame(&surface)?;
//! }
//! renderer.shutdown()?;
//! ```

pub mod backend;
pub mod command;
pub mod compute;
pub mod config;
pub mod environment;
pub mod error;
pub mod frame;
pub mod graph;
pub mod renderer;
pub mod resources;
pub mod shader;
pub mod transition;
pub mod types;

// Re-export main types for convenience
pub use backend::{GpuBackend, NativeWindow, create_backend, dummy::DummyBackend};
pub use compute::ComputeSubsystem;
pub use config::{FRAME_OVERLAP, RendererConfig};
pub use error::{GraphicsError, GraphicsResult};
pub use frame::{FrameOutcome, FrameScheduler};
pub use graph::{
    AnimationBlend, Camera, DirectionalLight, EmitterJob, FrameJobs, RenderGraph,
    SkeletalRenderJob, StaticRenderJob,
};
pub use renderer::{DrawableSurface, Renderer};
pub use resources::{
    AnimationData, FontAtlasData, ImageData, MaterialDescriptor, MeshData, ResourcePool,
    SkeletalMeshData,
};
pub use types::{Extent2d, ImageFormat};

/// Graphics library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_dummy_backend() {
        let backend = DummyBackend::new();
        assert_eq!(backend.name(), "Dummy Backend");
    }
}
