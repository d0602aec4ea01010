//! GPU backend abstraction layer.
//!
//! Resources are referred to by plain integer handles; the backend owns the
//! native objects behind them. Every method takes `&self` so a backend can be
//! shared as `Arc<dyn GpuBackend>` between the render thread and the upload
//! path.
//!
//! # Available Backends
//!
//! - `vulkan` (feature `vulkan-backend`, default): native Vulkan through ash
//! - `dummy`: records submissions and checks CPU/GPU hazards, used by tests

#[cfg(feature = "vulkan-backend")]
pub mod vulkan;

pub mod dummy;

use std::sync::Arc;
use std::time::Duration;

use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::command::{CommandList, PipelineStages};
use crate::config::{BackendKind, DeviceConfig};
use crate::error::{GraphicsError, GraphicsResult};
use crate::types::{
    BufferDescriptor, ComputePipelineDescriptor, Extent2d, GraphicsPipelineDescriptor,
    ImageDescriptor, ImageFormat, SamplerDescriptor,
};

macro_rules! gpu_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u64);

        impl $name {
            pub const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            pub const fn raw(self) -> u64 {
                self.0
            }
        }
    };
}

gpu_handle!(
    /// Handle to a GPU buffer.
    BufferHandle
);
gpu_handle!(
    /// Handle to a GPU image and its default view.
    ImageHandle
);
gpu_handle!(
    /// Handle to a sampler.
    SamplerHandle
);
gpu_handle!(
    /// Handle to a compute or graphics pipeline and its layout.
    PipelineHandle
);
gpu_handle!(
    /// Handle to a descriptor set allocated for one set index of a pipeline.
    BindingSetHandle
);
gpu_handle!(
    /// Handle to a command buffer bound to one queue.
    CommandBufferHandle
);
gpu_handle!(
    /// Handle to a fence for CPU-GPU synchronization.
    FenceHandle
);
gpu_handle!(
    /// Handle to a binary semaphore for GPU-GPU synchronization.
    SemaphoreHandle
);

/// The three execution queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Graphics,
    Compute,
    Transfer,
}

impl QueueKind {
    pub const ALL: [QueueKind; 3] = [Self::Graphics, Self::Compute, Self::Transfer];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Graphics => "graphics",
            Self::Compute => "compute",
            Self::Transfer => "transfer",
        }
    }
}

/// Resource bound at one binding of a binding set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingResource {
    /// Uniform or storage buffer range, `size == u64::MAX` for the whole buffer.
    Buffer {
        buffer: BufferHandle,
        offset: u64,
        size: u64,
    },
    SampledImage {
        image: ImageHandle,
        sampler: SamplerHandle,
    },
    StorageImage(ImageHandle),
}

impl BindingResource {
    /// The whole of `buffer`.
    pub fn buffer(buffer: BufferHandle) -> Self {
        Self::Buffer {
            buffer,
            offset: 0,
            size: u64::MAX,
        }
    }
}

/// One entry written into a binding set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub binding: u32,
    pub resource: BindingResource,
}

impl Binding {
    pub fn new(binding: u32, resource: BindingResource) -> Self {
        Self { binding, resource }
    }
}

/// Semaphore a submission waits on, and the stages that wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemaphoreWait {
    pub semaphore: SemaphoreHandle,
    pub stages: PipelineStages,
}

/// Everything needed to encode and submit one command buffer.
#[derive(Debug, Clone, Copy)]
pub struct Submission<'a> {
    pub queue: QueueKind,
    pub command_buffer: CommandBufferHandle,
    pub commands: &'a CommandList,
    pub waits: &'a [SemaphoreWait],
    pub signals: &'a [SemaphoreHandle],
    pub fence: Option<FenceHandle>,
}

/// Current swapchain properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainInfo {
    pub extent: Extent2d,
    pub format: ImageFormat,
    pub image_count: u32,
}

/// A window the Vulkan backend can create a surface for.
pub trait NativeWindow: HasWindowHandle + HasDisplayHandle {}

impl<T: HasWindowHandle + HasDisplayHandle> NativeWindow for T {}

/// GPU backend trait.
pub trait GpuBackend: Send + Sync + 'static {
    /// Get the backend name.
    fn name(&self) -> &'static str;

    /// Create a buffer. Buffers with `HOST_WRITE` accept [`write_buffer`](Self::write_buffer).
    fn create_buffer(&self, descriptor: &BufferDescriptor) -> GraphicsResult<BufferHandle>;

    /// Copy `data` into a host-visible buffer.
    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> GraphicsResult<()>;

    fn destroy_buffer(&self, buffer: BufferHandle);

    fn create_image(&self, descriptor: &ImageDescriptor) -> GraphicsResult<ImageHandle>;

    fn destroy_image(&self, image: ImageHandle);

    fn create_sampler(&self, descriptor: &SamplerDescriptor) -> GraphicsResult<SamplerHandle>;

    fn destroy_sampler(&self, sampler: SamplerHandle);

    fn create_compute_pipeline(
        &self,
        descriptor: &ComputePipelineDescriptor,
    ) -> GraphicsResult<PipelineHandle>;

    fn create_graphics_pipeline(
        &self,
        descriptor: &GraphicsPipelineDescriptor,
    ) -> GraphicsResult<PipelineHandle>;

    fn destroy_pipeline(&self, pipeline: PipelineHandle);

    /// Allocate a binding set for set `set_index` of `pipeline`'s layout and
    /// write `bindings` into it.
    fn create_binding_set(
        &self,
        pipeline: PipelineHandle,
        set_index: u32,
        bindings: &[Binding],
    ) -> GraphicsResult<BindingSetHandle>;

    fn destroy_binding_set(&self, binding_set: BindingSetHandle);

    fn create_command_buffer(&self, queue: QueueKind) -> GraphicsResult<CommandBufferHandle>;

    fn destroy_command_buffer(&self, command_buffer: CommandBufferHandle);

    fn create_fence(&self, signaled: bool) -> GraphicsResult<FenceHandle>;

    /// Wait for a fence. Returns `Ok(false)` if `timeout` elapsed first.
    fn wait_fence(&self, fence: FenceHandle, timeout: Duration) -> GraphicsResult<bool>;

    fn reset_fence(&self, fence: FenceHandle) -> GraphicsResult<()>;

    /// Check if a fence is signaled (non-blocking).
    fn is_fence_signaled(&self, fence: FenceHandle) -> GraphicsResult<bool>;

    fn destroy_fence(&self, fence: FenceHandle);

    fn create_semaphore(&self) -> GraphicsResult<SemaphoreHandle>;

    fn destroy_semaphore(&self, semaphore: SemaphoreHandle);

    /// Encode `submission.commands` into its command buffer and submit it.
    fn submit(&self, submission: &Submission<'_>) -> GraphicsResult<()>;

    /// Acquire the next swapchain image, signalling `signal` when it is
    /// ready. Returns [`GraphicsError::SurfaceOutdated`] when the swapchain
    /// no longer matches the surface.
    fn acquire_next_image(&self, signal: SemaphoreHandle) -> GraphicsResult<u32>;

    /// Present `image_index` after `wait` is signalled. A suboptimal or
    /// outdated surface is reported as [`GraphicsError::SurfaceOutdated`].
    fn present(&self, image_index: u32, wait: SemaphoreHandle) -> GraphicsResult<()>;

    /// Rebuild the swapchain for `extent`. The device must be idle.
    fn recreate_swapchain(&self, extent: Extent2d) -> GraphicsResult<SwapchainInfo>;

    fn swapchain_info(&self) -> SwapchainInfo;

    /// Block until every queue is idle.
    fn wait_idle(&self) -> GraphicsResult<()>;
}

/// Create the backend named by `config.backend`.
///
/// The Vulkan backend needs a window to present to. There is no silent
/// fallback: a backend that fails to initialize is an error.
pub fn create_backend(
    config: &DeviceConfig,
    window: Option<&dyn NativeWindow>,
    extent: Extent2d,
) -> GraphicsResult<Arc<dyn GpuBackend>> {
    match config.backend {
        BackendKind::Dummy => {
            log::info!("Using dummy backend");
            Ok(Arc::new(dummy::DummyBackend::with_surface(extent)))
        }
        #[cfg(feature = "vulkan-backend")]
        BackendKind::Vulkan => {
            let window = window.ok_or_else(|| {
                GraphicsError::InitializationFailed(
                    "Vulkan backend requires a window".to_string(),
                )
            })?;
            let backend = vulkan::VulkanBackend::new(config, window, extent)?;
            log::info!("Using Vulkan backend (ash)");
            Ok(Arc::new(backend))
        }
        #[cfg(not(feature = "vulkan-backend"))]
        BackendKind::Vulkan => {
            let _ = window;
            Err(GraphicsError::FeatureNotSupported(
                "built without the vulkan-backend feature".to_string(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dummy_backend_selection() {
        let config = DeviceConfig {
            backend: BackendKind::Dummy,
            ..Default::default()
        };
        let backend = create_backend(&config, None, Extent2d::new(320, 240)).unwrap();
        assert_eq!(backend.name(), "Dummy Backend");
        assert_eq!(backend.swapchain_info().extent, Extent2d::new(320, 240));
    }

    #[cfg(feature = "vulkan-backend")]
    #[test]
    fn test_vulkan_without_window_fails() {
        let config = DeviceConfig::default();
        let err = create_backend(&config, None, Extent2d::new(1, 1)).err();
        assert!(matches!(err, Some(GraphicsError::InitializationFailed(_))));
    }

    #[test]
    fn test_handles_are_ordered() {
        assert!(BufferHandle::from_raw(1) < BufferHandle::from_raw(2));
        assert_eq!(FenceHandle::from_raw(7).raw(), 7);
    }
}
