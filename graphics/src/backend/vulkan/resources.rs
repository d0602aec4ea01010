//! Native objects behind the backend's integer handles.

use std::collections::HashMap;

use ash::vk;
use gpu_allocator::vulkan::Allocation;

use crate::backend::QueueKind;
use crate::error::GraphicsError;
use crate::types::{Extent2d, ImageFormat};

use super::pipeline::{VulkanBindingSet, VulkanPipeline};

pub struct VulkanBuffer {
    pub buffer: vk::Buffer,
    pub allocation: Allocation,
    pub size: u64,
}

pub struct VulkanImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub allocation: Allocation,
    pub format: ImageFormat,
    pub extent: Extent2d,
}

pub struct VulkanCommandBuffer {
    pub buffer: vk::CommandBuffer,
    pub queue: QueueKind,
}

/// Every live object, keyed by raw handle value.
#[derive(Default)]
pub struct ResourceTables {
    pub buffers: HashMap<u64, VulkanBuffer>,
    pub images: HashMap<u64, VulkanImage>,
    pub samplers: HashMap<u64, vk::Sampler>,
    pub pipelines: HashMap<u64, VulkanPipeline>,
    pub binding_sets: HashMap<u64, VulkanBindingSet>,
    pub command_buffers: HashMap<u64, VulkanCommandBuffer>,
    pub fences: HashMap<u64, vk::Fence>,
    pub semaphores: HashMap<u64, vk::Semaphore>,
}

fn lookup<'a, T>(map: &'a HashMap<u64, T>, raw: u64, kind: &str) -> Result<&'a T, GraphicsError> {
    map.get(&raw)
        .ok_or_else(|| GraphicsError::InvalidParameter(format!("unknown {} handle {}", kind, raw)))
}

impl ResourceTables {
    pub fn buffer(&self, raw: u64) -> Result<&VulkanBuffer, GraphicsError> {
        lookup(&self.buffers, raw, "buffer")
    }

    pub fn image(&self, raw: u64) -> Result<&VulkanImage, GraphicsError> {
        lookup(&self.images, raw, "image")
    }

    pub fn sampler(&self, raw: u64) -> Result<vk::Sampler, GraphicsError> {
        lookup(&self.samplers, raw, "sampler").copied()
    }

    pub fn pipeline(&self, raw: u64) -> Result<&VulkanPipeline, GraphicsError> {
        lookup(&self.pipelines, raw, "pipeline")
    }

    pub fn binding_set(&self, raw: u64) -> Result<&VulkanBindingSet, GraphicsError> {
        lookup(&self.binding_sets, raw, "binding set")
    }

    pub fn command_buffer(&self, raw: u64) -> Result<&VulkanCommandBuffer, GraphicsError> {
        lookup(&self.command_buffers, raw, "command buffer")
    }

    pub fn fence(&self, raw: u64) -> Result<vk::Fence, GraphicsError> {
        lookup(&self.fences, raw, "fence").copied()
    }

    pub fn semaphore(&self, raw: u64) -> Result<vk::Semaphore, GraphicsError> {
        lookup(&self.semaphores, raw, "semaphore").copied()
    }

    /// Objects still alive, for the shutdown leak report.
    pub fn live_count(&self) -> usize {
        self.buffers.len()
            + self.images.len()
            + self.samplers.len()
            + self.pipelines.len()
            + self.binding_sets.len()
            + self.command_buffers.len()
            + self.fences.len()
            + self.semaphores.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_handles_are_rejected() {
        let tables = ResourceTables::default();
        let err = tables.semaphore(4).unwrap_err();
        assert_eq!(
            err,
            GraphicsError::InvalidParameter("unknown semaphore handle 4".to_string())
        );
        assert!(tables.buffer(1).is_err());
        assert_eq!(tables.live_count(), 0);
    }

    #[test]
    fn test_lookup_finds_inserted() {
        let mut tables = ResourceTables::default();
        tables.fences.insert(3, vk::Fence::null());
        assert_eq!(tables.fence(3).unwrap(), vk::Fence::null());
        assert_eq!(tables.live_count(), 1);
    }
}
