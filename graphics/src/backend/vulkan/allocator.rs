//! GPU memory allocator integration using gpu-allocator.

use ash::vk;
use gpu_allocator::MemoryLocation;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};

use crate::error::GraphicsError;
use crate::types::BufferUsage;

/// Create a memory allocator for the Vulkan device.
pub fn create_allocator(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
) -> Result<Allocator, GraphicsError> {
    Allocator::new(&AllocatorCreateDesc {
        instance: instance.clone(),
        device,
        physical_device,
        debug_settings: Default::default(),
        buffer_device_address: false,
        allocation_sizes: gpu_allocator::AllocationSizes::default(),
    })
    .map_err(|e| {
        GraphicsError::InitializationFailed(format!("Failed to create memory allocator: {}", e))
    })
}

/// Host-written buffers live in mapped memory; everything else is device local.
pub fn buffer_location(usage: BufferUsage) -> MemoryLocation {
    if usage.contains(BufferUsage::HOST_WRITE) {
        MemoryLocation::CpuToGpu
    } else {
        MemoryLocation::GpuOnly
    }
}

/// Map allocator failures, keeping out-of-memory distinguishable.
pub fn allocation_error(what: &str, err: gpu_allocator::AllocationError) -> GraphicsError {
    match err {
        gpu_allocator::AllocationError::OutOfMemory => GraphicsError::OutOfMemory,
        other => GraphicsError::ResourceCreationFailed(format!(
            "Failed to allocate memory for {}: {}",
            what, other
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_location() {
        assert_eq!(
            buffer_location(BufferUsage::UNIFORM | BufferUsage::HOST_WRITE),
            MemoryLocation::CpuToGpu
        );
        assert_eq!(buffer_location(BufferUsage::STORAGE), MemoryLocation::GpuOnly);
    }

    #[test]
    fn test_out_of_memory_is_preserved() {
        let err = allocation_error("buffer", gpu_allocator::AllocationError::OutOfMemory);
        assert_eq!(err, GraphicsError::OutOfMemory);
    }
}
