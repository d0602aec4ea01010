//! Per-queue command pools.

use ash::vk;

use crate::error::GraphicsError;

/// Create a command pool whose buffers are re-recorded every submission.
pub fn create_command_pool(
    device: &ash::Device,
    queue_family_index: u32,
) -> Result<vk::CommandPool, GraphicsError> {
    let pool_info = vk::CommandPoolCreateInfo::default()
        .queue_family_index(queue_family_index)
        .flags(
            vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER
                | vk::CommandPoolCreateFlags::TRANSIENT,
        );

    // SAFETY: device is a valid logical device.
    unsafe { device.create_command_pool(&pool_info, None) }.map_err(|e| {
        GraphicsError::InitializationFailed(format!("Failed to create command pool: {:?}", e))
    })
}

/// Allocate one primary command buffer from `pool`.
pub fn allocate_command_buffer(
    device: &ash::Device,
    pool: vk::CommandPool,
) -> Result<vk::CommandBuffer, GraphicsError> {
    let alloc_info = vk::CommandBufferAllocateInfo::default()
        .command_pool(pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);

    // SAFETY: the caller holds the pool's queue lock.
    let buffers = unsafe { device.allocate_command_buffers(&alloc_info) }
        .map_err(super::conversion::map_vk_err)?;
    buffers.into_iter().next().ok_or_else(|| {
        GraphicsError::ResourceCreationFailed("No command buffer allocated".to_string())
    })
}
