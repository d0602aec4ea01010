//! Buffer types and descriptors.

use bitflags::bitflags;

bitflags! {
    /// How a buffer is bound. Only `HOST_WRITE` buffers are persistently
    /// mapped and accept `write_buffer`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
        const UNIFORM = 1 << 2;
        const STORAGE = 1 << 3;
        /// Source of indirect draw arguments.
        const INDIRECT = 1 << 4;
        const COPY_SRC = 1 << 5;
        const COPY_DST = 1 << 6;
        const HOST_WRITE = 1 << 7;
    }
}

impl Default for BufferUsage {
    fn default() -> Self {
        Self::empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct BufferDescriptor {
    pub label: Option<String>,
    /// Size in bytes. Zero-sized buffers are rejected by the backends.
    pub size: u64,
    pub usage: BufferUsage,
}

impl BufferDescriptor {
    pub fn new(size: u64, usage: BufferUsage) -> Self {
        Self {
            label: None,
            size,
            usage,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Arguments for a non-indexed indirect draw.
///
/// Matches the layout of `VkDrawIndirectCommand`. The particle pass keeps
/// one per frame slot and the sort stage copies the live particle count into
/// `instance_count`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, bytemuck::Pod, bytemuck::Zeroable)]
pub struct DrawIndirectCommand {
    pub vertex_count: u32,
    /// Written by the sort stage.
    pub instance_count: u32,
    pub first_vertex: u32,
    pub first_instance: u32,
}

static_assertions::const_assert_eq!(std::mem::size_of::<DrawIndirectCommand>(), 16);

impl DrawIndirectCommand {
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;

    /// Byte offset of `instance_count`.
    pub const INSTANCE_COUNT_OFFSET: u64 = 4;

    pub fn new(vertex_count: u32, instance_count: u32) -> Self {
        Self {
            vertex_count,
            instance_count,
            first_vertex: 0,
            first_instance: 0,
        }
    }
}
