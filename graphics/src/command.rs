//! Backend-neutral command recording.
//!
//! Passes and compute stages record into a [`CommandList`]; the backend
//! encodes the list into a native command buffer at submission time. Keeping
//! the recording separate from the API lets the dummy backend inspect exactly
//! what a frame would have executed.

use bitflags::bitflags;

use crate::backend::{
    BindingSetHandle, BufferHandle, ImageHandle, PipelineHandle, QueueKind,
};
use crate::types::{ClearValue, Extent2d, ScissorRect, Viewport};

bitflags! {
    /// Pipeline stages used as barrier and semaphore wait scopes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PipelineStages: u32 {
        const TOP_OF_PIPE = 1 << 0;
        const DRAW_INDIRECT = 1 << 1;
        const VERTEX_INPUT = 1 << 2;
        const VERTEX_SHADER = 1 << 3;
        const FRAGMENT_SHADER = 1 << 4;
        const EARLY_FRAGMENT_TESTS = 1 << 5;
        const LATE_FRAGMENT_TESTS = 1 << 6;
        const COLOR_ATTACHMENT_OUTPUT = 1 << 7;
        const COMPUTE_SHADER = 1 << 8;
        const TRANSFER = 1 << 9;
        const BOTTOM_OF_PIPE = 1 << 10;
    }
}

bitflags! {
    /// Memory access kinds used by barriers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Access: u32 {
        const INDIRECT_COMMAND_READ = 1 << 0;
        const INDEX_READ = 1 << 1;
        const VERTEX_ATTRIBUTE_READ = 1 << 2;
        const UNIFORM_READ = 1 << 3;
        const SHADER_READ = 1 << 4;
        const SHADER_WRITE = 1 << 5;
        const COLOR_ATTACHMENT_WRITE = 1 << 6;
        const DEPTH_ATTACHMENT_READ = 1 << 7;
        const DEPTH_ATTACHMENT_WRITE = 1 << 8;
        const TRANSFER_READ = 1 << 9;
        const TRANSFER_WRITE = 1 << 10;
    }
}

/// Image layouts the renderer moves images through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ImageLayout {
    #[default]
    Undefined,
    General,
    ColorAttachment,
    DepthAttachment,
    ShaderReadOnly,
    TransferSrc,
    TransferDst,
    Present,
}

/// Which aspect of an image a barrier covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ImageAspect {
    #[default]
    Color,
    Depth,
}

/// An image as seen by a command: either a pool-owned image or one of the
/// swapchain images by index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageRef {
    Image(ImageHandle),
    Swapchain(u32),
}

impl From<ImageHandle> for ImageRef {
    fn from(image: ImageHandle) -> Self {
        Self::Image(image)
    }
}

/// Queue family ownership transfer carried by a barrier. The same barrier is
/// recorded once on the releasing queue and once on the acquiring queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueTransfer {
    pub src: QueueKind,
    pub dst: QueueKind,
}

/// Memory barrier on a buffer range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBarrier {
    pub buffer: BufferHandle,
    pub offset: u64,
    /// Byte count, `u64::MAX` for the rest of the buffer.
    pub size: u64,
    pub src_access: Access,
    pub dst_access: Access,
}

/// Layout transition and memory barrier on a whole image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBarrier {
    pub image: ImageRef,
    pub old_layout: ImageLayout,
    pub new_layout: ImageLayout,
    pub src_access: Access,
    pub dst_access: Access,
    pub aspect: ImageAspect,
    pub ownership: Option<QueueTransfer>,
}

impl ImageBarrier {
    /// A color image transition without ownership transfer.
    pub fn new(
        image: impl Into<ImageRef>,
        old_layout: ImageLayout,
        new_layout: ImageLayout,
        src_access: Access,
        dst_access: Access,
    ) -> Self {
        Self {
            image: image.into(),
            old_layout,
            new_layout,
            src_access,
            dst_access,
            aspect: ImageAspect::Color,
            ownership: None,
        }
    }

    pub fn depth(mut self) -> Self {
        self.aspect = ImageAspect::Depth;
        self
    }

    pub fn with_ownership(mut self, src: QueueKind, dst: QueueKind) -> Self {
        self.ownership = Some(QueueTransfer { src, dst });
        self
    }
}

/// A pipeline barrier with any number of buffer and image barriers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Barrier {
    pub src_stages: PipelineStages,
    pub dst_stages: PipelineStages,
    pub buffers: Vec<BufferBarrier>,
    pub images: Vec<ImageBarrier>,
}

impl Barrier {
    pub fn new(src_stages: PipelineStages, dst_stages: PipelineStages) -> Self {
        Self {
            src_stages,
            dst_stages,
            buffers: Vec::new(),
            images: Vec::new(),
        }
    }

    /// Add a barrier on the whole buffer.
    pub fn buffer(mut self, buffer: BufferHandle, src_access: Access, dst_access: Access) -> Self {
        self.buffers.push(BufferBarrier {
            buffer,
            offset: 0,
            size: u64::MAX,
            src_access,
            dst_access,
        });
        self
    }

    pub fn image(mut self, barrier: ImageBarrier) -> Self {
        self.images.push(barrier);
        self
    }
}

/// Color attachment of a rendering scope.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorAttachment {
    pub target: ImageRef,
    pub clear: ClearValue,
}

/// Depth attachment of a rendering scope.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthAttachment {
    pub image: ImageHandle,
    pub clear: ClearValue,
}

/// A single recorded command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    BeginRendering {
        color: Option<ColorAttachment>,
        depth: Option<DepthAttachment>,
        extent: Extent2d,
    },
    EndRendering,
    BindPipeline(PipelineHandle),
    BindBindingSet {
        set: u32,
        binding_set: BindingSetHandle,
    },
    PushConstants(Vec<u8>),
    SetViewport(Viewport),
    SetScissor(ScissorRect),
    BindVertexBuffer(BufferHandle),
    /// 32-bit indices.
    BindIndexBuffer(BufferHandle),
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        first_instance: u32,
    },
    DrawIndirect {
        buffer: BufferHandle,
        offset: u64,
        draw_count: u32,
        stride: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    /// Fill `size` bytes at `offset` with a repeated 32-bit word.
    FillBuffer {
        buffer: BufferHandle,
        offset: u64,
        size: u64,
        value: u32,
    },
    CopyBuffer {
        src: BufferHandle,
        src_offset: u64,
        dst: BufferHandle,
        dst_offset: u64,
        size: u64,
    },
    /// Copy tightly packed pixels starting at `buffer_offset` into one mip
    /// level of an image in `TransferDst`. `extent` is the level's extent.
    CopyBufferToImage {
        buffer: BufferHandle,
        buffer_offset: u64,
        image: ImageHandle,
        mip_level: u32,
        extent: Extent2d,
    },
    Barrier(Barrier),
}

/// Ordered list of commands for one submission.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandList {
    commands: Vec<Command>,
}

impl CommandList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn clear(&mut self) {
        self.commands.clear();
    }

    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    /// Append every command of `other`.
    pub fn append(&mut self, other: &mut CommandList) {
        self.commands.append(&mut other.commands);
    }

    pub fn begin_rendering(
        &mut self,
        color: Option<ColorAttachment>,
        depth: Option<DepthAttachment>,
        extent: Extent2d,
    ) {
        self.push(Command::BeginRendering {
            color,
            depth,
            extent,
        });
    }

    pub fn end_rendering(&mut self) {
        self.push(Command::EndRendering);
    }

    pub fn bind_pipeline(&mut self, pipeline: PipelineHandle) {
        self.push(Command::BindPipeline(pipeline));
    }

    pub fn bind_binding_set(&mut self, set: u32, binding_set: BindingSetHandle) {
        self.push(Command::BindBindingSet { set, binding_set });
    }

    pub fn push_constants<T: bytemuck::Pod>(&mut self, data: &T) {
        self.push(Command::PushConstants(bytemuck::bytes_of(data).to_vec()));
    }

    /// Viewport and scissor covering `extent`.
    pub fn set_viewport_and_scissor(&mut self, extent: Extent2d) {
        self.push(Command::SetViewport(Viewport::from_extent(extent)));
        self.push(Command::SetScissor(ScissorRect::from_extent(extent)));
    }

    pub fn bind_vertex_buffer(&mut self, buffer: BufferHandle) {
        self.push(Command::BindVertexBuffer(buffer));
    }

    pub fn bind_index_buffer(&mut self, buffer: BufferHandle) {
        self.push(Command::BindIndexBuffer(buffer));
    }

    pub fn draw(&mut self, vertex_count: u32, instance_count: u32) {
        self.push(Command::Draw {
            vertex_count,
            instance_count,
            first_vertex: 0,
            first_instance: 0,
        });
    }

    /// Non-indexed draw of `instance_count` instances starting at `first_instance`.
    pub fn draw_instances(&mut self, vertex_count: u32, first_instance: u32, instance_count: u32) {
        self.push(Command::Draw {
            vertex_count,
            instance_count,
            first_vertex: 0,
            first_instance,
        });
    }

    pub fn draw_indexed(&mut self, index_count: u32, first_instance: u32, instance_count: u32) {
        self.push(Command::DrawIndexed {
            index_count,
            instance_count,
            first_index: 0,
            first_instance,
        });
    }

    pub fn draw_indirect(&mut self, buffer: BufferHandle, offset: u64) {
        self.push(Command::DrawIndirect {
            buffer,
            offset,
            draw_count: 1,
            stride: std::mem::size_of::<crate::types::DrawIndirectCommand>() as u32,
        });
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.push(Command::Dispatch { x, y, z });
    }

    pub fn fill_buffer(&mut self, buffer: BufferHandle, offset: u64, size: u64, value: u32) {
        self.push(Command::FillBuffer {
            buffer,
            offset,
            size,
            value,
        });
    }

    pub fn copy_buffer(
        &mut self,
        src: BufferHandle,
        src_offset: u64,
        dst: BufferHandle,
        dst_offset: u64,
        size: u64,
    ) {
        self.push(Command::CopyBuffer {
            src,
            src_offset,
            dst,
            dst_offset,
            size,
        });
    }

    pub fn copy_buffer_to_image(
        &mut self,
        buffer: BufferHandle,
        buffer_offset: u64,
        image: ImageHandle,
        mip_level: u32,
        extent: Extent2d,
    ) {
        self.push(Command::CopyBufferToImage {
            buffer,
            buffer_offset,
            image,
            mip_level,
            extent,
        });
    }

    pub fn barrier(&mut self, barrier: Barrier) {
        self.push(Command::Barrier(barrier));
    }

    /// Buffers named directly by commands in this list. Buffers reached
    /// through binding sets are not included.
    pub fn direct_buffers(&self) -> Vec<BufferHandle> {
        let mut buffers = Vec::new();
        for command in &self.commands {
            match command {
                Command::BindVertexBuffer(b) | Command::BindIndexBuffer(b) => buffers.push(*b),
                Command::DrawIndirect { buffer, .. } | Command::FillBuffer { buffer, .. } => {
                    buffers.push(*buffer)
                }
                Command::CopyBuffer { src, dst, .. } => {
                    buffers.push(*src);
                    buffers.push(*dst);
                }
                Command::CopyBufferToImage { buffer, .. } => buffers.push(*buffer),
                Command::Barrier(barrier) => {
                    buffers.extend(barrier.buffers.iter().map(|b| b.buffer));
                }
                _ => {}
            }
        }
        buffers.sort_unstable();
        buffers.dedup();
        buffers
    }

    /// Binding sets bound anywhere in this list.
    pub fn binding_sets(&self) -> Vec<BindingSetHandle> {
        let mut sets: Vec<_> = self
            .commands
            .iter()
            .filter_map(|c| match c {
                Command::BindBindingSet { binding_set, .. } => Some(*binding_set),
                _ => None,
            })
            .collect();
        sets.sort_unstable();
        sets.dedup();
        sets
    }

    /// Number of `Dispatch` commands.
    pub fn dispatch_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|c| matches!(c, Command::Dispatch { .. }))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_buffers_are_deduplicated() {
        let a = BufferHandle::from_raw(1);
        let b = BufferHandle::from_raw(2);
        let mut list = CommandList::new();
        list.fill_buffer(a, 0, 4, 0);
        list.barrier(
            Barrier::new(PipelineStages::TRANSFER, PipelineStages::COMPUTE_SHADER).buffer(
                a,
                Access::TRANSFER_WRITE,
                Access::SHADER_READ,
            ),
        );
        list.copy_buffer(a, 0, b, 4, 4);
        assert_eq!(list.direct_buffers(), vec![a, b]);
    }

    #[test]
    fn test_recording_order() {
        let mut list = CommandList::new();
        list.dispatch(4, 1, 1);
        list.set_viewport_and_scissor(Extent2d::new(8, 8));
        list.dispatch(2, 1, 1);
        assert_eq!(list.len(), 4);
        assert_eq!(list.dispatch_count(), 2);
        assert!(matches!(list.commands()[0], Command::Dispatch { x: 4, .. }));
        assert!(matches!(list.commands()[2], Command::SetScissor(_)));
    }
}
