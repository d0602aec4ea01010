//! Translates a [`CommandList`] into native command buffer calls.

use ash::vk;

use crate::backend::QueueKind;
use crate::command::{BufferBarrier, Command, CommandList, ImageBarrier, ImageRef};
use crate::error::GraphicsError;
use crate::types::Extent2d;

use super::conversion::{
    convert_access, convert_aspect, convert_layout, convert_load, convert_stages,
};
use super::device::QueueFamilies;
use super::resources::ResourceTables;
use super::swapchain::VulkanSwapchain;

/// Everything a recording needs to resolve handles.
pub struct EncodeContext<'a> {
    pub device: &'a ash::Device,
    pub resources: &'a ResourceTables,
    pub swapchain: &'a VulkanSwapchain,
    pub families: &'a QueueFamilies,
    /// Queue the command buffer will be submitted to.
    pub queue: QueueKind,
}

/// Pipeline state that later commands depend on.
struct BoundPipeline {
    layout: vk::PipelineLayout,
    bind_point: vk::PipelineBindPoint,
    push_stages: vk::ShaderStageFlags,
}

impl EncodeContext<'_> {
    fn image(&self, target: ImageRef) -> Result<(vk::Image, vk::ImageView), GraphicsError> {
        match target {
            ImageRef::Image(handle) => {
                let image = self.resources.image(handle.raw())?;
                Ok((image.image, image.view))
            }
            ImageRef::Swapchain(index) => {
                let index = index as usize;
                match (self.swapchain.images.get(index), self.swapchain.views.get(index)) {
                    (Some(&image), Some(&view)) => Ok((image, view)),
                    _ => Err(GraphicsError::InvalidParameter(format!(
                        "swapchain image {} out of range",
                        index
                    ))),
                }
            }
        }
    }

    /// Record `commands` into `cmd`, which must be in the recording state.
    pub fn encode(&self, cmd: vk::CommandBuffer, commands: &CommandList) -> Result<(), GraphicsError> {
        let device = self.device;
        let mut bound: Option<BoundPipeline> = None;

        for command in commands.commands() {
            match command {
                Command::BeginRendering {
                    color,
                    depth,
                    extent,
                } => self.begin_rendering(cmd, color.as_ref(), depth.as_ref(), *extent)?,
                Command::EndRendering => {
                    // SAFETY: cmd is recording inside a rendering scope.
                    unsafe { device.cmd_end_rendering(cmd) };
                }
                Command::BindPipeline(handle) => {
                    let pipeline = self.resources.pipeline(handle.raw())?;
                    // SAFETY: cmd is recording; the pipeline is alive.
                    unsafe { device.cmd_bind_pipeline(cmd, pipeline.bind_point, pipeline.pipeline) };
                    bound = Some(BoundPipeline {
                        layout: pipeline.layout,
                        bind_point: pipeline.bind_point,
                        push_stages: pipeline.push_stages,
                    });
                }
                Command::BindBindingSet { set, binding_set } => {
                    let pipeline = bound.as_ref().ok_or_else(|| no_pipeline("bind a binding set"))?;
                    let binding_set = self.resources.binding_set(binding_set.raw())?;
                    // SAFETY: set layouts are shared through the layout cache.
                    unsafe {
                        device.cmd_bind_descriptor_sets(
                            cmd,
                            pipeline.bind_point,
                            pipeline.layout,
                            *set,
                            &[binding_set.set],
                            &[],
                        )
                    };
                }
                Command::PushConstants(data) => {
                    let pipeline = bound.as_ref().ok_or_else(|| no_pipeline("push constants"))?;
                    // SAFETY: the layout declares a push range covering both stages.
                    unsafe {
                        device.cmd_push_constants(cmd, pipeline.layout, pipeline.push_stages, 0, data)
                    };
                }
                Command::SetViewport(viewport) => {
                    let viewport = vk::Viewport {
                        x: viewport.x,
                        y: viewport.y,
                        width: viewport.width,
                        height: viewport.height,
                        min_depth: viewport.min_depth,
                        max_depth: viewport.max_depth,
                    };
                    // SAFETY: viewport is dynamic state in every graphics pipeline.
                    unsafe { device.cmd_set_viewport(cmd, 0, &[viewport]) };
                }
                Command::SetScissor(rect) => {
                    let scissor = vk::Rect2D {
                        offset: vk::Offset2D {
                            x: rect.x,
                            y: rect.y,
                        },
                        extent: vk::Extent2D {
                            width: rect.width,
                            height: rect.height,
                        },
                    };
                    // SAFETY: scissor is dynamic state in every graphics pipeline.
                    unsafe { device.cmd_set_scissor(cmd, 0, &[scissor]) };
                }
                Command::BindVertexBuffer(buffer) => {
                    let buffer = self.resources.buffer(buffer.raw())?;
                    // SAFETY: cmd is recording; the buffer is alive.
                    unsafe { device.cmd_bind_vertex_buffers(cmd, 0, &[buffer.buffer], &[0]) };
                }
                Command::BindIndexBuffer(buffer) => {
                    let buffer = self.resources.buffer(buffer.raw())?;
                    // SAFETY: as above.
                    unsafe {
                        device.cmd_bind_index_buffer(cmd, buffer.buffer, 0, vk::IndexType::UINT32)
                    };
                }
                Command::Draw {
                    vertex_count,
                    instance_count,
                    first_vertex,
                    first_instance,
                } => {
                    // SAFETY: a graphics pipeline is bound by the recorder.
                    unsafe {
                        device.cmd_draw(
                            cmd,
                            *vertex_count,
                            *instance_count,
                            *first_vertex,
                            *first_instance,
                        )
                    };
                }
                Command::DrawIndexed {
                    index_count,
                    instance_count,
                    first_index,
                    first_instance,
                } => {
                    // SAFETY: as above.
                    unsafe {
                        device.cmd_draw_indexed(
                            cmd,
                            *index_count,
                            *instance_count,
                            *first_index,
                            0,
                            *first_instance,
                        )
                    };
                }
                Command::DrawIndirect {
                    buffer,
                    offset,
                    draw_count,
                    stride,
                } => {
                    let buffer = self.resources.buffer(buffer.raw())?;
                    // SAFETY: as above.
                    unsafe {
                        device.cmd_draw_indirect(cmd, buffer.buffer, *offset, *draw_count, *stride)
                    };
                }
                Command::Dispatch { x, y, z } => {
                    // SAFETY: a compute pipeline is bound by the recorder.
                    unsafe { device.cmd_dispatch(cmd, *x, *y, *z) };
                }
                Command::FillBuffer {
                    buffer,
                    offset,
                    size,
                    value,
                } => {
                    let buffer = self.resources.buffer(buffer.raw())?;
                    // SAFETY: the buffer was created with COPY_DST.
                    unsafe {
                        device.cmd_fill_buffer(cmd, buffer.buffer, *offset, whole(*size), *value)
                    };
                }
                Command::CopyBuffer {
                    src,
                    src_offset,
                    dst,
                    dst_offset,
                    size,
                } => {
                    let src = self.resources.buffer(src.raw())?;
                    let dst = self.resources.buffer(dst.raw())?;
                    let region = vk::BufferCopy {
                        src_offset: *src_offset,
                        dst_offset: *dst_offset,
                        size: *size,
                    };
                    // SAFETY: both buffers are alive and the ranges were sized by the recorder.
                    unsafe { device.cmd_copy_buffer(cmd, src.buffer, dst.buffer, &[region]) };
                }
                Command::CopyBufferToImage {
                    buffer,
                    buffer_offset,
                    image,
                    mip_level,
                    extent,
                } => {
                    let buffer = self.resources.buffer(buffer.raw())?;
                    let image = self.resources.image(image.raw())?;
                    let region = vk::BufferImageCopy::default()
                        .buffer_offset(*buffer_offset)
                        .image_subresource(
                            vk::ImageSubresourceLayers::default()
                                .aspect_mask(vk::ImageAspectFlags::COLOR)
                                .mip_level(*mip_level)
                                .layer_count(1),
                        )
                        .image_extent(vk::Extent3D {
                            width: extent.width,
                            height: extent.height,
                            depth: 1,
                        });
                    // SAFETY: the image was moved to TransferDst by a preceding barrier.
                    unsafe {
                        device.cmd_copy_buffer_to_image(
                            cmd,
                            buffer.buffer,
                            image.image,
                            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                            &[region],
                        )
                    };
                }
                Command::Barrier(barrier) => {
                    let src_stages = convert_stages(barrier.src_stages);
                    let dst_stages = convert_stages(barrier.dst_stages);
                    let buffers = barrier
                        .buffers
                        .iter()
                        .map(|b| self.buffer_barrier(b, src_stages, dst_stages))
                        .collect::<Result<Vec<_>, _>>()?;
                    let images = barrier
                        .images
                        .iter()
                        .map(|b| self.image_barrier(b, src_stages, dst_stages))
                        .collect::<Result<Vec<_>, _>>()?;
                    let dependency = vk::DependencyInfo::default()
                        .buffer_memory_barriers(&buffers)
                        .image_memory_barriers(&images);
                    // SAFETY: synchronization2 is enabled on the device.
                    unsafe { device.cmd_pipeline_barrier2(cmd, &dependency) };
                }
            }
        }
        Ok(())
    }

    fn begin_rendering(
        &self,
        cmd: vk::CommandBuffer,
        color: Option<&crate::command::ColorAttachment>,
        depth: Option<&crate::command::DepthAttachment>,
        extent: Extent2d,
    ) -> Result<(), GraphicsError> {
        let color_attachments = match color {
            Some(attachment) => {
                let (_, view) = self.image(attachment.target)?;
                let (load_op, clear_value) = convert_load(attachment.clear);
                vec![vk::RenderingAttachmentInfo::default()
                    .image_view(view)
                    .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .load_op(load_op)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .clear_value(clear_value)]
            }
            None => Vec::new(),
        };
        let depth_attachment = match depth {
            Some(attachment) => {
                let view = self.resources.image(attachment.image.raw())?.view;
                let (load_op, clear_value) = convert_load(attachment.clear);
                Some(
                    vk::RenderingAttachmentInfo::default()
                        .image_view(view)
                        .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
                        .load_op(load_op)
                        .store_op(vk::AttachmentStoreOp::STORE)
                        .clear_value(clear_value),
                )
            }
            None => None,
        };

        let mut rendering_info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent: vk::Extent2D {
                    width: extent.width,
                    height: extent.height,
                },
            })
            .layer_count(1)
            .color_attachments(&color_attachments);
        if let Some(depth_attachment) = depth_attachment.as_ref() {
            rendering_info = rendering_info.depth_attachment(depth_attachment);
        }

        // SAFETY: attachments are in their attachment layouts per preceding barriers.
        unsafe { self.device.cmd_begin_rendering(cmd, &rendering_info) };
        Ok(())
    }

    fn buffer_barrier(
        &self,
        barrier: &BufferBarrier,
        src_stages: vk::PipelineStageFlags2,
        dst_stages: vk::PipelineStageFlags2,
    ) -> Result<vk::BufferMemoryBarrier2<'static>, GraphicsError> {
        let buffer = self.resources.buffer(barrier.buffer.raw())?;
        // Buffers are shared concurrently, so no ownership transfer is needed.
        Ok(vk::BufferMemoryBarrier2::default()
            .src_stage_mask(src_stages)
            .src_access_mask(convert_access(barrier.src_access))
            .dst_stage_mask(dst_stages)
            .dst_access_mask(convert_access(barrier.dst_access))
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(buffer.buffer)
            .offset(barrier.offset)
            .size(whole(barrier.size)))
    }

    fn image_barrier(
        &self,
        barrier: &ImageBarrier,
        src_stages: vk::PipelineStageFlags2,
        dst_stages: vk::PipelineStageFlags2,
    ) -> Result<vk::ImageMemoryBarrier2<'static>, GraphicsError> {
        let (image, _) = self.image(barrier.image)?;
        let mut src_stages = src_stages;
        let mut dst_stages = dst_stages;
        let mut src_access = convert_access(barrier.src_access);
        let mut dst_access = convert_access(barrier.dst_access);
        let mut src_family = vk::QUEUE_FAMILY_IGNORED;
        let mut dst_family = vk::QUEUE_FAMILY_IGNORED;

        if let Some(transfer) = barrier.ownership {
            let from = self.families.get(transfer.src);
            let to = self.families.get(transfer.dst);
            if from != to {
                src_family = from;
                dst_family = to;
                // The release half ignores the destination scope and the
                // acquire half ignores the source scope.
                if self.queue == transfer.src {
                    dst_stages = vk::PipelineStageFlags2::NONE;
                    dst_access = vk::AccessFlags2::NONE;
                } else if self.queue == transfer.dst {
                    src_stages = vk::PipelineStageFlags2::NONE;
                    src_access = vk::AccessFlags2::NONE;
                }
            }
        }

        Ok(vk::ImageMemoryBarrier2::default()
            .src_stage_mask(src_stages)
            .src_access_mask(src_access)
            .dst_stage_mask(dst_stages)
            .dst_access_mask(dst_access)
            .old_layout(convert_layout(barrier.old_layout))
            .new_layout(convert_layout(barrier.new_layout))
            .src_queue_family_index(src_family)
            .dst_queue_family_index(dst_family)
            .image(image)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(convert_aspect(barrier.aspect))
                    .base_mip_level(0)
                    .level_count(vk::REMAINING_MIP_LEVELS)
                    .base_array_layer(0)
                    .layer_count(1),
            ))
    }
}

fn whole(size: u64) -> u64 {
    if size == u64::MAX {
        vk::WHOLE_SIZE
    } else {
        size
    }
}

fn no_pipeline(action: &str) -> GraphicsError {
    GraphicsError::InvalidParameter(format!("cannot {} without a bound pipeline", action))
}
