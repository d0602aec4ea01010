//! Transfer-queue image uploads.
//!
//! Each upload copies pixels through a staging buffer on the transfer queue
//! and releases the image to the graphics queue. The graphics side of the
//! ownership transfer is recorded later by the frame scheduler from the
//! [`ImageTransition`] this module pushes.

use std::sync::Arc;
use std::time::Duration;

use crate::backend::{
    BufferHandle, CommandBufferHandle, FenceHandle, GpuBackend, QueueKind, SemaphoreHandle,
    Submission,
};
use crate::command::{Access, Barrier, CommandList, ImageBarrier, ImageLayout, PipelineStages};
use crate::error::{GraphicsError, GraphicsResult};
use crate::transition::{ImageTransition, TransitionSender};
use crate::types::{BufferDescriptor, BufferUsage, ImageDescriptor, ImageUsage};

use super::image::{GpuImage, ImageData};

#[derive(Debug)]
struct PendingUpload {
    staging: BufferHandle,
    command_buffer: CommandBufferHandle,
    fence: FenceHandle,
}

/// Uploads sampled images and hands their transitions to the render thread.
pub struct ImageUploader {
    backend: Arc<dyn GpuBackend>,
    sender: TransitionSender,
    send_timeout: Duration,
    pending: Vec<PendingUpload>,
}

impl ImageUploader {
    pub fn new(backend: Arc<dyn GpuBackend>, sender: TransitionSender, send_timeout: Duration) -> Self {
        Self {
            backend,
            sender,
            send_timeout,
            pending: Vec::new(),
        }
    }

    /// Create a sampled image and submit its upload. The image may be bound
    /// immediately; the graphics queue waits for the copy before sampling it.
    pub fn upload(&mut self, name: &str, data: &ImageData) -> GraphicsResult<GpuImage> {
        data.validate()?;
        self.reclaim()?;

        let backend = Arc::clone(&self.backend);
        let extent = data.extent();
        let image = backend.create_image(
            &ImageDescriptor::new_2d(
                extent.width,
                extent.height,
                data.format,
                ImageUsage::SAMPLED | ImageUsage::COPY_DST,
            )
            .with_mip_levels(data.mip_level_count())
            .with_label(name),
        )?;

        let staging = match backend.create_buffer(
            &BufferDescriptor::new(
                data.total_size(),
                BufferUsage::COPY_SRC | BufferUsage::HOST_WRITE,
            )
            .with_label(format!("{name} staging")),
        ) {
            Ok(buffer) => buffer,
            Err(e) => {
                backend.destroy_image(image);
                return Err(e);
            }
        };

        let submitted = self.write_levels(staging, data).and_then(|offsets| {
            let mut commands = CommandList::new();
            commands.barrier(
                Barrier::new(PipelineStages::TOP_OF_PIPE, PipelineStages::TRANSFER).image(
                    ImageBarrier::new(
                        image,
                        ImageLayout::Undefined,
                        ImageLayout::TransferDst,
                        Access::empty(),
                        Access::TRANSFER_WRITE,
                    ),
                ),
            );
            for ((level, level_extent, _), offset) in data.levels().zip(offsets) {
                commands.copy_buffer_to_image(staging, offset, image, level, level_extent);
            }
            commands.barrier(
                Barrier::new(PipelineStages::TRANSFER, PipelineStages::BOTTOM_OF_PIPE).image(
                    ImageBarrier::new(
                        image,
                        ImageLayout::TransferDst,
                        ImageLayout::ShaderReadOnly,
                        Access::TRANSFER_WRITE,
                        Access::empty(),
                    )
                    .with_ownership(QueueKind::Transfer, QueueKind::Graphics),
                ),
            );
            self.submit(&commands)
        });

        let (command_buffer, fence, semaphore) = match submitted {
            Ok(submitted) => submitted,
            Err(e) => {
                backend.destroy_buffer(staging);
                backend.destroy_image(image);
                return Err(e);
            }
        };
        let pending = PendingUpload {
            staging,
            command_buffer,
            fence,
        };

        let transition = ImageTransition::sampled(image, semaphore);
        if let Err(e) = self.sender.send_timeout(transition, self.send_timeout) {
            log::error!("Dropping upload of '{}': {}", name, e);
            // The copy may still be running; let it finish before tearing down.
            backend.wait_fence(pending.fence, self.send_timeout)?;
            self.release(pending);
            backend.destroy_semaphore(semaphore);
            backend.destroy_image(image);
            return Err(e);
        }

        log::debug!(
            "Uploaded image '{}' ({}x{}, {} mips)",
            name,
            extent.width,
            extent.height,
            data.mip_level_count()
        );
        self.pending.push(pending);
        Ok(GpuImage {
            image,
            extent,
            format: data.format,
        })
    }

    /// Pack every mip level into `staging` back to back, returning each
    /// level's offset.
    fn write_levels(&self, staging: BufferHandle, data: &ImageData) -> GraphicsResult<Vec<u64>> {
        let mut offsets = Vec::with_capacity(data.mip_level_count() as usize);
        let mut offset = 0;
        for (_, _, bytes) in data.levels() {
            self.backend.write_buffer(staging, offset, bytes)?;
            offsets.push(offset);
            offset += bytes.len() as u64;
        }
        Ok(offsets)
    }

    /// Submit `commands` on the transfer queue. Everything created here is
    /// destroyed again if a later step fails.
    fn submit(
        &self,
        commands: &CommandList,
    ) -> GraphicsResult<(CommandBufferHandle, FenceHandle, SemaphoreHandle)> {
        let backend = &self.backend;
        let command_buffer = backend.create_command_buffer(QueueKind::Transfer)?;
        let fence = match backend.create_fence(false) {
            Ok(fence) => fence,
            Err(e) => {
                backend.destroy_command_buffer(command_buffer);
                return Err(e);
            }
        };
        let semaphore = match backend.create_semaphore() {
            Ok(semaphore) => semaphore,
            Err(e) => {
                backend.destroy_fence(fence);
                backend.destroy_command_buffer(command_buffer);
                return Err(e);
            }
        };
        let result = backend.submit(&Submission {
            queue: QueueKind::Transfer,
            command_buffer,
            commands,
            waits: &[],
            signals: &[semaphore],
            fence: Some(fence),
        });
        if let Err(e) = result {
            backend.destroy_semaphore(semaphore);
            backend.destroy_fence(fence);
            backend.destroy_command_buffer(command_buffer);
            return Err(e);
        }
        Ok((command_buffer, fence, semaphore))
    }

    fn release(&self, upload: PendingUpload) {
        self.backend.destroy_buffer(upload.staging);
        self.backend.destroy_command_buffer(upload.command_buffer);
        self.backend.destroy_fence(upload.fence);
    }

    /// Free staging buffers whose copies have completed.
    pub fn reclaim(&mut self) -> GraphicsResult<usize> {
        let mut done = Vec::new();
        let mut remaining = Vec::with_capacity(self.pending.len());
        for upload in self.pending.drain(..) {
            if self.backend.is_fence_signaled(upload.fence)? {
                done.push(upload);
            } else {
                remaining.push(upload);
            }
        }
        self.pending = remaining;
        let count = done.len();
        for upload in done {
            self.release(upload);
        }
        Ok(count)
    }

    /// Wait for every outstanding copy and free its staging memory.
    pub fn finish(&mut self, timeout: Duration) -> GraphicsResult<()> {
        for upload in std::mem::take(&mut self.pending) {
            if !self.backend.wait_fence(upload.fence, timeout)? {
                return Err(GraphicsError::Internal(format!(
                    "upload fence {:?} did not signal within {:?}",
                    upload.fence, timeout
                )));
            }
            self.release(upload);
        }
        Ok(())
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    pub fn is_queue_full(&self) -> bool {
        self.sender.is_full()
    }

    pub fn sender(&self) -> &TransitionSender {
        &self.sender
    }
}

impl std::fmt::Debug for ImageUploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageUploader")
            .field("backend", &self.backend.name())
            .field("in_flight", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyBackend;
    use crate::command::Command;
    use crate::transition::transition_channel;
    use crate::types::{Extent2d, ImageFormat};

    fn uploader() -> (Arc<DummyBackend>, ImageUploader, crate::transition::TransitionReceiver) {
        let backend = Arc::new(DummyBackend::new());
        let (sender, receiver) = transition_channel();
        let uploader = ImageUploader::new(backend.clone(), sender, Duration::from_millis(10));
        (backend, uploader, receiver)
    }

    #[test]
    fn test_upload_submits_on_transfer_queue() {
        let (backend, mut uploader, mut receiver) = uploader();
        let data = ImageData::new(2, 2, ImageFormat::Rgba8Srgb, vec![255; 16]).unwrap();
        let image = uploader.upload("albedo", &data).unwrap();

        let submissions = backend.submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].queue, QueueKind::Transfer);
        assert!(submissions[0]
            .commands
            .commands()
            .iter()
            .any(|c| matches!(c, Command::CopyBufferToImage { image: i, .. } if *i == image.image)));

        let transitions = receiver.drain(8);
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].image, image.image);
        assert_eq!(submissions[0].signals, vec![transitions[0].semaphore]);
    }

    #[test]
    fn test_upload_copies_every_mip_level() {
        let (backend, mut uploader, _receiver) = uploader();
        let data = ImageData::new(4, 4, ImageFormat::Rgba8Unorm, vec![7; 64])
            .unwrap()
            .with_generated_mips()
            .unwrap();
        let image = uploader.upload("mipped", &data).unwrap();

        let descriptor = backend.image_descriptor(image.image).unwrap();
        assert_eq!(descriptor.mip_level_count, 3);

        let copies: Vec<_> = backend.submissions()[0]
            .commands
            .commands()
            .iter()
            .filter_map(|c| match c {
                Command::CopyBufferToImage {
                    buffer_offset,
                    mip_level,
                    extent,
                    ..
                } => Some((*buffer_offset, *mip_level, *extent)),
                _ => None,
            })
            .collect();
        assert_eq!(
            copies,
            vec![
                (0, 0, Extent2d::new(4, 4)),
                (64, 1, Extent2d::new(2, 2)),
                (80, 2, Extent2d::new(1, 1)),
            ]
        );
    }

    #[test]
    fn test_staging_reclaimed_after_fence() {
        let (backend, mut uploader, _receiver) = uploader();
        let data = ImageData::solid([1, 2, 3, 4], ImageFormat::Rgba8Unorm);
        uploader.upload("a", &data).unwrap();
        assert_eq!(uploader.in_flight(), 1);

        backend.wait_idle().unwrap();
        assert_eq!(uploader.reclaim().unwrap(), 1);
        assert_eq!(uploader.in_flight(), 0);
        assert_eq!(backend.destroyed_buffers().len(), 1);
    }

    #[test]
    fn test_failed_submit_setup_frees_everything() {
        let (backend, mut uploader, mut receiver) = uploader();
        backend.fail_next_semaphore();
        let data = ImageData::solid([1, 2, 3, 4], ImageFormat::Rgba8Unorm);
        assert_eq!(uploader.upload("a", &data).unwrap_err(), GraphicsError::OutOfMemory);

        assert!(backend.submissions().is_empty());
        assert!(receiver.drain(8).is_empty());
        assert_eq!(backend.live_image_count(), 0);
        assert_eq!(backend.live_buffer_count(), 0);
        assert_eq!(backend.live_fence_count(), 0);
        assert_eq!(backend.live_command_buffer_count(), 0);
        assert_eq!(uploader.in_flight(), 0);
    }

    #[test]
    fn test_invalid_pixels_rejected_before_gpu_work() {
        let (backend, mut uploader, _receiver) = uploader();
        let data = ImageData {
            width: 4,
            height: 4,
            format: ImageFormat::Rgba8Unorm,
            pixels: vec![0; 3],
            mips: Vec::new(),
        };
        assert!(uploader.upload("bad", &data).is_err());
        assert!(backend.submissions().is_empty());
        assert_eq!(backend.live_image_count(), 0);
    }
}
