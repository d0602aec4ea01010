//! Deferred destruction of GPU resources.
//!
//! The GPU runs up to [`FRAME_OVERLAP`] frames behind the CPU, so a resource
//! released during frame `F` may still be referenced by work submitted in
//! frames `F - 1` and `F`. Released resources are tagged with the frame
//! index at release time and destroyed once the frame index has advanced
//! `FRAME_OVERLAP` frames past the tag:
//!
//! ```text
//! release(r) at frame F  ──►  [ (r, F) ... ]  ──►  destroy when current >= F + N
//! ```

use std::collections::VecDeque;

use crate::backend::{
    BindingSetHandle, BufferHandle, CommandBufferHandle, FenceHandle, GpuBackend, ImageHandle,
    PipelineHandle, SamplerHandle, SemaphoreHandle,
};
use crate::config::FRAME_OVERLAP;

/// A backend object pending destruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuResource {
    Buffer(BufferHandle),
    Image(ImageHandle),
    Sampler(SamplerHandle),
    Pipeline(PipelineHandle),
    BindingSet(BindingSetHandle),
    CommandBuffer(CommandBufferHandle),
    Fence(FenceHandle),
    Semaphore(SemaphoreHandle),
}

impl GpuResource {
    /// Destroy the resource immediately.
    ///
    /// The caller must ensure the GPU is no longer using it.
    pub fn destroy(self, backend: &dyn GpuBackend) {
        match self {
            Self::Buffer(h) => backend.destroy_buffer(h),
            Self::Image(h) => backend.destroy_image(h),
            Self::Sampler(h) => backend.destroy_sampler(h),
            Self::Pipeline(h) => backend.destroy_pipeline(h),
            Self::BindingSet(h) => backend.destroy_binding_set(h),
            Self::CommandBuffer(h) => backend.destroy_command_buffer(h),
            Self::Fence(h) => backend.destroy_fence(h),
            Self::Semaphore(h) => backend.destroy_semaphore(h),
        }
    }
}

/// One released resource and the frame it was released in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionEntry<R> {
    pub resource: R,
    pub frame: u64,
}

/// FIFO of resources waiting for the GPU to finish with them.
#[derive(Debug)]
pub struct DeletionQueue<R> {
    entries: VecDeque<DeletionEntry<R>>,
}

impl<R> Default for DeletionQueue<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> DeletionQueue<R> {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    /// Queue `resource`, released during `frame`.
    pub fn push(&mut self, resource: R, frame: u64) {
        self.entries.push_back(DeletionEntry { resource, frame });
    }

    /// True once the GPU can no longer reference a resource released in
    /// `tag` when the CPU is about to record `current_frame`.
    pub fn is_expired(tag: u64, current_frame: u64) -> bool {
        tag + FRAME_OVERLAP as u64 <= current_frame
    }

    /// Destroy every expired entry in release order. Returns how many were
    /// destroyed.
    pub fn process(&mut self, current_frame: u64, mut destroy: impl FnMut(R)) -> usize {
        let mut destroyed = 0;
        let mut kept = VecDeque::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            if Self::is_expired(entry.frame, current_frame) {
                destroy(entry.resource);
                destroyed += 1;
            } else {
                kept.push_back(entry);
            }
        }
        self.entries = kept;
        destroyed
    }

    /// Destroy everything regardless of frame. Only valid once the device is
    /// idle.
    pub fn flush(&mut self, mut destroy: impl FnMut(R)) -> usize {
        let count = self.entries.len();
        for entry in self.entries.drain(..) {
            destroy(entry.resource);
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_destroyed_before_overlap() {
        let mut queue = DeletionQueue::new();
        queue.push("mesh", 5);

        let mut destroyed = Vec::new();
        for frame in 5..5 + FRAME_OVERLAP as u64 {
            assert_eq!(queue.process(frame, |r| destroyed.push(r)), 0);
        }
        assert!(destroyed.is_empty());

        assert_eq!(queue.process(5 + FRAME_OVERLAP as u64, |r| destroyed.push(r)), 1);
        assert_eq!(destroyed, vec!["mesh"]);
    }

    #[test]
    fn test_destroyed_exactly_once_in_fifo_order() {
        let mut queue = DeletionQueue::new();
        queue.push(1, 0);
        queue.push(2, 0);
        queue.push(3, 1);

        let mut destroyed = Vec::new();
        for frame in 0..10 {
            queue.process(frame, |r| destroyed.push(r));
        }
        assert_eq!(destroyed, vec![1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_out_of_order_tags_wait_individually() {
        let mut queue = DeletionQueue::new();
        queue.push('a', 4);
        queue.push('b', 1);

        let mut destroyed = Vec::new();
        queue.process(3, |r| destroyed.push(r));
        assert_eq!(destroyed, vec!['b']);
        assert_eq!(queue.pending_count(), 1);
    }

    #[test]
    fn test_flush_destroys_everything() {
        let mut queue = DeletionQueue::new();
        queue.push(10, 100);
        queue.push(11, 101);
        let mut destroyed = Vec::new();
        assert_eq!(queue.flush(|r| destroyed.push(r)), 2);
        assert_eq!(destroyed, vec![10, 11]);
        assert_eq!(queue.pending_count(), 0);
    }
}
