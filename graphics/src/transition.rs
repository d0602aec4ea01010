//! Image ownership transitions handed from the upload path to the render
//! thread.
//!
//! The uploader releases a freshly copied image from the transfer queue and
//! pushes an [`ImageTransition`] describing the matching acquire. The frame
//! scheduler drains the queue at the start of graphics recording, records the
//! acquire barriers and makes the graphics submission wait on each
//! transition's semaphore. Transitions are consumed in FIFO order across
//! frames; a frame that hits its cap leaves the rest for the next one.
//!
//! ```text
//!  loader thread                          render thread
//!  ImageUploader ── TransitionSender ──►  [ring queue] ──► TransitionReceiver
//!        ▲                                                    │
//!        └────────── drained (Condvar) ◄──────────────────────┘
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ember_core::{Consumer, Producer, RingQueue};
use parking_lot::{Condvar, Mutex};

use crate::backend::{ImageHandle, QueueKind, SemaphoreHandle, SemaphoreWait};
use crate::command::{Access, Barrier, ImageAspect, ImageBarrier, ImageLayout, PipelineStages};
use crate::error::{GraphicsError, GraphicsResult};

/// Slots in the transition ring; it holds one fewer transition than this.
pub const TRANSITION_QUEUE_SLOTS: usize = 512;

/// The acquire half of a queue ownership transfer, plus the semaphore the
/// transfer submission signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageTransition {
    pub image: ImageHandle,
    pub old_layout: ImageLayout,
    pub new_layout: ImageLayout,
    pub src_stages: PipelineStages,
    pub dst_stages: PipelineStages,
    pub src_access: Access,
    pub dst_access: Access,
    pub src_queue: QueueKind,
    pub dst_queue: QueueKind,
    pub aspect: ImageAspect,
    pub semaphore: SemaphoreHandle,
}

impl ImageTransition {
    /// A sampled color image moving from the transfer queue to the graphics
    /// queue, readable from fragment shaders once acquired.
    pub fn sampled(image: ImageHandle, semaphore: SemaphoreHandle) -> Self {
        Self {
            image,
            old_layout: ImageLayout::TransferDst,
            new_layout: ImageLayout::ShaderReadOnly,
            src_stages: PipelineStages::TOP_OF_PIPE,
            dst_stages: PipelineStages::FRAGMENT_SHADER,
            src_access: Access::empty(),
            dst_access: Access::SHADER_READ,
            src_queue: QueueKind::Transfer,
            dst_queue: QueueKind::Graphics,
            aspect: ImageAspect::Color,
            semaphore,
        }
    }

    /// Barrier recorded on the destination queue.
    pub fn acquire_barrier(&self) -> Barrier {
        let mut barrier = ImageBarrier::new(
            self.image,
            self.old_layout,
            self.new_layout,
            self.src_access,
            self.dst_access,
        )
        .with_ownership(self.src_queue, self.dst_queue);
        barrier.aspect = self.aspect;
        Barrier::new(self.src_stages, self.dst_stages).image(barrier)
    }

    /// Semaphore wait for the submission that records the acquire.
    pub fn wait(&self) -> SemaphoreWait {
        SemaphoreWait {
            semaphore: self.semaphore,
            stages: self.dst_stages,
        }
    }
}

type TransitionRing = RingQueue<ImageTransition, TRANSITION_QUEUE_SLOTS>;

#[derive(Default)]
struct DrainSignal {
    gate: Mutex<()>,
    drained: Condvar,
}

/// Create the single sender/receiver pair.
pub fn transition_channel() -> (TransitionSender, TransitionReceiver) {
    let (producer, consumer) = TransitionRing::new().split();
    let signal = Arc::new(DrainSignal::default());
    (
        TransitionSender {
            producer,
            signal: Arc::clone(&signal),
        },
        TransitionReceiver {
            consumer,
            returned: VecDeque::new(),
            signal,
        },
    )
}

/// Producer side, owned by the upload path.
pub struct TransitionSender {
    producer: Producer<ImageTransition, TRANSITION_QUEUE_SLOTS>,
    signal: Arc<DrainSignal>,
}

impl TransitionSender {
    /// Push without blocking. Returns the transition back if the queue is full.
    pub fn send(&mut self, transition: ImageTransition) -> Result<(), ImageTransition> {
        self.producer.push(transition)
    }

    /// Push, blocking while the queue is full until the receiver drains it or
    /// `timeout` elapses.
    pub fn send_timeout(
        &mut self,
        transition: ImageTransition,
        timeout: Duration,
    ) -> GraphicsResult<()> {
        let deadline = Instant::now() + timeout;
        let mut pending = transition;
        loop {
            match self.producer.push(pending) {
                Ok(()) => return Ok(()),
                Err(back) => pending = back,
            }

            let mut gate = self.signal.gate.lock();
            if !self.producer.is_full() {
                continue;
            }
            if self.signal.drained.wait_until(&mut gate, deadline).timed_out()
                && self.producer.is_full()
            {
                return Err(GraphicsError::Internal(format!(
                    "transition queue stayed full for {:?}",
                    timeout
                )));
            }
        }
    }

    /// Block until the receiver has consumed everything sent so far.
    /// Returns `false` if `timeout` elapsed first.
    pub fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut gate = self.signal.gate.lock();
        while !self.producer.is_empty() {
            if self.signal.drained.wait_until(&mut gate, deadline).timed_out() {
                return self.producer.is_empty();
            }
        }
        true
    }

    pub fn is_full(&self) -> bool {
        self.producer.is_full()
    }

    pub fn pending(&self) -> usize {
        self.producer.len()
    }
}

impl std::fmt::Debug for TransitionSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransitionSender")
            .field("pending", &self.pending())
            .finish()
    }
}

/// Consumer side, owned by the frame scheduler.
pub struct TransitionReceiver {
    consumer: Consumer<ImageTransition, TRANSITION_QUEUE_SLOTS>,
    /// Drained transitions handed back by a frame that never submitted them.
    /// They precede everything still in the ring.
    returned: VecDeque<ImageTransition>,
    signal: Arc<DrainSignal>,
}

impl TransitionReceiver {
    /// Pop up to `max` transitions in FIFO order.
    pub fn drain(&mut self, max: usize) -> Vec<ImageTransition> {
        let mut drained = Vec::new();
        while drained.len() < max {
            match self.returned.pop_front() {
                Some(transition) => drained.push(transition),
                None => break,
            }
        }
        while drained.len() < max {
            match self.consumer.pop() {
                Some(transition) => drained.push(transition),
                None => break,
            }
        }
        if !drained.is_empty() {
            let _gate = self.signal.gate.lock();
            self.signal.drained.notify_all();
        }
        drained
    }

    /// Put transitions from an unsubmitted frame back at the head of the
    /// queue, keeping their order.
    pub fn requeue_front(&mut self, transitions: Vec<ImageTransition>) {
        for transition in transitions.into_iter().rev() {
            self.returned.push_front(transition);
        }
    }

    pub fn pending(&self) -> usize {
        self.returned.len() + self.consumer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.returned.is_empty() && self.consumer.is_empty()
    }
}

impl std::fmt::Debug for TransitionReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransitionReceiver")
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn transition(n: u64) -> ImageTransition {
        ImageTransition::sampled(ImageHandle::from_raw(n), SemaphoreHandle::from_raw(n))
    }

    #[test]
    fn test_drain_respects_cap_and_order() {
        let (mut sender, mut receiver) = transition_channel();
        for n in 1..=5 {
            sender.send(transition(n)).unwrap();
        }

        let first: Vec<u64> = receiver.drain(3).iter().map(|t| t.image.raw()).collect();
        assert_eq!(first, vec![1, 2, 3]);
        let rest: Vec<u64> = receiver.drain(3).iter().map(|t| t.image.raw()).collect();
        assert_eq!(rest, vec![4, 5]);
        assert!(receiver.is_empty());
    }

    #[test]
    fn test_requeued_transitions_come_first() {
        let (mut sender, mut receiver) = transition_channel();
        for n in 1..=4 {
            sender.send(transition(n)).unwrap();
        }

        let taken = receiver.drain(2);
        receiver.requeue_front(taken);
        assert_eq!(receiver.pending(), 4);

        let order: Vec<u64> = receiver.drain(3).iter().map(|t| t.image.raw()).collect();
        assert_eq!(order, vec![1, 2, 3]);
        let order: Vec<u64> = receiver.drain(3).iter().map(|t| t.image.raw()).collect();
        assert_eq!(order, vec![4]);
        assert!(receiver.is_empty());
    }

    #[test]
    fn test_full_queue_returns_transition() {
        let (mut sender, _receiver) = transition_channel();
        for n in 0..(TRANSITION_QUEUE_SLOTS as u64 - 1) {
            sender.send(transition(n + 1)).unwrap();
        }
        assert!(sender.is_full());
        let back = sender.send(transition(9999)).unwrap_err();
        assert_eq!(back.image.raw(), 9999);
        assert!(sender.send_timeout(transition(1), Duration::from_millis(10)).is_err());
    }

    #[test]
    fn test_wait_drained_wakes_on_drain() {
        let (mut sender, mut receiver) = transition_channel();
        sender.send(transition(1)).unwrap();

        let consumer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            receiver.drain(16).len()
        });

        assert!(sender.wait_drained(Duration::from_secs(5)));
        assert_eq!(consumer.join().unwrap(), 1);
    }

    #[test]
    fn test_acquire_barrier_transfers_ownership() {
        let t = transition(7);
        let barrier = t.acquire_barrier();
        assert_eq!(barrier.dst_stages, PipelineStages::FRAGMENT_SHADER);
        let image = &barrier.images[0];
        assert_eq!(image.new_layout, ImageLayout::ShaderReadOnly);
        let ownership = image.ownership.unwrap();
        assert_eq!(ownership.src, QueueKind::Transfer);
        assert_eq!(ownership.dst, QueueKind::Graphics);
        assert_eq!(t.wait().stages, PipelineStages::FRAGMENT_SHADER);
    }
}
