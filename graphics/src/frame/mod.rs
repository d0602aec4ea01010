//! Frame orchestration.
//!
//! The renderer keeps [`FRAME_OVERLAP`] frame slots. Each frame uses one slot,
//! then moves on to the next; a slot is reused only after both of its fences
//! have signalled, so the CPU is never more than `FRAME_OVERLAP - 1` frames
//! ahead of the GPU.
//!
//! ```text
//! Slot 0: [Frame 0] ──► [Frame 2] ──► [Frame 4] ──►
//! Slot 1: [Frame 1] ──► [Frame 3] ──► [Frame 5] ──►
//! ```
//!
//! Within one frame three queues cooperate:
//!
//! ```text
//!  transfer ── upload ──(transition semaphore)───────────────┐
//!                                                             ▼
//!  compute  ── skinning ─ particles ─ sort ─(compute_finished)─► graphics
//!                                                                 │
//!  acquire ──(image_available)────────────────────────────────────┤
//!                                                                 ▼
//!                        shadow ─ scene ─ bloom ─ composite ─(render_finished)─► present
//! ```
//!
//! | Level | Primitive | Purpose |
//! |-------|-----------|---------|
//! | Stage → stage | Barriers | Buffer and image hazards inside a command list |
//! | Queue → queue | Semaphores | Compute, transfer and present ordering within a frame |
//! | Frame → frame | Fences | CPU reuse of a slot's buffers |
//!
//! [`FRAME_OVERLAP`]: crate::config::FRAME_OVERLAP

mod scheduler;
mod slot;

pub use scheduler::{FrameContext, FrameOutcome, FrameRecorder, FrameScheduler, FrameState};
pub use slot::{FrameBuffers, FrameSlot, PARTICLE_QUAD_VERTICES};
