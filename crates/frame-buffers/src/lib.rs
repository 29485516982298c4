//! # Frame Buffers
//!
//! Frame handoff primitives for the live detection preview pipeline:
//!
//! - [`FrameSlot`]: single-slot queue with drop-oldest semantics, used between
//!   the capture thread and the inference thread. The producer never blocks.
//! - [`PreviewBuffer`]: double buffer used between inference and rendering.
//!   The producer writes one slot while the consumer reads the other.
//!
//! Both buffers only guarantee "most recent write wins". Intermediate frames
//! may be dropped under load; a missing frame is reported as `None`, which
//! callers must treat as steady state rather than an error.

mod frame;
mod preview;
mod slot;

pub use frame::Frame;
pub use preview::PreviewBuffer;
pub use slot::FrameSlot;
