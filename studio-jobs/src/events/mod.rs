//! Lightweight in-process event bus.
//!
//! Job runners publish lifecycle events; the registry and UI subscribe.

mod bus;
mod job_events;

pub use bus::{EventBus, JobEventHandler, SubscriptionId};
pub use job_events::{JobEvent, JobEventKind, JobEventPayload};
