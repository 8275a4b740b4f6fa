//! Live delivery for the timeline.
//!
//! [`TimelineService`] is the single write path: it persists through a
//! [`timeline_protocol::TimelineStore`] and fans out to readers of the unified
//! feed. [`EventBus`] carries per-thread, per-run and per-canvas traffic,
//! gated by the [`IsolationRegistry`].

pub mod bus;
pub mod service;

pub use bus::{BusKey, BusScope, BusSubscription, EventBus, IsolationRegistry};
pub use service::{DEFAULT_SUBSCRIBER_CAPACITY, EventStream, TimelineService};
