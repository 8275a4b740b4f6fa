//! # timeline-protocol — Canonical Realtime Timeline Protocol
//!
//! This crate defines the shared envelope, routing keys, addressing rules and
//! storage port that every timeline crate (store backends, service, transports)
//! depends on.
//!
//! It is intentionally dependency-light (no tokio, axum, or HTTP clients) so it
//! can be used as a pure contract crate.
//!
//! ## Module Overview
//!
//! - [`ids`] — Typed ID wrappers (EventId, TenantId, ThreadId, ConnectionId, etc.)
//! - [`event`] — StreamEvent envelope, RoutingKeys, EventMeta
//! - [`media`] — MediaSidecar and AtomMetadata (reference-only media)
//! - [`addressing`] — Canonical stream ids and tenant-qualified partition keys
//! - [`context`] — RequestContext and ContextPatch (scope checks and merging)
//! - [`ports`] — The TimelineStore port and the shared append/cursor rules
//! - [`error`] — TimelineError, TimelineResult

pub mod addressing;
pub mod context;
pub mod error;
pub mod event;
pub mod ids;
pub mod media;
pub mod ports;

// Re-export the most commonly used types at the crate root.
pub use addressing::{
    DEFAULT_STREAM_SUFFIX, UNIFIED_TIMELINE_STREAM, build_partition_key, build_stream_id,
    tenant_of_stream,
};
pub use context::{ContextPatch, RequestContext};
pub use error::{TimelineError, TimelineResult};
pub use event::{
    ActorType, EventIds, EventMeta, PersistPolicy, Priority, RoutingKeys, SCHEMA_VERSION,
    StorageClass, StreamEvent,
};
pub use ids::{ConnectionId, EventId, ProjectId, RunId, TenantId, ThreadId};
pub use media::{AtomMetadata, MediaSidecar, MediaSidecarFields};
pub use ports::{
    AppendPlan, TimelineStore, prepare_append, read_partition_key, retain_tenant, suffix_after,
};
