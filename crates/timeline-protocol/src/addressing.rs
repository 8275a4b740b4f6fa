//! Canonical stream addressing.
//!
//! A stream id is a pure function of routing keys. The tenant id always leads,
//! both in the stream id and in the partition key that storage is addressed by.

use crate::event::RoutingKeys;

/// Stream id of the cross-cutting feed written by the timeline service.
pub const UNIFIED_TIMELINE_STREAM: &str = "unified_timeline";

/// Suffix used when neither a thread nor a canvas is addressed.
pub const DEFAULT_STREAM_SUFFIX: &str = "default";

/// `{tenant_id}:{project_id}:{thread_id | canvas_id | "default"}`.
pub fn build_stream_id(routing: &RoutingKeys) -> String {
    let suffix = non_empty(routing.thread_id.as_ref().map(|thread| thread.as_str()))
        .or_else(|| non_empty(routing.canvas_id.as_deref()))
        .unwrap_or(DEFAULT_STREAM_SUFFIX);
    format!("{}:{}:{}", routing.tenant_id, routing.project_id, suffix)
}

/// `{tenant_id}:{stream_id}`: the only key storage is ever addressed by.
pub fn build_partition_key(tenant_id: &str, stream_id: &str) -> String {
    format!("{tenant_id}:{stream_id}")
}

/// Leading tenant component of a canonical stream id.
pub fn tenant_of_stream(stream_id: &str) -> Option<&str> {
    stream_id
        .split_once(':')
        .map(|(tenant, _)| tenant)
        .filter(|tenant| !tenant.is_empty())
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}
