//! The canonical stream event envelope.
//!
//! Every event that crosses the timeline, durable or ephemeral, is a
//! [`StreamEvent`]. Producers construct it once and hand it to the timeline
//! service; afterwards it is immutable and only superseded by later events in
//! the same stream.

use crate::addressing::build_stream_id;
use crate::error::{TimelineError, TimelineResult};
use crate::ids::{EventId, ProjectId, RunId, TenantId, ThreadId, is_valid_tenant_id};
use crate::media::{AtomMetadata, MediaSidecar};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current envelope schema version.
pub const SCHEMA_VERSION: u32 = 1;

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

/// Who produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    Human,
    Agent,
    System,
}

/// Routing keys: the only input to stream addressing and scope checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingKeys {
    pub tenant_id: TenantId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    pub project_id: ProjectId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub surface_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canvas_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub panel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<ThreadId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_type: Option<ActorType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

impl RoutingKeys {
    pub fn new(tenant_id: impl Into<TenantId>, project_id: impl Into<ProjectId>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            mode: None,
            env: None,
            workspace_id: None,
            project_id: project_id.into(),
            app_id: None,
            surface_id: None,
            canvas_id: None,
            projection_id: None,
            panel_id: None,
            thread_id: None,
            actor_id: None,
            actor_type: None,
            session_id: None,
            device_id: None,
        }
    }

    pub fn with_thread(mut self, thread_id: impl Into<ThreadId>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn with_canvas(mut self, canvas_id: impl Into<String>) -> Self {
        self.canvas_id = Some(canvas_id.into());
        self
    }

    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = Some(mode.into());
        self
    }

    pub fn with_actor(mut self, actor_id: impl Into<String>, actor_type: ActorType) -> Self {
        self.actor_id = Some(actor_id.into());
        self.actor_type = Some(actor_type);
        self
    }

    /// Reject malformed tenant ids and empty project ids.
    pub fn validate(&self) -> TimelineResult<()> {
        if !is_valid_tenant_id(self.tenant_id.as_str()) {
            return Err(TimelineError::InvalidRouting(format!(
                "tenant_id {:?} does not match t_[a-z0-9_-]+",
                self.tenant_id.as_str()
            )));
        }
        if self.project_id.as_str().trim().is_empty() {
            return Err(TimelineError::InvalidRouting(
                "project_id is required".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Provenance identifiers. Never used for addressing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventIds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Durable conversational state.
    Truth,
    /// Ephemeral pointer/presence traffic.
    Gesture,
    #[default]
    Info,
    Critical,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistPolicy {
    #[default]
    Always,
    Sampled,
    /// Live fan-out only; must never reach a timeline store.
    Never,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageClass {
    #[default]
    Stream,
    Log,
}

/// Delivery and persistence metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMeta {
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub persist: PersistPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(default)]
    pub storage_class: StorageClass,
    /// Cursor hint for resumption.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event_id: Option<EventId>,
}

impl EventMeta {
    pub fn truth() -> Self {
        Self {
            priority: Priority::Truth,
            persist: PersistPolicy::Always,
            ..Self::default()
        }
    }

    pub fn gesture() -> Self {
        Self {
            priority: Priority::Gesture,
            persist: PersistPolicy::Never,
            ..Self::default()
        }
    }

    pub fn is_ephemeral(&self) -> bool {
        self.persist == PersistPolicy::Never
    }
}

/// The canonical unit of the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    #[serde(default)]
    pub event_id: EventId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    #[serde(default)]
    pub ids: EventIds,
    pub routing: RoutingKeys,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub atom_metadata: Option<AtomMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_payload: Option<MediaSidecar>,
    #[serde(default)]
    pub meta: EventMeta,
}

impl StreamEvent {
    /// Create a new event with a fresh id, the current timestamp and default meta.
    pub fn new(event_type: impl Into<String>, routing: RoutingKeys, data: Value) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            event_type: event_type.into(),
            timestamp: Utc::now(),
            sequence: None,
            event_id: EventId::new_uuid(),
            trace_id: None,
            span_id: None,
            ids: EventIds::default(),
            routing,
            data,
            atom_metadata: None,
            media_payload: None,
            meta: EventMeta::default(),
        }
    }

    /// A durable event (`priority=truth`, `persist=always`).
    pub fn truth(event_type: impl Into<String>, routing: RoutingKeys, data: Value) -> Self {
        Self::new(event_type, routing, data).with_meta(EventMeta::truth())
    }

    /// An ephemeral event (`priority=gesture`, `persist=never`).
    pub fn gesture(event_type: impl Into<String>, routing: RoutingKeys, data: Value) -> Self {
        Self::new(event_type, routing, data).with_meta(EventMeta::gesture())
    }

    pub fn with_meta(mut self, meta: EventMeta) -> Self {
        self.meta = meta;
        self
    }

    pub fn with_ids(mut self, ids: EventIds) -> Self {
        self.ids = ids;
        self
    }

    pub fn with_media(mut self, media: MediaSidecar) -> Self {
        self.media_payload = Some(media);
        self
    }

    pub fn with_atom(mut self, atom: AtomMetadata) -> Self {
        self.atom_metadata = Some(atom);
        self
    }

    pub fn with_trace(mut self, trace_id: impl Into<String>, span_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self.span_id = Some(span_id.into());
        self
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    /// Coerce loose JSON into the canonical envelope.
    ///
    /// Missing `event_id`, `timestamp`, `schema_version` and `meta` are
    /// defaulted; `type` and `routing` are required. Inline media is rejected.
    pub fn from_value(value: Value) -> TimelineResult<Self> {
        let event: Self = serde_json::from_value(value).map_err(|error| {
            let message = error.to_string();
            if message.contains("unsafe media") {
                TimelineError::UnsafePayload(message)
            } else {
                TimelineError::Serialization(message)
            }
        })?;
        event.validate()?;
        Ok(event)
    }

    pub fn validate(&self) -> TimelineResult<()> {
        self.routing.validate()?;
        if self.event_type.trim().is_empty() {
            return Err(TimelineError::InvalidRouting(
                "event type is required".to_owned(),
            ));
        }
        Ok(())
    }

    /// Canonical stream address derived from the routing keys only.
    pub fn stream_id(&self) -> String {
        build_stream_id(&self.routing)
    }

    pub fn tenant_id(&self) -> &str {
        self.routing.tenant_id.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn routing() -> RoutingKeys {
        RoutingKeys::new("t_demo", "p1").with_thread("th1")
    }

    #[test]
    fn new_event_defaults() {
        let event = StreamEvent::new("user_message", routing(), json!({"text": "hi"}));
        assert_eq!(event.schema_version, 1);
        assert_eq!(event.meta.priority, Priority::Info);
        assert_eq!(event.meta.persist, PersistPolicy::Always);
        assert_eq!(event.meta.storage_class, StorageClass::Stream);
        assert_eq!(event.stream_id(), "t_demo:p1:th1");
    }

    #[test]
    fn event_ids_are_unique_per_construction() {
        let a = StreamEvent::new("x", routing(), Value::Null);
        let b = StreamEvent::new("x", routing(), Value::Null);
        assert_ne!(a.event_id, b.event_id);
    }

    #[test]
    fn gesture_events_are_ephemeral() {
        let event = StreamEvent::gesture("presence_state", routing(), json!({}));
        assert!(event.meta.is_ephemeral());
        assert_eq!(event.meta.priority, Priority::Gesture);
        assert!(!StreamEvent::truth("user_message", routing(), json!({})).meta.is_ephemeral());
    }

    #[test]
    fn wire_shape_uses_type_tag() {
        let event = StreamEvent::new("token_patch", routing(), json!({"delta": "a"}));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "token_patch");
        assert_eq!(value["routing"]["tenant_id"], "t_demo");
        assert_eq!(value["meta"]["persist"], "always");
        assert!(value.get("media_payload").is_none());
    }

    #[test]
    fn from_value_fills_defaults() {
        let event = StreamEvent::from_value(json!({
            "type": "user_message",
            "routing": { "tenant_id": "t_demo", "project_id": "p1", "thread_id": "th1" },
            "data": { "text": "hello" }
        }))
        .unwrap();
        assert_eq!(event.schema_version, 1);
        assert!(!event.event_id.as_str().is_empty());
        assert_eq!(event.meta, EventMeta::default());
        assert_eq!(event.data["text"], "hello");
    }

    #[test]
    fn from_value_requires_routing() {
        let err = StreamEvent::from_value(json!({ "type": "user_message" })).unwrap_err();
        assert_eq!(err.code(), "serialization_error");
    }

    #[test]
    fn from_value_rejects_bad_tenant() {
        let err = StreamEvent::from_value(json!({
            "type": "user_message",
            "routing": { "tenant_id": "demo", "project_id": "p1" }
        }))
        .unwrap_err();
        assert_eq!(err.code(), "invalid_routing");
    }

    #[test]
    fn from_value_rejects_inline_media() {
        let err = StreamEvent::from_value(json!({
            "type": "atom_added",
            "routing": { "tenant_id": "t_demo", "project_id": "p1" },
            "media_payload": { "uri": "data:image/png;base64,AAAA" }
        }))
        .unwrap_err();
        assert_eq!(err.code(), "unsafe_payload");
    }

    #[test]
    fn routing_requires_project() {
        let routing = RoutingKeys::new("t_demo", " ");
        assert!(routing.validate().is_err());
    }
}
