//! The timeline store port.
//!
//! Object-safety note:
//! - The trait uses `async-trait` for async dyn-dispatch; backends are held as
//!   `Arc<dyn TimelineStore>` and selected once, at construction.
//!
//! Every backend shares the same append validation ([`prepare_append`]) and
//! the same cursor rule ([`suffix_after`]), so backends differ only in how a
//! partition is physically written and read.

use crate::addressing::build_partition_key;
use crate::context::RequestContext;
use crate::error::{TimelineError, TimelineResult};
use crate::event::StreamEvent;
use crate::ids::is_valid_tenant_id;
use async_trait::async_trait;
use tracing::warn;

#[async_trait]
pub trait TimelineStore: Send + Sync {
    /// Append `event` to `stream_id` under `context`.
    ///
    /// Fails on tenant/project/mode mismatch. Events with `persist = never`
    /// are accepted and not written.
    async fn append(
        &self,
        stream_id: &str,
        event: &StreamEvent,
        context: &RequestContext,
    ) -> TimelineResult<()>;

    /// Ordered history of `stream_id`, or the suffix strictly after
    /// `after_event_id`. An unknown cursor yields an empty list.
    async fn list_after(
        &self,
        stream_id: &str,
        tenant_id: &str,
        after_event_id: Option<&str>,
    ) -> TimelineResult<Vec<StreamEvent>>;

    fn backend_name(&self) -> &'static str;
}

/// What a backend should do with an append that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendPlan {
    Persist { partition_key: String },
    Skip,
}

pub fn prepare_append(
    stream_id: &str,
    event: &StreamEvent,
    context: &RequestContext,
) -> TimelineResult<AppendPlan> {
    if stream_id.trim().is_empty() {
        return Err(TimelineError::InvalidRouting(
            "stream_id is required".to_owned(),
        ));
    }
    event.validate()?;
    context.ensure_scope(&event.routing)?;

    if event.meta.is_ephemeral() {
        return Ok(AppendPlan::Skip);
    }

    Ok(AppendPlan::Persist {
        partition_key: build_partition_key(context.tenant_id.as_str(), stream_id),
    })
}

/// Partition key for a read, rejecting malformed tenant ids.
pub fn read_partition_key(stream_id: &str, tenant_id: &str) -> TimelineResult<String> {
    if !is_valid_tenant_id(tenant_id) {
        return Err(TimelineError::InvalidRouting(format!(
            "tenant_id {tenant_id:?} does not match t_[a-z0-9_-]+"
        )));
    }
    Ok(build_partition_key(tenant_id, stream_id))
}

/// Drop records not owned by `tenant_id`. Partitioning already prevents
/// this; a hit here means a corrupted partition and is logged.
pub fn retain_tenant(events: Vec<StreamEvent>, tenant_id: &str) -> Vec<StreamEvent> {
    let before = events.len();
    let kept: Vec<StreamEvent> = events
        .into_iter()
        .filter(|event| event.tenant_id() == tenant_id)
        .collect();
    if kept.len() != before {
        warn!(
            tenant_id,
            dropped = before - kept.len(),
            "foreign-tenant records found in partition"
        );
    }
    kept
}

/// Apply the cursor rule to an append-ordered history.
pub fn suffix_after(events: Vec<StreamEvent>, after_event_id: Option<&str>) -> Vec<StreamEvent> {
    let Some(cursor) = after_event_id else {
        return events;
    };
    match events
        .iter()
        .position(|event| event.event_id.as_str() == cursor)
    {
        Some(index) => events.into_iter().skip(index + 1).collect(),
        None => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::RoutingKeys;
    use crate::ids::EventId;
    use serde_json::json;

    fn event(id: &str) -> StreamEvent {
        let mut event = StreamEvent::new(
            "user_message",
            RoutingKeys::new("t_demo", "p1").with_thread("th1"),
            json!({}),
        );
        event.event_id = EventId::from_string(id);
        event
    }

    fn ids(events: &[StreamEvent]) -> Vec<&str> {
        events.iter().map(|e| e.event_id.as_str()).collect()
    }

    #[test]
    fn suffix_after_follows_cursor_rule() {
        let history = vec![event("1"), event("2"), event("3")];
        assert_eq!(ids(&suffix_after(history.clone(), None)), ["1", "2", "3"]);
        assert_eq!(ids(&suffix_after(history.clone(), Some("2"))), ["3"]);
        assert!(suffix_after(history.clone(), Some("3")).is_empty());
        assert!(suffix_after(history, Some("nonexistent")).is_empty());
    }

    #[test]
    fn prepare_append_skips_ephemeral() {
        let ctx = RequestContext::new("t_demo", "p1");
        let mut gesture = event("g");
        gesture.meta.persist = crate::event::PersistPolicy::Never;
        assert_eq!(
            prepare_append("t_demo:p1:th1", &gesture, &ctx).unwrap(),
            AppendPlan::Skip
        );
    }

    #[test]
    fn prepare_append_uses_context_tenant_for_partition() {
        let ctx = RequestContext::new("t_demo", "p1");
        let plan = prepare_append("t_demo:p1:th1", &event("1"), &ctx).unwrap();
        assert_eq!(
            plan,
            AppendPlan::Persist {
                partition_key: "t_demo:t_demo:p1:th1".to_owned()
            }
        );
    }

    #[test]
    fn prepare_append_rejects_foreign_scope_even_when_ephemeral() {
        let ctx = RequestContext::new("t_other", "p1");
        let mut gesture = event("g");
        gesture.meta.persist = crate::event::PersistPolicy::Never;
        assert!(prepare_append("t_demo:p1:th1", &gesture, &ctx).is_err());
    }

    #[test]
    fn read_partition_key_rejects_bad_tenant() {
        assert!(read_partition_key("s", "nope").is_err());
        assert_eq!(read_partition_key("s", "t_a").unwrap(), "t_a:s");
    }

    #[test]
    fn retain_tenant_drops_foreign_records() {
        let mut foreign = event("x");
        foreign.routing.tenant_id = "t_other".into();
        let kept = retain_tenant(vec![event("1"), foreign], "t_demo");
        assert_eq!(ids(&kept), ["1"]);
    }
}
