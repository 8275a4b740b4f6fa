//! Durable "truth" channel over Server-Sent Events.
//!
//! Identity comes from a `ticket` query parameter or an `Authorization:
//! Bearer` header, never from loose query fields. The stream replays history
//! after `Last-Event-ID` (header) or `last_event_id` (query), then tails live
//! events of the connection's canonical stream.

use std::convert::Infallible;
use std::time::Duration;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::future::ready;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use timeline_protocol::{ActorType, RequestContext, StreamEvent, build_stream_id};
use tracing::info;

use crate::AppState;
use crate::error::{ApiError, ApiResult};

const LAST_EVENT_ID: &str = "last-event-id";

#[derive(Debug, Deserialize, Default)]
pub struct StreamQuery {
    ticket: Option<String>,
    last_event_id: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct IdentityQuery {
    ticket: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PostMessageRequest {
    text: String,
    #[serde(default)]
    sender: Option<Sender>,
}

#[derive(Debug, Deserialize)]
struct Sender {
    id: String,
}

#[derive(Debug, Serialize)]
pub struct PostMessageResponse {
    posted: Vec<StreamEvent>,
}

/// Ticket first, then bearer token; anything else is unauthenticated.
fn resolve_identity(
    state: &AppState,
    headers: &HeaderMap,
    ticket: Option<&str>,
) -> ApiResult<RequestContext> {
    let patch = if let Some(ticket) = ticket.filter(|ticket| !ticket.is_empty()) {
        state.resolver.resolve_ticket(ticket)?
    } else if let Some(token) = bearer_token(headers) {
        state.resolver.resolve_token(token)?
    } else {
        return Err(ApiError::unauthorized(
            "a ticket or bearer token is required",
        ));
    };
    Ok(patch.into_context(None)?)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Header wins over the query parameter.
fn resume_cursor(headers: &HeaderMap, query: Option<String>) -> Option<String> {
    headers
        .get(LAST_EVENT_ID)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
        .or(query)
        .filter(|cursor| !cursor.trim().is_empty())
}

fn as_sse_event(event: &StreamEvent) -> Event {
    let payload = serde_json::to_string(event)
        .unwrap_or_else(|error| json!({ "error": error.to_string() }).to_string());
    Event::default()
        .id(event.event_id.as_str())
        .event(event.event_type.as_str())
        .data(payload.replace('\n', ""))
}

pub async fn stream_thread(
    Path(thread_id): Path<String>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let context = resolve_identity(&state, &headers, query.ticket.as_deref())?;
    let stream_id = build_stream_id(&context.routing_for_thread(thread_id));
    let cursor = resume_cursor(&headers, query.last_event_id);
    info!(
        tenant_id = %context.tenant_id,
        stream_id = %stream_id,
        cursor = ?cursor,
        "sse stream opened"
    );

    let tenant_id = context.tenant_id.clone();
    let events = state
        .kernel
        .stream_events(&context, cursor)
        .await?
        .filter(move |event| {
            ready(event.stream_id() == stream_id && event.routing.tenant_id == tenant_id)
        })
        .map(|event| Ok(as_sse_event(&event)));

    Ok(Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    ))
}

pub async fn post_message(
    Path(thread_id): Path<String>,
    Query(query): Query<IdentityQuery>,
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(request): Json<PostMessageRequest>,
) -> ApiResult<Json<PostMessageResponse>> {
    let context = resolve_identity(&state, &headers, query.ticket.as_deref())?;
    let mut routing = context.routing_for_thread(thread_id);
    if let Some(sender) = request.sender {
        routing = routing.with_actor(sender.id, ActorType::Human);
    }

    let event = StreamEvent::truth("user_message", routing, json!({ "text": request.text }));
    let posted = state.kernel.append_event(event, &context).await?;
    Ok(Json(PostMessageResponse {
        posted: vec![posted],
    }))
}
