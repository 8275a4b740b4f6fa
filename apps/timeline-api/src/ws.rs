//! Ephemeral "gesture" channel over WebSocket.
//!
//! A connection starts `Connected` and must send `hello` first. Once `Ready`
//! it receives a replay of its stream plus live bus traffic for its thread,
//! and may send `ping`, `gesture` and `presence_ping`. Durable writes go
//! through SSE.

use std::collections::HashSet;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use serde::Deserialize;
use serde_json::{Value, json};
use timeline_events::{BusKey, BusSubscription, IsolationRegistry};
use timeline_protocol::{
    ContextPatch, EventId, RequestContext, RoutingKeys, StreamEvent, TimelineError,
    TimelineResult, build_stream_id,
};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::AppState;

/// Close code sent when the handshake or identity is rejected.
pub const POLICY_CLOSE_CODE: u16 = 4003;

#[derive(Debug, Deserialize, Default)]
pub struct WsQuery {
    ticket: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HelloFrame {
    #[serde(default)]
    context: ContextPatch,
    #[serde(default)]
    last_event_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PayloadFrame {
    #[serde(default)]
    data: Value,
}

#[derive(Debug)]
enum Inbound {
    Hello(HelloFrame),
    Ping,
    Gesture(Value),
    PresencePing(Value),
    Other(String),
}

fn parse_inbound(text: &str) -> TimelineResult<Inbound> {
    let value: Value = serde_json::from_str(text)
        .map_err(|error| TimelineError::protocol("invalid_frame", error.to_string()))?;
    let frame_type = value
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    let payload = |value: Value| -> TimelineResult<Value> {
        let frame: PayloadFrame = serde_json::from_value(value)
            .map_err(|error| TimelineError::protocol("invalid_frame", error.to_string()))?;
        Ok(frame.data)
    };

    Ok(match frame_type.as_str() {
        "hello" => Inbound::Hello(
            serde_json::from_value(value)
                .map_err(|error| TimelineError::protocol("invalid_hello", error.to_string()))?,
        ),
        "ping" => Inbound::Ping,
        "gesture" => Inbound::Gesture(payload(value)?),
        "presence_ping" => Inbound::PresencePing(payload(value)?),
        _ => Inbound::Other(frame_type),
    })
}

/// State reached after a valid `hello`.
#[derive(Debug)]
struct Session {
    context: RequestContext,
    last_event_id: Option<String>,
}

/// The ticket is signed; a hello may repeat its scope but never change it.
fn ensure_ticket_scope(
    field: &'static str,
    signed: Option<&str>,
    claimed: Option<&str>,
) -> TimelineResult<()> {
    match (signed, claimed) {
        (Some(signed), Some(claimed)) if signed != claimed => {
            Err(TimelineError::scope(field, signed, claimed))
        }
        _ => Ok(()),
    }
}

/// `Connected` -> `Ready` transition. Tenant and project come from the
/// ticket when there is one; other hello fields win and gaps are filled
/// from the ticket.
fn accept_hello(
    first: &str,
    ticket: Option<ContextPatch>,
    default_mode: &str,
) -> TimelineResult<Session> {
    let hello = match parse_inbound(first)? {
        Inbound::Hello(hello) => hello,
        Inbound::Other(frame_type) if !frame_type.is_empty() => {
            return Err(TimelineError::protocol(
                "hello_required",
                format!("first message must be hello, got {frame_type}"),
            ));
        }
        _ => {
            return Err(TimelineError::protocol(
                "hello_required",
                "first message must be hello",
            ));
        }
    };

    let patch = match ticket {
        Some(ticket) => {
            ensure_ticket_scope(
                "tenant_id",
                ticket.tenant_id.as_deref(),
                hello.context.tenant_id.as_deref(),
            )?;
            ensure_ticket_scope(
                "project_id",
                ticket.project_id.as_deref(),
                hello.context.project_id.as_deref(),
            )?;
            hello.context.merge(ticket)
        }
        None => hello.context,
    };
    if patch.mode.is_none() {
        debug!(default_mode, "hello omitted mode; using default");
    }
    let context = patch.into_context(Some(default_mode))?;
    Ok(Session {
        context,
        last_event_id: hello.last_event_id.filter(|cursor| !cursor.is_empty()),
    })
}

#[derive(Debug)]
enum SteadyAction {
    Pong,
    Broadcast { event_type: &'static str, data: Value },
    Reject(TimelineError),
}

fn steady_action(text: &str) -> SteadyAction {
    match parse_inbound(text) {
        Ok(Inbound::Ping) => SteadyAction::Pong,
        Ok(Inbound::Gesture(data)) => SteadyAction::Broadcast {
            event_type: "gesture",
            data,
        },
        Ok(Inbound::PresencePing(data)) => SteadyAction::Broadcast {
            event_type: "presence_ping",
            data,
        },
        Ok(Inbound::Hello(_) | Inbound::Other(_)) => SteadyAction::Reject(
            TimelineError::protocol("use_sse_for_durable_writes", "use SSE for durable writes"),
        ),
        Err(error) => SteadyAction::Reject(error),
    }
}

fn error_frame(error: &TimelineError) -> Message {
    let frame = json!({
        "type": "error",
        "error": { "code": error.code(), "message": error.to_string() },
    });
    Message::Text(frame.to_string().into())
}

fn policy_close() -> Message {
    Message::Close(Some(CloseFrame {
        code: POLICY_CLOSE_CODE,
        reason: "policy violation".into(),
    }))
}

fn event_frame(event: &StreamEvent) -> TimelineResult<Message> {
    Ok(Message::Text(serde_json::to_string(event)?.into()))
}

async fn reject(socket: &mut WebSocket, error: &TimelineError) {
    warn!(code = error.code(), %error, "websocket rejected");
    let _ = socket.send(error_frame(error)).await;
    let _ = socket.send(policy_close()).await;
}

/// Releases the thread key when the connection ends.
struct Registration {
    registry: Arc<IsolationRegistry>,
    key: BusKey,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.release(&self.key);
    }
}

/// Live bus traffic for one thread. Events already sent in the replay are
/// skipped once when they arrive on the subscription.
struct ThreadFeed {
    subscription: BusSubscription,
    replayed: HashSet<EventId>,
    _registration: Registration,
}

impl ThreadFeed {
    fn open(state: &AppState, context: &RequestContext, stream_id: &str) -> TimelineResult<Self> {
        let key = BusKey::thread(stream_id)?;
        let registry = Arc::clone(state.kernel.registry());
        registry.register(key.clone());
        let registration = Registration {
            registry,
            key: key.clone(),
        };
        let subscription = state.kernel.bus().subscribe(key, context.tenant_id.as_str())?;
        Ok(Self {
            subscription,
            replayed: HashSet::new(),
            _registration: registration,
        })
    }

    fn id(&self) -> u64 {
        self.subscription.id()
    }

    /// History after `cursor`. Must run after [`Self::open`] so nothing
    /// appended in between is missed.
    async fn replay(
        &mut self,
        state: &AppState,
        context: &RequestContext,
        stream_id: &str,
        cursor: Option<&str>,
    ) -> TimelineResult<Vec<StreamEvent>> {
        let history = state.kernel.list_after(stream_id, context, cursor).await?;
        self.replayed
            .extend(history.iter().map(|event| event.event_id.clone()));
        Ok(history)
    }

    async fn next_live(&mut self) -> Option<StreamEvent> {
        while let Some(event) = self.subscription.recv().await {
            if !self.replayed.remove(&event.event_id) {
                return Some(event);
            }
        }
        None
    }
}

pub async fn ws_thread(
    Path(thread_id): Path<String>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, thread_id, query.ticket, socket))
}

/// First text frame, or `None` when the peer leaves first.
async fn first_text(socket: &mut WebSocket) -> Option<Result<String, TimelineError>> {
    loop {
        match socket.recv().await? {
            Ok(Message::Text(text)) => return Some(Ok(text.as_str().to_owned())),
            Ok(Message::Binary(_)) => {
                return Some(Err(TimelineError::protocol(
                    "hello_required",
                    "binary frames are not accepted",
                )));
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => continue,
            Ok(Message::Close(_)) | Err(_) => return None,
        }
    }
}

async fn handle_socket(
    state: AppState,
    thread_id: String,
    ticket: Option<String>,
    mut socket: WebSocket,
) {
    let ticket_patch = match ticket.as_deref().filter(|ticket| !ticket.is_empty()) {
        Some(ticket) => match state.resolver.resolve_ticket(ticket) {
            Ok(patch) => Some(patch),
            Err(error) => return reject(&mut socket, &error).await,
        },
        None => None,
    };

    let first = match timeout(state.heartbeat, first_text(&mut socket)).await {
        Ok(Some(Ok(text))) => text,
        Ok(Some(Err(error))) => return reject(&mut socket, &error).await,
        Ok(None) => return,
        Err(_) => {
            let error = TimelineError::protocol(
                "hello_required",
                "no hello before the handshake deadline",
            );
            return reject(&mut socket, &error).await;
        }
    };
    let session = match accept_hello(&first, ticket_patch, &state.default_mode) {
        Ok(session) => session,
        Err(error) => return reject(&mut socket, &error).await,
    };

    let context = session.context;
    let routing = context.routing_for_thread(thread_id);
    let stream_id = build_stream_id(&routing);
    let mut feed = match ThreadFeed::open(&state, &context, &stream_id) {
        Ok(feed) => feed,
        Err(error) => return reject(&mut socket, &error).await,
    };
    info!(
        tenant_id = %context.tenant_id,
        stream_id = %stream_id,
        subscriber = feed.id(),
        "websocket ready"
    );

    let history = match feed
        .replay(&state, &context, &stream_id, session.last_event_id.as_deref())
        .await
    {
        Ok(history) => history,
        Err(error) => return reject(&mut socket, &error).await,
    };
    for event in &history {
        match event_frame(event) {
            Ok(frame) => {
                if socket.send(frame).await.is_err() {
                    return;
                }
            }
            Err(error) => {
                warn!(%error, "replay frame could not be encoded");
                return;
            }
        }
    }

    announce_presence(&state, &context, &routing, feed.id());

    let mut heartbeat = tokio::time::interval(state.heartbeat);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if socket.send(Message::Ping(Bytes::new())).await.is_err() {
                    debug!("heartbeat failed; closing");
                    break;
                }
            }
            Some(event) = feed.next_live() => {
                let Ok(frame) = event_frame(&event) else {
                    continue;
                };
                if socket.send(frame).await.is_err() {
                    break;
                }
            }
            inbound = socket.recv() => {
                let text = match inbound {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_))) => continue,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                };
                let reply = match steady_action(text.as_str()) {
                    SteadyAction::Pong => Some(Message::Text(json!({ "type": "pong" }).to_string().into())),
                    SteadyAction::Broadcast { event_type, data } => {
                        let event = StreamEvent::gesture(event_type, routing.clone(), data);
                        match state.kernel.service().broadcast_ephemeral(&event, &context, Some(feed.id())) {
                            Ok(_) => None,
                            Err(error) => Some(error_frame(&error)),
                        }
                    }
                    SteadyAction::Reject(error) => Some(error_frame(&error)),
                };
                if let Some(reply) = reply
                    && socket.send(reply).await.is_err()
                {
                    break;
                }
            }
        }
    }

    debug!(stream_id = %stream_id, "websocket closed");
}

fn announce_presence(state: &AppState, context: &RequestContext, routing: &RoutingKeys, origin: u64) {
    let presence = StreamEvent::gesture(
        "presence_state",
        routing.clone(),
        json!({ "status": "online", "actor_id": context.actor_id }),
    );
    if let Err(error) = state
        .kernel
        .service()
        .broadcast_ephemeral(&presence, context, Some(origin))
    {
        warn!(%error, "presence broadcast failed");
    }
}
