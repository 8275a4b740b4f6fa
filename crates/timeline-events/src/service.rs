use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use timeline_protocol::{
    EventId, RequestContext, StreamEvent, TimelineError, TimelineResult, TimelineStore,
    UNIFIED_TIMELINE_STREAM,
};
use tokio::sync::mpsc;
use tokio_stream::Stream;
use tracing::{debug, error, instrument, warn};

use crate::bus::{BusKey, EventBus};

pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1024;

/// Replay-then-tail feed returned by [`TimelineService::stream_events`].
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send + 'static>>;

type Subscribers = Arc<Mutex<HashMap<u64, mpsc::Sender<StreamEvent>>>>;

/// Appends events to the store and fans them out to live readers of the
/// unified feed and to the bus.
pub struct TimelineService {
    store: Arc<dyn TimelineStore>,
    bus: EventBus,
    subscribers: Subscribers,
    next_subscriber: AtomicU64,
    capacity: usize,
}

impl TimelineService {
    pub fn new(store: Arc<dyn TimelineStore>, bus: EventBus, capacity: usize) -> Self {
        Self {
            store,
            bus,
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_subscriber: AtomicU64::new(1),
            capacity: capacity.max(1),
        }
    }

    pub fn store(&self) -> &Arc<dyn TimelineStore> {
        &self.store
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Persist (unless ephemeral) and deliver live. Returns the appended event.
    #[instrument(
        skip(self, event, context),
        fields(
            tenant_id = %context.tenant_id,
            event_id = %event.event_id,
            event_type = %event.event_type
        )
    )]
    pub async fn append_event(
        &self,
        event: StreamEvent,
        context: &RequestContext,
    ) -> TimelineResult<StreamEvent> {
        event.validate()?;
        context.ensure_scope(&event.routing)?;

        if event.meta.is_ephemeral() {
            debug!("ephemeral event; skipping store");
        } else {
            // Stream partition first: a failure here leaves nothing for the
            // unified feed to replay.
            let stream_id = event.stream_id();
            self.store.append(&stream_id, &event, context).await?;
            if let Err(error) = self
                .store
                .append(UNIFIED_TIMELINE_STREAM, &event, context)
                .await
            {
                error!(%error, stream_id = %stream_id, "unified feed write failed after stream write");
                return Err(TimelineError::PartialAppend {
                    event_id: event.event_id.as_str().to_owned(),
                    stored: stream_id,
                    missing: UNIFIED_TIMELINE_STREAM.to_owned(),
                    reason: error.to_string(),
                });
            }
        }

        self.fan_out(&event);
        self.publish_to_bus(&event, None);
        debug!("event appended");
        Ok(event)
    }

    /// Coerce loose JSON into an envelope, then append it.
    pub async fn append_value(
        &self,
        value: Value,
        context: &RequestContext,
    ) -> TimelineResult<StreamEvent> {
        let event = StreamEvent::from_value(value)?;
        self.append_event(event, context).await
    }

    /// Live-only delivery of a `persist = never` event to the bus keys it
    /// addresses, skipping the `origin` subscription. Returns the number of
    /// queues reached.
    #[instrument(
        skip(self, event, context),
        fields(tenant_id = %context.tenant_id, event_type = %event.event_type)
    )]
    pub fn broadcast_ephemeral(
        &self,
        event: &StreamEvent,
        context: &RequestContext,
        origin: Option<u64>,
    ) -> TimelineResult<usize> {
        event.validate()?;
        context.ensure_scope(&event.routing)?;
        if !event.meta.is_ephemeral() {
            return Err(TimelineError::protocol(
                "not_ephemeral",
                "only persist=never events can be broadcast without a store write",
            ));
        }
        Ok(self.publish_to_bus(event, origin))
    }

    /// Replay history after `cursor`, then tail live events for the caller's
    /// tenant. The live queue is registered before history is read, and
    /// replayed ids are skipped when they show up again on the queue.
    #[instrument(skip(self, context), fields(tenant_id = %context.tenant_id))]
    pub async fn stream_events(
        &self,
        context: &RequestContext,
        cursor: Option<String>,
    ) -> TimelineResult<EventStream> {
        let (guard, mut receiver) = self.register_subscriber();
        let tenant_id = context.tenant_id.clone();

        let history = self
            .store
            .list_after(UNIFIED_TIMELINE_STREAM, tenant_id.as_str(), cursor.as_deref())
            .await?;
        let mut replayed: HashSet<EventId> =
            history.iter().map(|event| event.event_id.clone()).collect();
        debug!(replayed = history.len(), subscriber = guard.id, "stream opened");

        Ok(Box::pin(async_stream::stream! {
            let _guard = guard;
            for event in history {
                yield event;
            }
            while let Some(event) = receiver.recv().await {
                if replayed.remove(&event.event_id) {
                    continue;
                }
                if event.routing.tenant_id != tenant_id {
                    continue;
                }
                yield event;
            }
        }))
    }

    fn register_subscriber(&self) -> (SubscriberGuard, mpsc::Receiver<StreamEvent>) {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.capacity);
        self.subscribers.lock().insert(id, sender);
        let guard = SubscriberGuard {
            id,
            subscribers: Arc::clone(&self.subscribers),
        };
        (guard, receiver)
    }

    fn fan_out(&self, event: &StreamEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|id, sender| match sender.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(subscriber = id, event_id = %event.event_id, "subscriber queue full; event dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(subscriber = id, "subscriber gone");
                false
            }
        });
    }

    fn publish_to_bus(&self, event: &StreamEvent, origin: Option<u64>) -> usize {
        let mut keys = Vec::with_capacity(3);
        match BusKey::thread(&event.stream_id()) {
            Ok(key) => keys.push(key),
            Err(error) => warn!(%error, "event has no thread bus key"),
        }
        if let Some(run_id) = &event.ids.run_id {
            keys.push(BusKey::run(event.routing.tenant_id.clone(), run_id));
        }
        if let Some(canvas_id) = event.routing.canvas_id.as_deref().filter(|id| !id.is_empty()) {
            keys.push(BusKey::canvas(
                event.routing.tenant_id.clone(),
                event.routing.project_id.as_str(),
                canvas_id,
            ));
        }

        keys.iter()
            .map(|key| match origin {
                Some(origin) => self.bus.publish_except(key, origin, event),
                None => self.bus.publish(key, event),
            })
            .sum()
    }
}

/// Unregisters a unified-feed queue when the reading stream is dropped.
struct SubscriberGuard {
    id: u64,
    subscribers: Subscribers,
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        if self.subscribers.lock().remove(&self.id).is_some() {
            debug!(subscriber = self.id, "stream closed");
        }
    }
}
