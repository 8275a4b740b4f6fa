//! Keyed live fan-out for runs, threads and canvases.
//!
//! A key can only be subscribed to once it is present in the
//! [`IsolationRegistry`], and only by the tenant that owns it. Each
//! subscriber gets its own bounded queue; a full queue drops the newest
//! event for that subscriber only.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use timeline_protocol::{
    RunId, StreamEvent, TenantId, TimelineError, TimelineResult, tenant_of_stream,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusScope {
    Run,
    Thread,
    Canvas,
}

impl fmt::Display for BusScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Run => "run",
            Self::Thread => "thread",
            Self::Canvas => "canvas",
        })
    }
}

/// Address of one fan-out group. The embedded tenant owns the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BusKey {
    pub scope: BusScope,
    pub tenant_id: TenantId,
    pub id: String,
}

impl BusKey {
    /// Key for a canonical stream id; the tenant is its leading segment.
    pub fn thread(stream_id: &str) -> TimelineResult<Self> {
        let tenant = tenant_of_stream(stream_id).ok_or_else(|| {
            TimelineError::InvalidRouting(format!("stream id {stream_id} has no tenant segment"))
        })?;
        Ok(Self {
            scope: BusScope::Thread,
            tenant_id: TenantId::from_string(tenant),
            id: stream_id.to_owned(),
        })
    }

    pub fn run(tenant_id: impl Into<TenantId>, run_id: &RunId) -> Self {
        Self {
            scope: BusScope::Run,
            tenant_id: tenant_id.into(),
            id: run_id.as_str().to_owned(),
        }
    }

    pub fn canvas(tenant_id: impl Into<TenantId>, project_id: &str, canvas_id: &str) -> Self {
        Self {
            scope: BusScope::Canvas,
            tenant_id: tenant_id.into(),
            id: format!("{project_id}:{canvas_id}"),
        }
    }
}

impl fmt::Display for BusKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.scope, self.tenant_id, self.id)
    }
}

/// Keys open for subscription. Registrations are counted, so a key stays
/// open until every registrant has released it.
#[derive(Debug, Default)]
pub struct IsolationRegistry {
    keys: RwLock<HashMap<BusKey, usize>>,
}

impl IsolationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when this is the first registration of `key`.
    pub fn register(&self, key: BusKey) -> bool {
        let mut keys = self.keys.write();
        let count = keys.entry(key).or_insert(0);
        *count += 1;
        *count == 1
    }

    pub fn contains(&self, key: &BusKey) -> bool {
        self.keys.read().contains_key(key)
    }

    /// Returns `true` when the last registration was released.
    pub fn release(&self, key: &BusKey) -> bool {
        let mut keys = self.keys.write();
        match keys.get_mut(key) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                keys.remove(key);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }
}

type SubscriberSets = Mutex<HashMap<BusKey, HashMap<u64, mpsc::Sender<StreamEvent>>>>;

struct BusInner {
    registry: Arc<IsolationRegistry>,
    subscribers: SubscriberSets,
    next_id: AtomicU64,
    capacity: usize,
}

impl BusInner {
    fn unsubscribe(&self, key: &BusKey, id: u64) {
        let mut sets = self.subscribers.lock();
        if let Some(set) = sets.get_mut(key) {
            set.remove(&id);
            if set.is_empty() {
                sets.remove(key);
            }
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(registry: Arc<IsolationRegistry>, capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                registry,
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                capacity: capacity.max(1),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<IsolationRegistry> {
        &self.inner.registry
    }

    pub fn subscribe(&self, key: BusKey, tenant_id: &str) -> TimelineResult<BusSubscription> {
        if !self.inner.registry.contains(&key) {
            return Err(TimelineError::UnregisteredKey(key.to_string()));
        }
        if key.tenant_id.as_str() != tenant_id {
            return Err(TimelineError::scope(
                "tenant_id",
                key.tenant_id.as_str(),
                tenant_id,
            ));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.inner.capacity);
        self.inner
            .subscribers
            .lock()
            .entry(key.clone())
            .or_default()
            .insert(id, sender);
        debug!(%key, subscriber = id, "bus subscription opened");

        Ok(BusSubscription {
            id,
            key,
            receiver,
            bus: Arc::clone(&self.inner),
        })
    }

    /// Deliver to every subscriber of `key`. Returns the number of queues
    /// that accepted the event.
    pub fn publish(&self, key: &BusKey, event: &StreamEvent) -> usize {
        self.fan_out(key, None, event)
    }

    /// Deliver to every subscriber of `key` except `origin`.
    pub fn publish_except(&self, key: &BusKey, origin: u64, event: &StreamEvent) -> usize {
        self.fan_out(key, Some(origin), event)
    }

    pub fn subscriber_count(&self, key: &BusKey) -> usize {
        self.inner
            .subscribers
            .lock()
            .get(key)
            .map_or(0, HashMap::len)
    }

    fn fan_out(&self, key: &BusKey, origin: Option<u64>, event: &StreamEvent) -> usize {
        let mut sets = self.inner.subscribers.lock();
        let Some(set) = sets.get_mut(key) else {
            return 0;
        };

        let mut delivered = 0;
        let mut closed = Vec::new();
        for (id, sender) in set.iter() {
            if Some(*id) == origin {
                continue;
            }
            match sender.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(%key, subscriber = id, event_id = %event.event_id, "bus queue full; event dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
            }
        }
        for id in closed {
            set.remove(&id);
        }
        if set.is_empty() {
            sets.remove(key);
        }
        delivered
    }
}

/// Live queue for one bus key. Dropping it unsubscribes.
pub struct BusSubscription {
    id: u64,
    key: BusKey,
    receiver: mpsc::Receiver<StreamEvent>,
    bus: Arc<BusInner>,
}

impl BusSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &BusKey {
        &self.key
    }

    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(&self.key, self.id);
        debug!(key = %self.key, subscriber = self.id, "bus subscription closed");
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use timeline_protocol::{RoutingKeys, StreamEvent, TimelineError};

    use super::*;

    const STREAM: &str = "t_demo:p1:th1";

    fn bus() -> EventBus {
        EventBus::new(Arc::new(IsolationRegistry::new()), 8)
    }

    fn gesture(text: &str) -> StreamEvent {
        StreamEvent::gesture(
            "gesture",
            RoutingKeys::new("t_demo", "p1").with_thread("th1"),
            json!({ "text": text }),
        )
    }

    #[test]
    fn thread_key_takes_tenant_from_stream_id() {
        let key = BusKey::thread(STREAM).unwrap();
        assert_eq!(key.scope, BusScope::Thread);
        assert_eq!(key.tenant_id, "t_demo");
        assert_eq!(key.to_string(), "thread/t_demo/t_demo:p1:th1");
        assert!(BusKey::thread("").is_err());
    }

    #[test]
    fn registry_counts_registrations() {
        let registry = IsolationRegistry::new();
        let key = BusKey::thread(STREAM).unwrap();
        assert!(registry.register(key.clone()));
        assert!(!registry.register(key.clone()));
        assert!(!registry.release(&key));
        assert!(registry.contains(&key));
        assert!(registry.release(&key));
        assert!(registry.is_empty());
    }

    #[test]
    fn unregistered_key_cannot_be_subscribed() {
        let bus = bus();
        let err = bus
            .subscribe(BusKey::thread(STREAM).unwrap(), "t_demo")
            .err()
            .unwrap();
        assert!(matches!(err, TimelineError::UnregisteredKey(_)));
    }

    #[test]
    fn foreign_tenant_cannot_subscribe() {
        let bus = bus();
        let key = BusKey::thread(STREAM).unwrap();
        bus.registry().register(key.clone());
        let err = bus.subscribe(key, "t_other").err().unwrap();
        assert_eq!(err.code(), "scope_violation");
    }

    #[tokio::test]
    async fn publish_except_skips_origin() {
        let bus = bus();
        let key = BusKey::thread(STREAM).unwrap();
        bus.registry().register(key.clone());
        let mut a = bus.subscribe(key.clone(), "t_demo").unwrap();
        let mut b = bus.subscribe(key.clone(), "t_demo").unwrap();

        assert_eq!(bus.publish_except(&key, a.id(), &gesture("hi")), 1);
        assert!(a.try_recv().is_none());
        let got = b.recv().await.unwrap();
        assert_eq!(got.data["text"], "hi");

        assert_eq!(bus.publish(&key, &gesture("all")), 2);
    }

    #[test]
    fn full_queue_drops_newest_for_that_subscriber() {
        let bus = EventBus::new(Arc::new(IsolationRegistry::new()), 1);
        let key = BusKey::thread(STREAM).unwrap();
        bus.registry().register(key.clone());
        let mut sub = bus.subscribe(key.clone(), "t_demo").unwrap();

        assert_eq!(bus.publish(&key, &gesture("first")), 1);
        assert_eq!(bus.publish(&key, &gesture("second")), 0);
        assert_eq!(sub.try_recv().unwrap().data["text"], "first");
        assert!(sub.try_recv().is_none());
        assert_eq!(bus.subscriber_count(&key), 1);
    }

    #[test]
    fn dropping_subscription_prunes_key() {
        let bus = bus();
        let key = BusKey::thread(STREAM).unwrap();
        bus.registry().register(key.clone());
        let sub = bus.subscribe(key.clone(), "t_demo").unwrap();
        assert_eq!(bus.subscriber_count(&key), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(&key), 0);
        assert_eq!(bus.publish(&key, &gesture("nobody")), 0);
    }
}
