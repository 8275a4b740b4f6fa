use std::sync::Arc;

use serde_json::Value;
use timeline_events::{
    DEFAULT_SUBSCRIBER_CAPACITY, EventBus, EventStream, IsolationRegistry, TimelineService,
};
use timeline_protocol::{RequestContext, StreamEvent, TimelineResult, TimelineStore};
use timeline_routing::{
    BackendDescriptor, ResourceKind, RouteTable, RoutingResolver, WILDCARD,
};
use timeline_store::open_store;
use tracing::{info, instrument};

#[derive(Debug, Clone)]
pub struct TimelineBuilder {
    routes: RouteTable,
    tenant_id: String,
    env: String,
    project_id: String,
    subscriber_capacity: usize,
}

impl TimelineBuilder {
    pub fn new(routes: RouteTable) -> Self {
        Self {
            routes,
            tenant_id: WILDCARD.to_owned(),
            env: "lab".to_owned(),
            project_id: WILDCARD.to_owned(),
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
        }
    }

    /// Tenant, environment and project the store route is resolved for.
    pub fn scope(
        mut self,
        tenant_id: impl Into<String>,
        env: impl Into<String>,
        project_id: impl Into<String>,
    ) -> Self {
        self.tenant_id = tenant_id.into();
        self.env = env.into();
        self.project_id = project_id.into();
        self
    }

    pub fn subscriber_capacity(mut self, capacity: usize) -> Self {
        self.subscriber_capacity = capacity;
        self
    }

    /// Fails when no route matches or the route is refused for the env.
    pub fn build(self) -> TimelineResult<TimelineKernel> {
        let resolver = RoutingResolver::new(self.routes);
        let backend = resolver.require(
            &ResourceKind::timeline(),
            &self.tenant_id,
            &self.env,
            &self.project_id,
        )?;
        let store = open_store(&backend)?;
        info!(
            tenant_id = %self.tenant_id,
            env = %self.env,
            project_id = %self.project_id,
            backend = backend.backend_type(),
            "timeline kernel built"
        );
        Ok(TimelineKernel::assemble(
            store,
            Some(backend),
            self.subscriber_capacity,
        ))
    }
}

struct KernelInner {
    service: TimelineService,
    registry: Arc<IsolationRegistry>,
    backend: Option<BackendDescriptor>,
}

/// The process-wide timeline. Cheap to clone; handed to every transport.
#[derive(Clone)]
pub struct TimelineKernel {
    inner: Arc<KernelInner>,
}

impl TimelineKernel {
    /// Kernel over an already-open store, bypassing route resolution.
    pub fn with_store(store: Arc<dyn TimelineStore>, subscriber_capacity: usize) -> Self {
        Self::assemble(store, None, subscriber_capacity)
    }

    fn assemble(
        store: Arc<dyn TimelineStore>,
        backend: Option<BackendDescriptor>,
        subscriber_capacity: usize,
    ) -> Self {
        let registry = Arc::new(IsolationRegistry::new());
        let bus = EventBus::new(Arc::clone(&registry), subscriber_capacity);
        let service = TimelineService::new(store, bus, subscriber_capacity);
        Self {
            inner: Arc::new(KernelInner {
                service,
                registry,
                backend,
            }),
        }
    }

    pub fn service(&self) -> &TimelineService {
        &self.inner.service
    }

    pub fn bus(&self) -> &EventBus {
        self.inner.service.bus()
    }

    pub fn registry(&self) -> &Arc<IsolationRegistry> {
        &self.inner.registry
    }

    pub fn store(&self) -> &Arc<dyn TimelineStore> {
        self.inner.service.store()
    }

    /// The routed backend; `None` for kernels built with [`Self::with_store`].
    pub fn backend(&self) -> Option<&BackendDescriptor> {
        self.inner.backend.as_ref()
    }

    #[instrument(skip(self, event, context), fields(tenant_id = %context.tenant_id))]
    pub async fn append_event(
        &self,
        event: StreamEvent,
        context: &RequestContext,
    ) -> TimelineResult<StreamEvent> {
        self.inner.service.append_event(event, context).await
    }

    pub async fn append_value(
        &self,
        value: Value,
        context: &RequestContext,
    ) -> TimelineResult<StreamEvent> {
        self.inner.service.append_value(value, context).await
    }

    pub async fn stream_events(
        &self,
        context: &RequestContext,
        cursor: Option<String>,
    ) -> TimelineResult<EventStream> {
        self.inner.service.stream_events(context, cursor).await
    }

    pub async fn list_after(
        &self,
        stream_id: &str,
        context: &RequestContext,
        after_event_id: Option<&str>,
    ) -> TimelineResult<Vec<StreamEvent>> {
        self.store()
            .list_after(stream_id, context.tenant_id.as_str(), after_event_id)
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use anyhow::Result;
    use serde_json::json;
    use timeline_protocol::{RequestContext, RoutingKeys, StreamEvent, TimelineError};
    use timeline_routing::{BackendDescriptor, ResourceKind, RouteRecord, RouteTable};
    use tokio::fs;
    use tokio_stream::StreamExt;

    use crate::TimelineBuilder;

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    fn route(env: &str, backend: BackendDescriptor) -> RouteRecord {
        RouteRecord::new(ResourceKind::timeline(), "*", env, "*", backend)
    }

    #[test]
    fn missing_route_fails_build() {
        let err = TimelineBuilder::new(RouteTable::new()).build().err().unwrap();
        assert!(matches!(err, TimelineError::MissingRoute { .. }));
    }

    #[test]
    fn filesystem_route_is_refused_for_saas() {
        let table = RouteTable::new().with_route(route(
            "saas",
            BackendDescriptor::Filesystem {
                base_path: PathBuf::from("/tmp/timeline"),
            },
        ));
        let err = TimelineBuilder::new(table)
            .scope("t_demo", "saas", "p1")
            .build()
            .err()
            .unwrap();
        assert_eq!(err.code(), "backend_refused");
    }

    #[tokio::test]
    async fn built_kernel_appends_and_streams() -> Result<()> {
        let root = unique_test_root("timeline-kernel-file");
        let table = RouteTable::new().with_route(route(
            "lab",
            BackendDescriptor::Filesystem {
                base_path: root.clone(),
            },
        ));
        let kernel = TimelineBuilder::new(table).subscriber_capacity(4).build()?;
        assert_eq!(kernel.store().backend_name(), "filesystem");

        let ctx = RequestContext::new("t_demo", "p1");
        let event = StreamEvent::truth(
            "user_message",
            RoutingKeys::new("t_demo", "p1").with_thread("th1"),
            json!({ "text": "hello" }),
        );
        let appended = kernel.append_event(event, &ctx).await?;

        let mut stream = kernel.stream_events(&ctx, None).await?;
        assert_eq!(stream.next().await, Some(appended.clone()));

        let history = kernel.list_after("t_demo:p1:th1", &ctx, None).await?;
        assert_eq!(history, vec![appended]);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[test]
    fn clones_share_one_service() {
        let table =
            RouteTable::new().with_route(route("*", BackendDescriptor::InMemory));
        let kernel = TimelineBuilder::new(table).build().unwrap();
        let clone = kernel.clone();
        assert!(std::ptr::eq(kernel.service(), clone.service()));
        assert_eq!(kernel.backend(), Some(&BackendDescriptor::InMemory));
    }
}
