//! Process-local store for development and lab environments.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use timeline_protocol::{
    AppendPlan, RequestContext, StreamEvent, TimelineResult, TimelineStore, prepare_append,
    read_partition_key, retain_tenant, suffix_after,
};
use tracing::{debug, instrument};

#[derive(Debug, Default)]
pub struct InMemoryTimelineStore {
    partitions: RwLock<HashMap<String, Vec<StreamEvent>>>,
}

impl InMemoryTimelineStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.read().len()
    }
}

#[async_trait]
impl TimelineStore for InMemoryTimelineStore {
    #[instrument(
        skip(self, event, context),
        fields(tenant_id = %context.tenant_id, event_id = %event.event_id)
    )]
    async fn append(
        &self,
        stream_id: &str,
        event: &StreamEvent,
        context: &RequestContext,
    ) -> TimelineResult<()> {
        let partition_key = match prepare_append(stream_id, event, context)? {
            AppendPlan::Persist { partition_key } => partition_key,
            AppendPlan::Skip => {
                debug!("ephemeral event not persisted");
                return Ok(());
            }
        };

        self.partitions
            .write()
            .entry(partition_key)
            .or_default()
            .push(event.clone());
        debug!("event appended to store");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_after(
        &self,
        stream_id: &str,
        tenant_id: &str,
        after_event_id: Option<&str>,
    ) -> TimelineResult<Vec<StreamEvent>> {
        let partition_key = read_partition_key(stream_id, tenant_id)?;
        let history = self
            .partitions
            .read()
            .get(&partition_key)
            .cloned()
            .unwrap_or_default();
        let out = suffix_after(retain_tenant(history, tenant_id), after_event_id);
        debug!(count = out.len(), "events loaded from store");
        Ok(out)
    }

    fn backend_name(&self) -> &'static str {
        "in_memory"
    }
}
