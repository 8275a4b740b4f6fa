//! Document-store backend.
//!
//! Each partition is one collection named `{prefix}_{sha256(partition_key)}`.
//! Records carry the full event JSON plus an insertion `position`; positions
//! are allocated per partition and claimed with a create-if-absent insert, so
//! a concurrent writer in another process surfaces as a conflict and a retry
//! rather than an overwrite.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use timeline_protocol::{
    AppendPlan, RequestContext, StreamEvent, TimelineError, TimelineResult, TimelineStore,
    prepare_append, read_partition_key, retain_tenant, suffix_after,
};
use tracing::{debug, instrument, warn};

use crate::locks::PartitionLocks;
use crate::partition_digest;

const MAX_INSERT_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub position: u64,
    pub event_id: String,
    pub tenant_id: String,
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A record already exists at this position.
    Conflict,
}

#[async_trait]
pub trait DocumentClient: Send + Sync {
    /// Create `record` in `collection`; never overwrites an existing position.
    async fn insert(&self, collection: &str, record: &DocumentRecord)
    -> TimelineResult<InsertOutcome>;

    /// All records of `collection`, ordered by position.
    async fn list(&self, collection: &str) -> TimelineResult<Vec<DocumentRecord>>;
}

/// Write locks are dropped once a collection is idle. The next-position
/// cache keeps one counter per collection written by this process, so a
/// later append skips the rescan.
pub struct DocumentTimelineStore<C> {
    client: C,
    collection_prefix: String,
    next_positions: Mutex<HashMap<String, u64>>,
    write_locks: PartitionLocks,
}

impl<C: DocumentClient> DocumentTimelineStore<C> {
    pub fn new(client: C, collection_prefix: impl Into<String>) -> Self {
        Self {
            client,
            collection_prefix: collection_prefix.into(),
            next_positions: Mutex::new(HashMap::new()),
            write_locks: PartitionLocks::default(),
        }
    }

    pub fn collection_for(&self, partition_key: &str) -> String {
        format!(
            "{}_{}",
            self.collection_prefix,
            partition_digest(partition_key)
        )
    }

    async fn scan_next_position(&self, collection: &str) -> TimelineResult<u64> {
        let records = self.client.list(collection).await?;
        Ok(records
            .iter()
            .map(|record| record.position)
            .max()
            .map_or(1, |last| last.saturating_add(1)))
    }
}

#[async_trait]
impl<C: DocumentClient> TimelineStore for DocumentTimelineStore<C> {
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

        let collection = self.collection_for(&partition_key);
        let _guard = self.write_locks.acquire(&collection).await;

        let cached = self.next_positions.lock().get(&collection).copied();
        let mut position = match cached {
            Some(position) => position,
            None => self.scan_next_position(&collection).await?,
        };

        let payload = serde_json::to_value(event)?;
        for attempt in 1..=MAX_INSERT_ATTEMPTS {
            let record = DocumentRecord {
                position,
                event_id: event.event_id.as_str().to_owned(),
                tenant_id: context.tenant_id.as_str().to_owned(),
                payload: payload.clone(),
            };
            match self.client.insert(&collection, &record).await? {
                InsertOutcome::Inserted => {
                    self.next_positions
                        .lock()
                        .insert(collection, position.saturating_add(1));
                    debug!(position, "event appended to store");
                    return Ok(());
                }
                InsertOutcome::Conflict => {
                    warn!(position, attempt, "position taken by another writer; rescanning");
                    position = self.scan_next_position(&collection).await?;
                }
            }
        }

        self.next_positions.lock().remove(&collection);
        Err(TimelineError::Storage(format!(
            "could not claim a position in {collection} after {MAX_INSERT_ATTEMPTS} attempts"
        )))
    }

    #[instrument(skip(self))]
    async fn list_after(
        &self,
        stream_id: &str,
        tenant_id: &str,
        after_event_id: Option<&str>,
    ) -> TimelineResult<Vec<StreamEvent>> {
        let partition_key = read_partition_key(stream_id, tenant_id)?;
        let collection = self.collection_for(&partition_key);

        let mut records = self.client.list(&collection).await?;
        records.sort_by_key(|record| record.position);

        let history = records
            .into_iter()
            .map(|record| {
                serde_json::from_value::<StreamEvent>(record.payload).map_err(|error| {
                    TimelineError::Serialization(format!(
                        "failed parsing record {} in {collection}: {error}",
                        record.event_id
                    ))
                })
            })
            .collect::<TimelineResult<Vec<_>>>()?;

        let out = suffix_after(retain_tenant(history, tenant_id), after_event_id);
        debug!(count = out.len(), "events loaded from store");
        Ok(out)
    }

    fn backend_name(&self) -> &'static str {
        "document_store"
    }
}
