use std::path::{Path, PathBuf};

use async_trait::async_trait;
use timeline_protocol::{
    AppendPlan, RequestContext, StreamEvent, TimelineError, TimelineResult, TimelineStore,
    prepare_append, read_partition_key, retain_tenant, suffix_after,
};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, instrument};

use crate::locks::PartitionLocks;
use crate::partition_digest;

/// One JSONL file per partition: `{root}/{tenant_id}/{sha256(partition_key)}.jsonl`.
#[derive(Debug)]
pub struct FileTimelineStore {
    root: PathBuf,
    partition_locks: PartitionLocks,
}

impl FileTimelineStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            partition_locks: PartitionLocks::default(),
        }
    }

    fn file_path(&self, tenant_id: &str, partition_key: &str) -> PathBuf {
        self.root
            .join(tenant_id)
            .join(format!("{}.jsonl", partition_digest(partition_key)))
    }

    async fn ensure_parent(path: &Path) -> TimelineResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|error| {
                TimelineError::Storage(format!("failed to create partition dir {parent:?}: {error}"))
            })?;
        }
        Ok(())
    }

    async fn read_partition(path: &Path) -> TimelineResult<Vec<StreamEvent>> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let file = OpenOptions::new().read(true).open(path).await?;
        let mut reader = BufReader::new(file).lines();
        let mut out = Vec::new();

        while let Some(line) = reader.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: StreamEvent = serde_json::from_str(&line).map_err(|error| {
                TimelineError::Serialization(format!(
                    "failed parsing event line in {path:?}: {error}"
                ))
            })?;
            out.push(event);
        }
        Ok(out)
    }
}

#[async_trait]
impl TimelineStore for FileTimelineStore {
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

        let path = self.file_path(context.tenant_id.as_str(), &partition_key);
        Self::ensure_parent(&path).await?;

        let _guard = self.partition_locks.acquire(&partition_key).await;

        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|error| {
                TimelineError::Storage(format!("failed opening partition {path:?}: {error}"))
            })?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
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
        let path = self.file_path(tenant_id, &partition_key);

        let history = {
            let _guard = self.partition_locks.acquire(&partition_key).await;
            Self::read_partition(&path).await?
        };

        let out = suffix_after(retain_tenant(history, tenant_id), after_event_id);
        debug!(count = out.len(), "events loaded from store");
        Ok(out)
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use anyhow::Result;
    use timeline_protocol::{RequestContext, TimelineStore};
    use tokio::fs;

    use super::FileTimelineStore;
    use crate::conformance;

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    async fn with_store<F, Fut>(name: &str, body: F) -> Result<()>
    where
        F: FnOnce(FileTimelineStore) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let root = unique_test_root(name);
        let result = body(FileTimelineStore::new(&root)).await;
        let _ = fs::remove_dir_all(root).await;
        result
    }

    #[tokio::test]
    async fn cursor_scenario() -> Result<()> {
        with_store("timeline-file-cursor", |store| async move {
            conformance::cursor_scenario(&store).await
        })
        .await
    }

    #[tokio::test]
    async fn resume_is_complete_for_every_cursor() -> Result<()> {
        with_store("timeline-file-resume", |store| async move {
            conformance::resume_is_complete_for_every_cursor(&store).await
        })
        .await
    }

    #[tokio::test]
    async fn tenants_are_isolated() -> Result<()> {
        with_store("timeline-file-isolation", |store| async move {
            conformance::tenants_are_isolated(&store).await
        })
        .await
    }

    #[tokio::test]
    async fn ephemeral_events_are_not_persisted() -> Result<()> {
        with_store("timeline-file-ephemeral", |store| async move {
            conformance::ephemeral_events_are_not_persisted(&store).await
        })
        .await
    }

    #[tokio::test]
    async fn scope_mismatch_is_rejected() -> Result<()> {
        with_store("timeline-file-scope", |store| async move {
            conformance::scope_mismatch_is_rejected(&store).await
        })
        .await
    }

    #[tokio::test]
    async fn event_roundtrips_unchanged() -> Result<()> {
        with_store("timeline-file-roundtrip", |store| async move {
            conformance::event_roundtrips_unchanged(&store).await
        })
        .await
    }

    #[tokio::test]
    async fn history_survives_reopen_under_tenant_directory() -> Result<()> {
        let root = unique_test_root("timeline-file-reopen");
        let ctx = RequestContext::new("t_demo", "p1");
        {
            let store = FileTimelineStore::new(&root);
            store
                .append(conformance::STREAM, &conformance::event("t_demo", "1"), &ctx)
                .await?;
        }

        let reopened = FileTimelineStore::new(&root);
        let history = reopened
            .list_after(conformance::STREAM, "t_demo", None)
            .await?;
        assert_eq!(history.len(), 1);
        assert!(fs::try_exists(root.join("t_demo")).await?);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn partition_locks_do_not_accumulate() -> Result<()> {
        with_store("timeline-file-locks", |store| async move {
            let ctx = RequestContext::new("t_demo", "p1");
            for thread in ["th1", "th2", "th3"] {
                let stream = format!("t_demo:p1:{thread}");
                store
                    .append(&stream, &conformance::event("t_demo", thread), &ctx)
                    .await?;
                store.list_after(&stream, "t_demo", None).await?;
            }
            assert_eq!(store.partition_locks.len(), 0);
            Ok(())
        })
        .await
    }

    #[tokio::test]
    async fn corrupted_line_is_reported() -> Result<()> {
        let root = unique_test_root("timeline-file-corrupt");
        let ctx = RequestContext::new("t_demo", "p1");
        let store = FileTimelineStore::new(&root);
        store
            .append(conformance::STREAM, &conformance::event("t_demo", "1"), &ctx)
            .await?;

        let partition = format!("t_demo:{}", conformance::STREAM);
        let path = root
            .join("t_demo")
            .join(format!("{}.jsonl", crate::partition_digest(&partition)));
        let mut raw = fs::read_to_string(&path).await?;
        raw.push_str("{not json\n");
        fs::write(&path, raw).await?;

        let err = store
            .list_after(conformance::STREAM, "t_demo", None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "serialization_error");

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }
}
