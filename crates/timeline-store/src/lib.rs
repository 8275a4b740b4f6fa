//! Timeline store backends.
//!
//! Every backend implements [`timeline_protocol::TimelineStore`] and addresses
//! storage only by the tenant-qualified partition key. [`open_store`] is the
//! single place a backend variant is chosen, from the descriptor the routing
//! resolver returned.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use timeline_protocol::{TimelineResult, TimelineStore};
use timeline_routing::BackendDescriptor;
use tracing::info;

pub mod document;
pub mod file;
pub mod firestore;
mod locks;
pub mod memory;

pub use document::{DocumentClient, DocumentRecord, DocumentTimelineStore, InsertOutcome};
pub use file::FileTimelineStore;
pub use firestore::FirestoreClient;
pub use memory::InMemoryTimelineStore;

/// Stable, filesystem- and collection-safe name for a partition key.
pub fn partition_digest(partition_key: &str) -> String {
    hex::encode(Sha256::digest(partition_key.as_bytes()))
}

/// Construct the backend a route selected.
pub fn open_store(descriptor: &BackendDescriptor) -> TimelineResult<Arc<dyn TimelineStore>> {
    let store: Arc<dyn TimelineStore> = match descriptor {
        BackendDescriptor::InMemory => Arc::new(InMemoryTimelineStore::new()),
        BackendDescriptor::Filesystem { base_path } => {
            Arc::new(FileTimelineStore::new(base_path.clone()))
        }
        BackendDescriptor::DocumentStore(config) => {
            let client = FirestoreClient::from_config(config)?;
            Arc::new(DocumentTimelineStore::new(
                client,
                config.collection_prefix.clone(),
            ))
        }
    };
    info!(backend = store.backend_name(), "timeline store opened");
    Ok(store)
}


#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use timeline_routing::{BackendDescriptor, DocumentStoreConfig};

    use super::*;

    #[test]
    fn partition_digest_is_stable_and_distinct() {
        assert_eq!(partition_digest("t_a:s"), partition_digest("t_a:s"));
        assert_ne!(partition_digest("t_a:s"), partition_digest("t_b:s"));
        assert_eq!(partition_digest("t_a:s").len(), 64);
    }

    #[test]
    fn open_store_selects_variant_from_descriptor() {
        let memory = open_store(&BackendDescriptor::InMemory).unwrap();
        assert_eq!(memory.backend_name(), "in_memory");

        let file = open_store(&BackendDescriptor::Filesystem {
            base_path: PathBuf::from("/tmp/timeline-open-store"),
        })
        .unwrap();
        assert_eq!(file.backend_name(), "filesystem");
    }

    #[test]
    fn open_store_fails_when_token_env_is_missing() {
        let mut config = DocumentStoreConfig::new("gcp-test");
        config.access_token_env = Some("TIMELINE_TEST_TOKEN_THAT_IS_NEVER_SET".to_owned());
        let result = open_store(&BackendDescriptor::DocumentStore(config));
        assert!(result.is_err());
    }
}
