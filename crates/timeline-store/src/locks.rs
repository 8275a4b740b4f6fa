//! Per-partition async write locks.
//!
//! An entry lives only while some task holds or waits on it; the last guard
//! to drop removes it, so the map tracks active partitions rather than every
//! partition ever touched.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;

#[derive(Debug, Default)]
pub(crate) struct PartitionLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl PartitionLocks {
    pub(crate) async fn acquire(&self, key: &str) -> PartitionGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock();
            Arc::clone(
                locks
                    .entry(key.to_owned())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };
        let guard = lock.lock_owned().await;
        PartitionGuard {
            locks: self,
            key: key.to_owned(),
            guard: Some(guard),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.locks.lock().len()
    }
}

pub(crate) struct PartitionGuard<'a> {
    locks: &'a PartitionLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for PartitionGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Clones are only taken under the map lock, so a count of one here
        // means no other task holds or waits on this partition.
        let mut locks = self.locks.locks.lock();
        if locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::PartitionLocks;

    #[tokio::test]
    async fn idle_partitions_are_evicted() {
        let locks = PartitionLocks::default();
        {
            let _a = locks.acquire("t_a:s1").await;
            let _b = locks.acquire("t_a:s2").await;
            assert_eq!(locks.len(), 2);
        }
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn waiter_keeps_entry_alive() {
        let locks = Arc::new(PartitionLocks::default());
        let first = locks.acquire("t_a:s1").await;

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.acquire("t_a:s1").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        drop(first);
        assert_eq!(locks.len(), 1);
        waiter.await.unwrap();
        assert_eq!(locks.len(), 0);
    }
}
