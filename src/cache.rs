//! Local cache of the notes of recently used entities
//!
//! Entries expire a fixed time after they were written, reading an entry does not extend it.
//! There is no eviction by size.

use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use moka::ops::compute::Op;

use crate::mirror::Snapshot;
use crate::notes::EntityKey;
use crate::notes::Note;

/// Cache of note lists, keyed by entity
#[derive(Clone)]
pub struct NoteCache {
    entries: Cache<EntityKey, Arc<Snapshot>>,
}

impl NoteCache {
    /// Create a cache with the given time-to-live
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Cache::builder().time_to_live(ttl).build(),
        }
    }

    /// Fresh notes of an entity, if any
    pub async fn get(&self, key: &EntityKey) -> Option<Vec<Note>> {
        self.entries
            .get(key)
            .await
            .map(|snapshot| snapshot.notes.clone())
    }

    /// Store the notes of an entity
    ///
    /// A snapshot older than the one already cached is ignored
    pub async fn put(&self, key: &EntityKey, snapshot: Snapshot) {
        let snapshot = Arc::new(snapshot);

        self.entries
            .entry(key.clone())
            .and_compute_with(|current| {
                let op = match current {
                    Some(current) if current.value().version > snapshot.version => Op::Nop,
                    _ => Op::Put(snapshot),
                };

                std::future::ready(op)
            })
            .await;
    }

    /// Drop the entry of an entity
    pub async fn invalidate(&self, key: &EntityKey) {
        self.entries.invalidate(key).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notes::EntityType;

    fn snapshot(version: u64) -> Snapshot {
        Snapshot {
            notes: Vec::new(),
            version,
        }
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let cache = NoteCache::new(Duration::from_millis(50));
        let key = EntityKey::new(EntityType::Call, "c1").unwrap();

        cache.put(&key, snapshot(1)).await;
        assert!(cache.get(&key).await.is_some());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(cache.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_older_snapshot_is_ignored() {
        let cache = NoteCache::new(Duration::from_secs(30));
        let key = EntityKey::new(EntityType::Call, "c1").unwrap();

        cache.put(&key, snapshot(5)).await;
        cache.put(&key, snapshot(3)).await;
        assert_eq!(
            Some(5),
            cache.entries.get(&key).await.map(|entry| entry.version)
        );

        cache.invalidate(&key).await;
        cache.put(&key, snapshot(3)).await;
        assert_eq!(
            Some(3),
            cache.entries.get(&key).await.map(|entry| entry.version)
        );
    }
}
