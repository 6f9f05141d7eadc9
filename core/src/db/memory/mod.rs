//! Process-local backends for both stores.
//!
//! Used when `database_backend = "memory"` and by tests that need to observe
//! or intercept storage calls without a database file.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use crate::doc_snapshot_store::{DocSnapshotStore, DocumentSnapshot};
use crate::doc_update_log::{DocUpdateLog, DocUpdateRecord};
use crate::ids::DocumentGroupKey;

#[derive(Default)]
pub struct MemoryDocUpdateLog {
    next_id: AtomicI64,
    groups: RwLock<BTreeMap<DocumentGroupKey, BTreeMap<i64, DocUpdateRecord>>>,
}

impl MemoryDocUpdateLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, key: &DocumentGroupKey, update: &[u8], created_at: i64) -> DocUpdateRecord {
        DocUpdateRecord {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            key: key.clone(),
            update: update.to_vec(),
            created_at,
        }
    }
}

#[async_trait]
impl DocUpdateLog for MemoryDocUpdateLog {
    async fn append(&self, key: &DocumentGroupKey, update: &[u8]) -> Result<DocUpdateRecord> {
        let mut groups = self.groups.write();
        // Allocate under the write lock so ids and visibility order agree.
        let record = self.record(key, update, Utc::now().timestamp_millis());
        groups
            .entry(key.clone())
            .or_default()
            .insert(record.id, record.clone());
        Ok(record)
    }

    async fn append_many(
        &self,
        key: &DocumentGroupKey,
        updates: &[Vec<u8>],
    ) -> Result<Vec<DocUpdateRecord>> {
        if updates.is_empty() {
            return Ok(Vec::new());
        }

        let timestamp = Utc::now().timestamp_millis();
        let mut groups = self.groups.write();
        let group = groups.entry(key.clone()).or_default();
        let records: Vec<_> = updates
            .iter()
            .map(|update| self.record(key, update, timestamp))
            .collect();
        for record in &records {
            group.insert(record.id, record.clone());
        }
        Ok(records)
    }

    async fn list_pending(&self, key: &DocumentGroupKey) -> Result<Vec<DocUpdateRecord>> {
        let groups = self.groups.read();
        Ok(groups
            .get(key)
            .map(|group| group.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete(&self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let ids: HashSet<i64> = ids.iter().copied().collect();
        let mut groups = self.groups.write();
        groups.retain(|_, group| {
            group.retain(|id, _| !ids.contains(id));
            !group.is_empty()
        });
        Ok(())
    }

    async fn pending_groups(&self) -> Result<Vec<DocumentGroupKey>> {
        Ok(self.groups.read().keys().cloned().collect())
    }
}

#[derive(Default)]
pub struct MemoryDocSnapshotStore {
    snapshots: RwLock<BTreeMap<DocumentGroupKey, DocumentSnapshot>>,
}

impl MemoryDocSnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(key: &DocumentGroupKey, state: &[u8], version: i64) -> DocumentSnapshot {
        DocumentSnapshot {
            key: key.clone(),
            state: state.to_vec(),
            updated_at: Utc::now().timestamp_millis(),
            version,
        }
    }
}

#[async_trait]
impl DocSnapshotStore for MemoryDocSnapshotStore {
    async fn get(&self, key: &DocumentGroupKey) -> Result<Option<DocumentSnapshot>> {
        Ok(self.snapshots.read().get(key).cloned())
    }

    async fn put(&self, key: &DocumentGroupKey, state: &[u8]) -> Result<()> {
        let mut snapshots = self.snapshots.write();
        let version = snapshots.get(key).map_or(1, |current| current.version + 1);
        snapshots.insert(key.clone(), Self::snapshot(key, state, version));
        Ok(())
    }

    async fn put_if_version(
        &self,
        key: &DocumentGroupKey,
        state: &[u8],
        expected: Option<i64>,
    ) -> Result<bool> {
        let mut snapshots = self.snapshots.write();
        let current = snapshots.get(key).map(|snapshot| snapshot.version);
        if current != expected {
            return Ok(false);
        }
        let version = current.map_or(1, |version| version + 1);
        snapshots.insert(key.clone(), Self::snapshot(key, state, version));
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delete_drops_empty_groups_from_pending_set() {
        let log = MemoryDocUpdateLog::new();
        let a = DocumentGroupKey::new("ws", "a");
        let b = DocumentGroupKey::new("ws", "b");

        let first = log.append(&a, b"1").await.expect("append");
        log.append(&b, b"2").await.expect("append");
        log.delete(&[first.id]).await.expect("delete");

        assert_eq!(log.pending_groups().await.expect("groups"), vec![b]);
    }

    #[tokio::test]
    async fn batch_append_keeps_slice_order() {
        let log = MemoryDocUpdateLog::new();
        let key = DocumentGroupKey::new("ws", "doc");

        log.append(&key, b"0").await.expect("append");
        log.append_many(&key, &[b"1".to_vec(), b"2".to_vec()])
            .await
            .expect("append batch");

        let pending = log.list_pending(&key).await.expect("list");
        let payloads: Vec<Vec<u8>> = pending.into_iter().map(|r| r.update).collect();
        assert_eq!(payloads, vec![b"0".to_vec(), b"1".to_vec(), b"2".to_vec()]);
    }

    #[tokio::test]
    async fn snapshot_put_replaces_state() {
        let store = MemoryDocSnapshotStore::new();
        let key = DocumentGroupKey::new("ws", "doc");

        store.put(&key, b"old").await.expect("put");
        store.put(&key, b"new").await.expect("put");

        let snapshot = store.get(&key).await.expect("get").expect("snapshot");
        assert_eq!(snapshot.state, b"new");
        assert_eq!(snapshot.version, 2);
    }

    #[tokio::test]
    async fn conditional_put_only_replaces_expected_version() {
        let store = MemoryDocSnapshotStore::new();
        let key = DocumentGroupKey::new("ws", "doc");

        assert!(store.put_if_version(&key, b"v1", None).await.expect("create"));
        assert!(!store.put_if_version(&key, b"lost", None).await.expect("recreate"));
        store.put(&key, b"v2").await.expect("put");
        assert!(!store.put_if_version(&key, b"stale", Some(1)).await.expect("stale"));
        assert!(store.put_if_version(&key, b"v3", Some(2)).await.expect("fresh"));

        let snapshot = store.get(&key).await.expect("get").expect("snapshot");
        assert_eq!(snapshot.state, b"v3");
        assert_eq!(snapshot.version, 3);
    }
}
