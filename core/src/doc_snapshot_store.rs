use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::ids::DocumentGroupKey;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentSnapshot {
    pub key: DocumentGroupKey,
    pub state: Vec<u8>,
    pub updated_at: i64,
    /// Bumped by every successful write; starts at 1.
    pub version: i64,
}

/// Latest compacted state per document group.
#[async_trait]
pub trait DocSnapshotStore: Send + Sync {
    async fn get(&self, key: &DocumentGroupKey) -> Result<Option<DocumentSnapshot>>;

    /// Replace the snapshot for `key` in a single atomic write.
    async fn put(&self, key: &DocumentGroupKey, state: &[u8]) -> Result<()>;

    /// Replace the snapshot only if its version is still `expected`
    /// (`None`: no snapshot exists yet). Returns `false` and writes nothing
    /// when another writer got there first.
    async fn put_if_version(
        &self,
        key: &DocumentGroupKey,
        state: &[u8],
        expected: Option<i64>,
    ) -> Result<bool>;
}

pub type DocSnapshotStoreRef = Arc<dyn DocSnapshotStore>;
