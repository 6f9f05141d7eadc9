use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::ids::DocumentGroupKey;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocUpdateRecord {
    /// Creation-order key; strictly increasing within a log and never reused.
    pub id: i64,
    pub key: DocumentGroupKey,
    pub update: Vec<u8>,
    pub created_at: i64,
}

/// Append-only store of incremental document updates.
#[async_trait]
pub trait DocUpdateLog: Send + Sync {
    async fn append(&self, key: &DocumentGroupKey, update: &[u8]) -> Result<DocUpdateRecord>;

    /// Append a batch atomically, preserving slice order.
    async fn append_many(
        &self,
        key: &DocumentGroupKey,
        updates: &[Vec<u8>],
    ) -> Result<Vec<DocUpdateRecord>>;

    /// Committed records for `key` in ascending creation order.
    async fn list_pending(&self, key: &DocumentGroupKey) -> Result<Vec<DocUpdateRecord>>;

    /// Delete exactly `ids`. Unknown ids are ignored; an empty slice is a no-op.
    async fn delete(&self, ids: &[i64]) -> Result<()>;

    /// Every group with at least one pending record, from a single query.
    async fn pending_groups(&self) -> Result<Vec<DocumentGroupKey>>;
}

pub type DocUpdateLogRef = Arc<dyn DocUpdateLog>;
