use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};

use crate::{
    compaction::{
        CompactionReport, DEFAULT_APPLY_CONCURRENCY, DEFAULT_FETCH_CONCURRENCY, DocCompactionJob,
    },
    config::CompactionConfig,
    db::Database,
    doc::DocMergerRef,
    doc_snapshot_store::DocSnapshotStoreRef,
    doc_update_log::{DocUpdateLogRef, DocUpdateRecord},
    ids::DocumentGroupKey,
    resolver::DocStateResolver,
    scheduler::{CompactionGate, CompactionScheduler},
};

/// Entry point for collaborators: append updates, resolve state, and drive
/// compaction over one pair of storage handles.
#[derive(Clone)]
pub struct DocumentStore {
    update_log: DocUpdateLogRef,
    snapshots: DocSnapshotStoreRef,
    merger: DocMergerRef,
    resolver: DocStateResolver,
    gate: Arc<CompactionGate>,
    fetch_concurrency: usize,
    apply_concurrency: usize,
}

impl DocumentStore {
    pub fn new(
        update_log: DocUpdateLogRef,
        snapshots: DocSnapshotStoreRef,
        merger: DocMergerRef,
    ) -> Self {
        let resolver = DocStateResolver::new(update_log.clone(), snapshots.clone(), merger.clone());
        Self {
            update_log,
            snapshots,
            merger,
            resolver,
            gate: CompactionGate::new(),
            fetch_concurrency: DEFAULT_FETCH_CONCURRENCY,
            apply_concurrency: DEFAULT_APPLY_CONCURRENCY,
        }
    }

    pub fn from_database(database: &Database, merger: DocMergerRef) -> Self {
        Self::new(database.update_log(), database.snapshots(), merger)
    }

    pub fn with_compaction_config(mut self, config: &CompactionConfig) -> Self {
        self.fetch_concurrency = config.fetch_concurrency.max(1);
        self.apply_concurrency = config.apply_concurrency.max(1);
        self
    }

    pub fn merger(&self) -> DocMergerRef {
        self.merger.clone()
    }

    pub async fn append_update(
        &self,
        key: &DocumentGroupKey,
        update: &[u8],
    ) -> Result<DocUpdateRecord> {
        self.update_log
            .append(key, update)
            .await
            .with_context(|| format!("append doc update for {key}"))
    }

    pub async fn append_updates(
        &self,
        key: &DocumentGroupKey,
        updates: &[Vec<u8>],
    ) -> Result<Vec<DocUpdateRecord>> {
        if updates.is_empty() {
            return Ok(Vec::new());
        }

        self.update_log
            .append_many(key, updates)
            .await
            .with_context(|| format!("append {} doc updates for {key}", updates.len()))
    }

    pub async fn resolve_state(&self, key: &DocumentGroupKey) -> Result<Vec<u8>> {
        self.resolver.resolve(key).await
    }

    /// Current state encoded relative to a remote state vector.
    pub async fn resolve_diff(
        &self,
        key: &DocumentGroupKey,
        state_vector: &[u8],
    ) -> Result<Vec<u8>> {
        let state = self.resolve_state(key).await?;
        self.merger
            .diff(&state, state_vector)
            .with_context(|| format!("encode doc diff for {key}"))
    }

    pub async fn pending_groups(&self) -> Result<Vec<DocumentGroupKey>> {
        self.update_log.pending_groups().await
    }

    pub async fn pending_updates(&self, key: &DocumentGroupKey) -> Result<Vec<DocUpdateRecord>> {
        self.update_log.list_pending(key).await
    }

    /// Single-flight gate shared by `compact_now` and every scheduler built
    /// from this store.
    pub fn compaction_gate(&self) -> Arc<CompactionGate> {
        self.gate.clone()
    }

    fn compaction_job(&self) -> DocCompactionJob {
        DocCompactionJob::new(
            self.update_log.clone(),
            self.snapshots.clone(),
            self.merger.clone(),
        )
        .with_concurrency(self.fetch_concurrency, self.apply_concurrency)
    }

    /// Run one pass now, after any pass already in flight has finished.
    pub async fn compact_now(&self) -> CompactionReport {
        let _guard = self.gate.acquire().await;
        self.compaction_job().run().await
    }

    pub fn scheduler(&self, interval: Duration) -> CompactionScheduler {
        CompactionScheduler::with_gate(
            Arc::new(self.compaction_job()),
            interval,
            self.gate.clone(),
        )
    }
}
