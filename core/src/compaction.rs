use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use crossbeam_channel::unbounded;
use futures_util::stream::{self, StreamExt};
use rayon::prelude::*;
use tokio::task::spawn_blocking;
use tracing::{debug, info, warn};

use crate::{
    doc::{DocMerger, DocMergerRef},
    doc_snapshot_store::{DocSnapshotStoreRef, DocumentSnapshot},
    doc_update_log::{DocUpdateLogRef, DocUpdateRecord},
    ids::DocumentGroupKey,
    scheduler::CompactionTask,
};

pub const DEFAULT_FETCH_CONCURRENCY: usize = 8;
pub const DEFAULT_APPLY_CONCURRENCY: usize = 8;

/// Everything read for one group before folding.
#[derive(Debug, Clone)]
pub struct CompactionSource {
    pub key: DocumentGroupKey,
    pub base: Option<DocumentSnapshot>,
    pub logs: Vec<DocUpdateRecord>,
}

/// A folded snapshot plus the exact record ids it consumed.
#[derive(Debug, Clone)]
pub struct CompactionPlan {
    pub key: DocumentGroupKey,
    pub snapshot: Vec<u8>,
    pub consumed_ids: Vec<i64>,
    /// Version of the snapshot the fold started from; `None` when there was none.
    pub base_version: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionReport {
    /// Groups that had pending updates when the pass started.
    pub groups: usize,
    pub compacted: usize,
    pub failed: usize,
    /// Groups whose snapshot was rewritten by another pass while this one
    /// was folding; their records stay pending.
    pub superseded: usize,
    pub updates_folded: usize,
}

#[derive(Clone)]
pub struct DocCompactionJob {
    update_log: DocUpdateLogRef,
    snapshots: DocSnapshotStoreRef,
    merger: DocMergerRef,
    fetch_concurrency: usize,
    apply_concurrency: usize,
}

impl DocCompactionJob {
    pub fn new(
        update_log: DocUpdateLogRef,
        snapshots: DocSnapshotStoreRef,
        merger: DocMergerRef,
    ) -> Self {
        Self {
            update_log,
            snapshots,
            merger,
            fetch_concurrency: DEFAULT_FETCH_CONCURRENCY,
            apply_concurrency: DEFAULT_APPLY_CONCURRENCY,
        }
    }

    pub fn with_concurrency(mut self, fetch: usize, apply: usize) -> Self {
        self.fetch_concurrency = fetch.max(1);
        self.apply_concurrency = apply.max(1);
        self
    }

    /// Run one pass over every group with pending updates.
    ///
    /// Never fails: per-group errors are logged and counted, and a failed
    /// group keeps its records for the next pass.
    pub async fn run(&self) -> CompactionReport {
        let targets = match self.update_log.pending_groups().await {
            Ok(targets) => targets,
            Err(err) => {
                warn!(error = %err, "failed to list documents requiring compaction");
                return CompactionReport::default();
            }
        };

        if targets.is_empty() {
            debug!("no pending document updates to compact");
            return CompactionReport::default();
        }

        let groups = targets.len();
        let failed = Arc::new(AtomicUsize::new(0));
        let (job_tx, job_rx) = unbounded();

        stream::iter(targets)
            .for_each_concurrent(Some(self.fetch_concurrency), |key| {
                let job_tx = job_tx.clone();
                let failed = failed.clone();
                async move {
                    match self.prepare(&key).await {
                        Ok(Some(source)) => {
                            let _ = job_tx.send(source);
                        }
                        Ok(None) => {}
                        Err(err) => {
                            failed.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                workspace_id = %key.workspace_id,
                                doc_id = %key.doc_id,
                                error = %err,
                                "failed to prepare doc compaction job",
                            );
                        }
                    }
                }
            })
            .await;
        drop(job_tx);

        let merger = self.merger.clone();
        let fold_failed = failed.clone();
        let plans = match spawn_blocking(move || {
            job_rx
                .into_iter()
                .par_bridge()
                .filter_map(|source| {
                    let key = source.key.clone();
                    match Self::compute_plan_isolated(merger.as_ref(), source) {
                        Ok(plan) => Some(plan),
                        Err(err) => {
                            fold_failed.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                workspace_id = %key.workspace_id,
                                doc_id = %key.doc_id,
                                error = %err,
                                "failed to merge doc update logs",
                            );
                            None
                        }
                    }
                })
                .collect::<Vec<_>>()
        })
        .await
        {
            Ok(plans) => plans,
            Err(err) => {
                warn!(error = %err, "doc compaction fold task aborted");
                return CompactionReport {
                    groups,
                    failed: groups,
                    ..CompactionReport::default()
                };
            }
        };

        let compacted = AtomicUsize::new(0);
        let superseded = AtomicUsize::new(0);
        let updates_folded = AtomicUsize::new(0);
        stream::iter(plans)
            .for_each_concurrent(Some(self.apply_concurrency), |plan| {
                let failed = failed.clone();
                let compacted = &compacted;
                let superseded = &superseded;
                let updates_folded = &updates_folded;
                async move {
                    let key = plan.key.clone();
                    let consumed = plan.consumed_ids.len();
                    match self.apply_plan(plan).await {
                        Ok(true) => {
                            compacted.fetch_add(1, Ordering::Relaxed);
                            updates_folded.fetch_add(consumed, Ordering::Relaxed);
                        }
                        Ok(false) => {
                            superseded.fetch_add(1, Ordering::Relaxed);
                            debug!(
                                workspace_id = %key.workspace_id,
                                doc_id = %key.doc_id,
                                "doc snapshot changed during fold; leaving updates for the next pass",
                            );
                        }
                        Err(err) => {
                            failed.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                workspace_id = %key.workspace_id,
                                doc_id = %key.doc_id,
                                error = %err,
                                "failed to compact document",
                            );
                        }
                    }
                }
            })
            .await;

        let report = CompactionReport {
            groups,
            compacted: compacted.into_inner(),
            failed: failed.load(Ordering::Relaxed),
            superseded: superseded.into_inner(),
            updates_folded: updates_folded.into_inner(),
        };
        info!(
            groups = report.groups,
            compacted = report.compacted,
            failed = report.failed,
            superseded = report.superseded,
            updates_folded = report.updates_folded,
            "doc compaction pass finished"
        );
        report
    }

    /// Read the pending set first, then the base snapshot. The ids read here
    /// are the only ones the pass will ever delete for this group.
    async fn prepare(&self, key: &DocumentGroupKey) -> Result<Option<CompactionSource>> {
        let logs = self.update_log.list_pending(key).await?;
        if logs.is_empty() {
            return Ok(None);
        }
        let base = self.snapshots.get(key).await?;

        Ok(Some(CompactionSource {
            key: key.clone(),
            base,
            logs,
        }))
    }

    pub fn compute_plan(
        merger: &dyn DocMerger,
        source: CompactionSource,
    ) -> Result<CompactionPlan> {
        let CompactionSource { key, base, logs } = source;
        let updates: Vec<&[u8]> = logs.iter().map(|log| log.update.as_slice()).collect();
        let snapshot = merger
            .fold(base.as_ref().map(|base| base.state.as_slice()), &updates)
            .with_context(|| format!("merge doc updates for {key} during compaction"))?;

        Ok(CompactionPlan {
            key,
            snapshot,
            consumed_ids: logs.iter().map(|log| log.id).collect(),
            base_version: base.map(|base| base.version),
        })
    }

    fn compute_plan_isolated(
        merger: &dyn DocMerger,
        source: CompactionSource,
    ) -> Result<CompactionPlan> {
        catch_unwind(AssertUnwindSafe(|| Self::compute_plan(merger, source)))
            .unwrap_or_else(|_| Err(anyhow!("doc merger panicked")))
    }

    /// Durable snapshot write first, then deletion of exactly the consumed ids.
    ///
    /// The write only lands if the snapshot still has the version the fold
    /// started from. Returns `false` without deleting anything otherwise.
    async fn apply_plan(&self, plan: CompactionPlan) -> Result<bool> {
        let CompactionPlan {
            key,
            snapshot,
            consumed_ids,
            base_version,
        } = plan;

        if !self
            .snapshots
            .put_if_version(&key, &snapshot, base_version)
            .await?
        {
            return Ok(false);
        }
        self.update_log
            .delete(&consumed_ids)
            .await
            .with_context(|| format!("retire {} folded updates for {key}", consumed_ids.len()))?;
        Ok(true)
    }
}

#[async_trait]
impl CompactionTask for DocCompactionJob {
    async fn run_pass(&self) {
        self.run().await;
    }
}
