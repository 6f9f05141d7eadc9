use anyhow::{Context, Result};

use crate::{
    doc::DocMergerRef, doc_snapshot_store::DocSnapshotStoreRef, doc_update_log::DocUpdateLogRef,
    ids::DocumentGroupKey,
};

/// Rebuilds the current state of a group from committed storage on every call.
///
/// Pending updates are listed before the snapshot is loaded. Compaction writes
/// the snapshot before deleting the records it folded, so a reader can never
/// pair an old snapshot with a log that already lost those records; the other
/// interleavings only re-apply updates the snapshot already reflects.
#[derive(Clone)]
pub struct DocStateResolver {
    update_log: DocUpdateLogRef,
    snapshots: DocSnapshotStoreRef,
    merger: DocMergerRef,
}

impl DocStateResolver {
    pub fn new(
        update_log: DocUpdateLogRef,
        snapshots: DocSnapshotStoreRef,
        merger: DocMergerRef,
    ) -> Self {
        Self {
            update_log,
            snapshots,
            merger,
        }
    }

    pub async fn resolve(&self, key: &DocumentGroupKey) -> Result<Vec<u8>> {
        let pending = self.update_log.list_pending(key).await?;
        let snapshot = self.snapshots.get(key).await?;

        let updates: Vec<&[u8]> = pending.iter().map(|log| log.update.as_slice()).collect();
        let base = snapshot.as_ref().map(|snapshot| snapshot.state.as_slice());
        self.merger
            .fold(base, &updates)
            .with_context(|| format!("merge pending updates for {key}"))
    }
}
