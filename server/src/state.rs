use std::sync::Arc;

use anyhow::Result as AnyResult;
use snapfold_core::{
    config::{AppConfig, CompactionConfig},
    db::Database,
    doc::YrsMerger,
    doc_store::DocumentStore,
    ids::DocumentGroupKey,
    scheduler::SchedulerHandle,
};
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub database: Database,
    pub document_store: DocumentStore,
    pub config: Arc<AppConfig>,
}

/// Pending record count for one document group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingGroup {
    pub key: DocumentGroupKey,
    pub pending: usize,
}

pub fn build_state(database: &Database, app_config: &AppConfig) -> AppState {
    let document_store = DocumentStore::from_database(database, YrsMerger::shared())
        .with_compaction_config(&app_config.compaction);

    AppState {
        database: database.clone(),
        document_store,
        config: Arc::new(app_config.clone()),
    }
}

/// Start the doc compactor unless compaction is disabled.
pub fn spawn_background_tasks(state: &AppState) -> Option<SchedulerHandle> {
    let compaction = &state.config.compaction;
    if !compaction.enabled {
        info!("doc compaction disabled; updates will accumulate until compacted manually");
        return None;
    }

    Some(start_doc_compactor(&state.document_store, compaction))
}

fn start_doc_compactor(document_store: &DocumentStore, config: &CompactionConfig) -> SchedulerHandle {
    document_store.scheduler(config.interval()).start()
}

pub async fn pending_summary(state: &AppState) -> AnyResult<Vec<PendingGroup>> {
    let store = &state.document_store;
    let mut summary = Vec::new();
    for key in store.pending_groups().await? {
        let pending = store.pending_updates(&key).await?.len();
        if pending > 0 {
            summary.push(PendingGroup { key, pending });
        }
    }
    Ok(summary)
}
