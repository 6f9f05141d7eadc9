use snapfold_core::{config::AppConfig, db::Database};
use tempfile::TempDir;
use yrs::{Doc, ReadTxn, StateVector, Text, Transact};

use crate::state::{AppState, build_state};

pub(crate) async fn setup_state<F>(configure: F) -> (TempDir, AppState)
where
    F: FnOnce(&mut AppConfig),
{
    let temp_dir = tempfile::tempdir().expect("create temp dir");
    let mut config = AppConfig::default();
    let db_path = temp_dir.path().join("test.db");
    config.database_path = db_path.to_string_lossy().into_owned();
    configure(&mut config);

    let database = Database::connect(&config).await.expect("connect database");
    let state = build_state(&database, &config);
    (temp_dir, state)
}

/// Incremental Yjs updates appending each chunk to a shared text.
pub(crate) fn text_updates(chunks: &[&str]) -> Vec<Vec<u8>> {
    let doc = Doc::with_client_id(1);
    let text = doc.get_or_insert_text("content");
    let mut state_vector = StateVector::default();
    let mut updates = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        let mut txn = doc.transact_mut();
        let len = text.len(&txn);
        text.insert(&mut txn, len, chunk);
        updates.push(txn.encode_state_as_update_v1(&state_vector));
        state_vector = txn.state_vector();
    }
    updates
}
