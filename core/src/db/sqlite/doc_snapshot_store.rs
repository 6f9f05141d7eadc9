use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;

use super::SqlitePool;
use crate::doc_snapshot_store::{DocSnapshotStore, DocumentSnapshot};
use crate::ids::DocumentGroupKey;

pub struct SqliteDocSnapshotStore {
    pool: SqlitePool,
}

impl SqliteDocSnapshotStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DocSnapshotStore for SqliteDocSnapshotStore {
    async fn get(&self, key: &DocumentGroupKey) -> Result<Option<DocumentSnapshot>> {
        let row = sqlx::query(
            "SELECT state, updated_at, version FROM doc_snapshots
             WHERE workspace_id = ? AND doc_id = ?",
        )
        .bind(&key.workspace_id)
        .bind(&key.doc_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("load doc snapshot for {key}"))?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(DocumentSnapshot {
            key: key.clone(),
            state: row.try_get("state")?,
            updated_at: row.try_get("updated_at")?,
            version: row.try_get("version")?,
        }))
    }

    async fn put(&self, key: &DocumentGroupKey, state: &[u8]) -> Result<()> {
        sqlx::query(
            "INSERT INTO doc_snapshots (workspace_id, doc_id, state, updated_at, version)
             VALUES (?, ?, ?, ?, 1)
             ON CONFLICT (workspace_id, doc_id)
             DO UPDATE SET state = excluded.state, updated_at = excluded.updated_at,
                           version = doc_snapshots.version + 1",
        )
        .bind(&key.workspace_id)
        .bind(&key.doc_id)
        .bind(state)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await
        .with_context(|| format!("write doc snapshot for {key}"))?;
        Ok(())
    }

    async fn put_if_version(
        &self,
        key: &DocumentGroupKey,
        state: &[u8],
        expected: Option<i64>,
    ) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let result = match expected {
            None => {
                sqlx::query(
                    "INSERT INTO doc_snapshots (workspace_id, doc_id, state, updated_at, version)
                     VALUES (?, ?, ?, ?, 1)
                     ON CONFLICT (workspace_id, doc_id) DO NOTHING",
                )
                .bind(&key.workspace_id)
                .bind(&key.doc_id)
                .bind(state)
                .bind(now)
                .execute(&self.pool)
                .await
            }
            Some(version) => {
                sqlx::query(
                    "UPDATE doc_snapshots
                     SET state = ?, updated_at = ?, version = version + 1
                     WHERE workspace_id = ? AND doc_id = ? AND version = ?",
                )
                .bind(state)
                .bind(now)
                .bind(&key.workspace_id)
                .bind(&key.doc_id)
                .bind(version)
                .execute(&self.pool)
                .await
            }
        }
        .with_context(|| format!("write doc snapshot for {key}"))?;

        Ok(result.rows_affected() == 1)
    }
}
