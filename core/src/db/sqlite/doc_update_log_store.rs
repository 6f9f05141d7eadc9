use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{QueryBuilder, Row, Sqlite, Transaction, sqlite::SqliteRow};

use super::SqlitePool;
use crate::doc_update_log::{DocUpdateLog, DocUpdateRecord};
use crate::ids::DocumentGroupKey;

// SQLite refuses statements with more than 32766 bound parameters.
const DELETE_CHUNK_SIZE: usize = 500;

pub struct SqliteDocUpdateLogStore {
    pool: SqlitePool,
}

impl SqliteDocUpdateLogStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn now_millis() -> i64 {
        Utc::now().timestamp_millis()
    }

    fn row_to_record(row: SqliteRow) -> Result<DocUpdateRecord> {
        Ok(DocUpdateRecord {
            id: row.try_get("id")?,
            key: DocumentGroupKey {
                workspace_id: row.try_get("workspace_id")?,
                doc_id: row.try_get("doc_id")?,
            },
            update: row.try_get("update_blob")?,
            created_at: row.try_get("created_at")?,
        })
    }

    async fn insert_update(
        tx: &mut Transaction<'_, Sqlite>,
        key: &DocumentGroupKey,
        update: &[u8],
        timestamp: i64,
    ) -> Result<DocUpdateRecord> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO doc_updates (workspace_id, doc_id, update_blob, created_at)
             VALUES (?, ?, ?, ?)
             RETURNING id",
        )
        .bind(&key.workspace_id)
        .bind(&key.doc_id)
        .bind(update)
        .bind(timestamp)
        .fetch_one(tx.as_mut())
        .await?;

        Ok(DocUpdateRecord {
            id,
            key: key.clone(),
            update: update.to_vec(),
            created_at: timestamp,
        })
    }
}

#[async_trait]
impl DocUpdateLog for SqliteDocUpdateLogStore {
    async fn append(&self, key: &DocumentGroupKey, update: &[u8]) -> Result<DocUpdateRecord> {
        let mut tx = self.pool.begin().await?;
        let record = Self::insert_update(&mut tx, key, update, Self::now_millis())
            .await
            .with_context(|| format!("append doc update for {key}"))?;
        tx.commit().await?;
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

        let timestamp = Self::now_millis();
        let mut tx = self.pool.begin().await?;
        let mut records = Vec::with_capacity(updates.len());
        for update in updates {
            let record = Self::insert_update(&mut tx, key, update, timestamp)
                .await
                .with_context(|| format!("append doc update batch for {key}"))?;
            records.push(record);
        }
        tx.commit().await?;
        Ok(records)
    }

    async fn list_pending(&self, key: &DocumentGroupKey) -> Result<Vec<DocUpdateRecord>> {
        let rows = sqlx::query(
            "SELECT id, workspace_id, doc_id, update_blob, created_at
             FROM doc_updates
             WHERE workspace_id = ? AND doc_id = ?
             ORDER BY id ASC",
        )
        .bind(&key.workspace_id)
        .bind(&key.doc_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("list pending doc updates for {key}"))?;

        rows.into_iter().map(Self::row_to_record).collect()
    }

    async fn delete(&self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for chunk in ids.chunks(DELETE_CHUNK_SIZE) {
            let mut builder = QueryBuilder::<Sqlite>::new("DELETE FROM doc_updates WHERE id IN (");
            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");
            builder
                .build()
                .execute(tx.as_mut())
                .await
                .context("delete consumed doc updates")?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn pending_groups(&self) -> Result<Vec<DocumentGroupKey>> {
        let rows = sqlx::query(
            "SELECT DISTINCT workspace_id, doc_id
             FROM doc_updates
             ORDER BY workspace_id, doc_id",
        )
        .fetch_all(&self.pool)
        .await
        .context("list document groups with pending updates")?;

        let mut groups = Vec::with_capacity(rows.len());
        for row in rows {
            groups.push(DocumentGroupKey {
                workspace_id: row.try_get("workspace_id")?,
                doc_id: row.try_get("doc_id")?,
            });
        }
        Ok(groups)
    }
}
