use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use sqlx::sqlite::{
    SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions,
    SqliteSynchronous,
};
use tracing::debug;

use self::{
    memory::{MemoryDocSnapshotStore, MemoryDocUpdateLog},
    sqlite::{
        SqlitePool, doc_snapshot_store::SqliteDocSnapshotStore,
        doc_update_log_store::SqliteDocUpdateLogStore,
    },
};
use crate::{
    config::{AppConfig, DatabaseBackend},
    doc_snapshot_store::DocSnapshotStoreRef,
    doc_update_log::DocUpdateLogRef,
};

pub mod memory;
pub mod sqlite;

/// Storage handles for one configured backend.
#[derive(Clone)]
pub struct Database {
    backend: DatabaseBackend,
    pool: Option<SqlitePool>,
    update_log: DocUpdateLogRef,
    snapshots: DocSnapshotStoreRef,
}

impl Database {
    pub async fn connect(config: &AppConfig) -> Result<Self> {
        match config.database_backend {
            DatabaseBackend::Sqlite => Self::connect_sqlite(config).await,
            DatabaseBackend::Memory => Ok(Self::in_memory()),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            backend: DatabaseBackend::Memory,
            pool: None,
            update_log: Arc::new(MemoryDocUpdateLog::new()),
            snapshots: Arc::new(MemoryDocSnapshotStore::new()),
        }
    }

    async fn connect_sqlite(config: &AppConfig) -> Result<Self> {
        let path = Self::resolve_db_path(&config.database_path)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory: {}", parent.display())
            })?;
        }

        let pool = Self::open_sqlite_pool(&path, config).await?;
        sqlx::migrate!("./migrations/sqlite")
            .run(&pool)
            .await
            .context("failed to apply doc state migrations")?;
        debug!(path = %path.display(), "doc state database ready");

        Ok(Self {
            backend: DatabaseBackend::Sqlite,
            update_log: Arc::new(SqliteDocUpdateLogStore::new(pool.clone())),
            snapshots: Arc::new(SqliteDocSnapshotStore::new(pool.clone())),
            pool: Some(pool),
        })
    }

    /// WAL so resolvers keep reading while a pass writes. Incremental
    /// auto-vacuum hands back pages freed by retired updates.
    async fn open_sqlite_pool(path: &Path, config: &AppConfig) -> Result<SqlitePool> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .auto_vacuum(SqliteAutoVacuum::Incremental)
            .busy_timeout(config.database_busy_timeout());

        SqlitePoolOptions::new()
            .max_connections(config.database_max_connections.max(1))
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open doc state database: {}", path.display()))
    }

    pub fn backend(&self) -> DatabaseBackend {
        self.backend
    }

    pub fn update_log(&self) -> DocUpdateLogRef {
        self.update_log.clone()
    }

    pub fn snapshots(&self) -> DocSnapshotStoreRef {
        self.snapshots.clone()
    }

    /// Close the connection pool, if any, waiting for in-use connections.
    pub async fn close(&self) {
        if let Some(pool) = &self.pool {
            pool.close().await;
        }
    }

    fn resolve_db_path(path: &str) -> Result<PathBuf> {
        let path = PathBuf::from(path);
        if path.is_absolute() {
            Ok(path)
        } else {
            let cwd = std::env::current_dir().context("failed to obtain current directory")?;
            Ok(cwd.join(path))
        }
    }
}
