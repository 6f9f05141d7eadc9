use sqlx::{Pool, Sqlite};

pub mod doc_snapshot_store;
pub mod doc_update_log_store;

pub type SqlitePool = Pool<Sqlite>;
