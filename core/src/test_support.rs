use tempfile::TempDir;

use crate::{config::AppConfig, db::Database};

pub(crate) async fn sqlite_database() -> (TempDir, Database) {
    let temp_dir = tempfile::tempdir().expect("create temp dir");
    let mut config = AppConfig::default();
    let db_path = temp_dir.path().join("test.db");
    config.database_path = db_path.to_string_lossy().into_owned();

    let database = Database::connect(&config).await.expect("connect database");
    (temp_dir, database)
}
