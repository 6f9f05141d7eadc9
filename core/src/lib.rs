pub mod compaction;
pub mod config;
pub mod db;
pub mod doc;
pub mod doc_snapshot_store;
pub mod doc_store;
pub mod doc_update_log;
pub mod ids;
pub mod resolver;
pub mod scheduler;

#[cfg(test)]
mod test_support;

pub use compaction::{CompactionReport, DocCompactionJob};
pub use config::AppConfig;
pub use db::Database;
pub use doc::{DocMerger, DocMergerRef, YrsMerger};
pub use doc_store::DocumentStore;
pub use ids::DocumentGroupKey;
pub use scheduler::{CompactionScheduler, SchedulerHandle, TickOutcome};
