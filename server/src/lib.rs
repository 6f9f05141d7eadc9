pub mod observability;
pub mod state;

pub use state::{AppState, PendingGroup, build_state, spawn_background_tasks};

#[cfg(test)]
mod test_support;
