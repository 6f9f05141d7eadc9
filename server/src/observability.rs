use std::{fs, path::PathBuf, sync::OnceLock};

use anyhow::{Context, Result};
use tracing_appender::non_blocking;
use tracing_subscriber::EnvFilter;

const LOG_FILE_PREFIX: &str = "snapfold.log";

static TRACING_GUARD: OnceLock<non_blocking::WorkerGuard> = OnceLock::new();

/// Where structured logs are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    Stdout,
    /// Daily rolling file under the directory.
    RollingFile(PathBuf),
}

impl LogTarget {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let log_to_stdout = lookup("SNAPFOLD_LOG_TO_STDOUT")
            .map(|value| !value.trim().is_empty() && value.trim() != "0")
            .unwrap_or(false);
        if log_to_stdout {
            return LogTarget::Stdout;
        }

        let dir = lookup("SNAPFOLD_LOG_DIR")
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| "logs".to_owned());
        LogTarget::RollingFile(PathBuf::from(dir))
    }
}

/// Install the global JSON subscriber. `RUST_LOG` controls the filter and
/// defaults to `info`. Calling this twice keeps the first subscriber.
pub fn init_tracing(target: &LogTarget) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match target {
        LogTarget::Stdout => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_ansi(false)
                .json()
                .with_writer(std::io::stdout)
                .try_init();
        }
        LogTarget::RollingFile(dir) => {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log dir '{}'", dir.display()))?;
            let file_appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = non_blocking(file_appender);

            if tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_ansi(false)
                .json()
                .with_writer(writer)
                .try_init()
                .is_ok()
            {
                let _ = TRACING_GUARD.set(guard);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn target_for(vars: &[(&str, &str)]) -> LogTarget {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        LogTarget::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_to_rolling_file_in_logs_dir() {
        assert_eq!(
            target_for(&[]),
            LogTarget::RollingFile(PathBuf::from("logs"))
        );
    }

    #[test]
    fn stdout_flag_ignores_zero_and_blank() {
        assert_eq!(
            target_for(&[("SNAPFOLD_LOG_TO_STDOUT", "1")]),
            LogTarget::Stdout
        );
        assert_eq!(
            target_for(&[("SNAPFOLD_LOG_TO_STDOUT", "0"), ("SNAPFOLD_LOG_DIR", "/tmp/sf")]),
            LogTarget::RollingFile(PathBuf::from("/tmp/sf"))
        );
        assert_eq!(
            target_for(&[("SNAPFOLD_LOG_TO_STDOUT", "  ")]),
            LogTarget::RollingFile(PathBuf::from("logs"))
        );
    }

    #[test]
    fn rolling_file_target_creates_directory() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let log_dir = dir.path().join("nested").join("logs");
        init_tracing(&LogTarget::RollingFile(log_dir.clone())).expect("init tracing");
        assert!(log_dir.is_dir());
    }
}
