use std::{env, fs, path::PathBuf, time::Duration};

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    Sqlite,
    Memory,
}

impl DatabaseBackend {
    fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "memory" => Ok(Self::Memory),
            other => Err(anyhow!("unknown database backend: {other}")),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Period of the compaction timer, in milliseconds.
    pub interval_ms: u64,
    /// Whether the host process starts the scheduler at all.
    pub enabled: bool,
    pub fetch_concurrency: usize,
    pub apply_concurrency: usize,
    /// How long shutdown waits for an in-flight pass before abandoning it.
    pub shutdown_grace_ms: u64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            interval_ms: 3_000,
            enabled: true,
            fetch_concurrency: 8,
            apply_concurrency: 8,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl CompactionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_database_backend")]
    pub database_backend: DatabaseBackend,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_database_max_connections")]
    pub database_max_connections: u32,
    /// How long a SQLite connection waits on a lock held by another writer,
    /// such as a `compact` run next to `serve`.
    #[serde(default = "default_database_busy_timeout_ms")]
    pub database_busy_timeout_ms: u64,
    #[serde(default)]
    pub compaction: CompactionConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_backend: default_database_backend(),
            database_path: default_database_path(),
            database_max_connections: default_database_max_connections(),
            database_busy_timeout_ms: default_database_busy_timeout_ms(),
            compaction: CompactionConfig::default(),
        }
    }
}

impl AppConfig {
    const CONFIG_ENV: &'static str = "SNAPFOLD_CONFIG_FILE";
    const DATABASE_BACKEND_ENV: &'static str = "SNAPFOLD_DATABASE_BACKEND";
    const DATABASE_PATH_ENV: &'static str = "SNAPFOLD_DATABASE_PATH";
    const DATABASE_MAX_CONNECTIONS_ENV: &'static str = "SNAPFOLD_DATABASE_MAX_CONNECTIONS";
    const DATABASE_BUSY_TIMEOUT_ENV: &'static str = "SNAPFOLD_DATABASE_BUSY_TIMEOUT_MS";
    const COMPACTION_INTERVAL_ENV: &'static str = "SNAPFOLD_COMPACTION_INTERVAL_MS";
    const COMPACTION_ENABLED_ENV: &'static str = "SNAPFOLD_COMPACTION_ENABLED";

    /// Load configuration from defaults layered with optional config files and
    /// environment variables.
    pub fn load() -> Result<Self> {
        Self::load_with(None)
    }

    pub fn load_with(config_path: Option<PathBuf>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = Self::resolve_config_path(config_path)? {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("failed to read config file: {}", path.display()))?;
            config = Self::from_toml(&contents)
                .with_context(|| format!("invalid config file: {}", path.display()))?;
        }

        config.apply_overrides(|name| env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(Into::into)
    }

    /// Apply `SNAPFOLD_*` overrides using `lookup` to read variables.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(Self::DATABASE_BACKEND_ENV) {
            self.database_backend = DatabaseBackend::parse(&value)?;
        }

        if let Some(path) = lookup(Self::DATABASE_PATH_ENV) {
            self.database_path = path;
        }

        if let Some(value) = lookup(Self::DATABASE_MAX_CONNECTIONS_ENV) {
            self.database_max_connections = value.trim().parse().with_context(|| {
                format!("invalid {name}", name = Self::DATABASE_MAX_CONNECTIONS_ENV)
            })?;
        }

        if let Some(value) = lookup(Self::DATABASE_BUSY_TIMEOUT_ENV) {
            self.database_busy_timeout_ms = value.trim().parse().with_context(|| {
                format!("invalid {name}", name = Self::DATABASE_BUSY_TIMEOUT_ENV)
            })?;
        }

        if let Some(value) = lookup(Self::COMPACTION_INTERVAL_ENV) {
            self.compaction.interval_ms = value
                .trim()
                .parse()
                .with_context(|| format!("invalid {name}", name = Self::COMPACTION_INTERVAL_ENV))?;
        }

        if let Some(value) = lookup(Self::COMPACTION_ENABLED_ENV) {
            self.compaction.enabled = parse_bool(&value).ok_or_else(|| {
                anyhow!("invalid {name}: {value}", name = Self::COMPACTION_ENABLED_ENV)
            })?;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.compaction.interval_ms == 0 {
            bail!("compaction interval must be greater than zero");
        }
        Ok(())
    }

    pub fn database_busy_timeout(&self) -> Duration {
        Duration::from_millis(self.database_busy_timeout_ms)
    }

    fn resolve_config_path(explicit: Option<PathBuf>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit {
            return Self::validate_path(path);
        }

        if let Ok(path) = env::var(Self::CONFIG_ENV) {
            return Self::validate_path(PathBuf::from(path));
        }

        let mut candidates = vec![PathBuf::from("snapfold.toml")];
        if let Some(dir) = Self::default_config_dir() {
            candidates.push(dir.join("config.toml"));
        }

        Ok(candidates.into_iter().find(|candidate| candidate.exists()))
    }

    fn validate_path(path: PathBuf) -> Result<Option<PathBuf>> {
        if path.exists() {
            Ok(Some(path))
        } else {
            Err(anyhow!(
                "configuration file does not exist: {}",
                path.display()
            ))
        }
    }

    fn default_config_dir() -> Option<PathBuf> {
        home_dir().map(|home| home.join(".snapfold"))
    }
}

fn default_database_backend() -> DatabaseBackend {
    DatabaseBackend::Sqlite
}

fn default_database_path() -> String {
    "./data/snapfold.db".to_owned()
}

fn default_database_max_connections() -> u32 {
    4
}

fn default_database_busy_timeout_ms() -> u64 {
    5_000
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn home_dir() -> Option<PathBuf> {
    if let Some(path) = env::var_os("HOME") {
        return Some(PathBuf::from(path));
    }

    if let Some(path) = env::var_os("USERPROFILE") {
        return Some(PathBuf::from(path));
    }

    None
}
