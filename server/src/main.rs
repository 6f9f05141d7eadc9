// snapfold - host process for the document compaction engine.
//
// Bootstrap, CLI commands and shutdown handling only. Storage, resolution
// and compaction live in snapfold-core.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, bail};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use clap::{Args, Parser, Subcommand};
use dotenvy::{Error as DotenvError, dotenv, from_filename};
use mimalloc::MiMalloc;
use snapfold_core::{config::AppConfig, db::Database, ids::DocumentGroupKey};
use snapfold_server::{
    build_state,
    observability::{self, LogTarget},
    spawn_background_tasks, state,
};
use tracing::{info, warn};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser, Debug)]
#[command(author, version, about = "snapfold document compaction host", long_about = None)]
struct Cli {
    /// Config file to load instead of the default search path
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the compaction scheduler until SIGINT/SIGTERM
    Serve,
    /// Run a single compaction pass and print its report
    Compact,
    /// Apply database migrations and exit
    Migrate,
    /// Append one update to a document group
    Append(AppendArgs),
    /// Print or write the current state of a document group
    Resolve(ResolveArgs),
    /// List document groups with pending updates
    Status,
}

#[derive(Args, Debug)]
struct GroupArgs {
    #[arg(long = "workspace-id", value_name = "ID")]
    workspace_id: String,
    #[arg(long = "doc-id", value_name = "ID")]
    doc_id: String,
}

impl GroupArgs {
    fn key(&self) -> DocumentGroupKey {
        DocumentGroupKey::new(self.workspace_id.as_str(), self.doc_id.as_str())
    }
}

#[derive(Args, Debug)]
struct AppendArgs {
    #[command(flatten)]
    group: GroupArgs,
    /// Read the raw update from a file
    #[arg(long, value_name = "PATH", conflicts_with = "base64", required_unless_present = "base64")]
    file: Option<PathBuf>,
    /// Base64-encoded update
    #[arg(long, value_name = "DATA")]
    base64: Option<String>,
}

#[derive(Args, Debug)]
struct ResolveArgs {
    #[command(flatten)]
    group: GroupArgs,
    /// Write raw state bytes here instead of printing base64
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_status = load_env_file();
    observability::init_tracing(&LogTarget::from_env())?;
    report_env_status(&env_status);

    let cli = Cli::parse();
    let config = AppConfig::load_with(cli.config.clone())?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => run_serve(config).await,
        Command::Compact => run_compact(config).await,
        Command::Migrate => run_migrate(config).await,
        Command::Append(args) => run_append(config, args).await,
        Command::Resolve(args) => run_resolve(config, args).await,
        Command::Status => run_status(config).await,
    }
}

async fn run_serve(config: AppConfig) -> anyhow::Result<()> {
    info!(
        database_backend = ?config.database_backend,
        database_path = %config.database_path,
        database_max_connections = config.database_max_connections,
        compaction_interval_ms = config.compaction.interval_ms,
        compaction_enabled = config.compaction.enabled,
        "Starting snapfold"
    );
    let database = Database::connect(&config).await?;
    let state = build_state(&database, &config);
    let compactor = spawn_background_tasks(&state);

    shutdown_signal().await?;
    info!("shutdown signal received");

    if let Some(compactor) = compactor {
        let grace = config.compaction.shutdown_grace();
        if !compactor.shutdown(grace).await {
            warn!("in-flight compaction abandoned; pending updates remain for the next run");
        }
    }
    database.close().await;
    Ok(())
}

async fn run_compact(config: AppConfig) -> anyhow::Result<()> {
    let database = Database::connect(&config).await?;
    let state = build_state(&database, &config);
    let report = state.document_store.compact_now().await;
    println!(
        "groups={} compacted={} failed={} superseded={} updates_folded={}",
        report.groups, report.compacted, report.failed, report.superseded, report.updates_folded
    );
    database.close().await;
    if report.failed > 0 {
        bail!("{} document group(s) failed to compact", report.failed);
    }
    Ok(())
}

async fn run_migrate(config: AppConfig) -> anyhow::Result<()> {
    let database = Database::connect(&config).await?;
    database.close().await;
    info!("database migrations applied");
    println!("migrations applied");
    Ok(())
}

async fn run_append(config: AppConfig, args: AppendArgs) -> anyhow::Result<()> {
    let update = match (&args.file, &args.base64) {
        (Some(path), _) => {
            fs::read(path).with_context(|| format!("read update from {}", path.display()))?
        }
        (None, Some(data)) => BASE64
            .decode(data.trim())
            .context("decode base64 update")?,
        (None, None) => bail!("either --file or --base64 is required"),
    };

    let database = Database::connect(&config).await?;
    let state = build_state(&database, &config);
    let key = args.group.key();
    let record = state.document_store.append_update(&key, &update).await?;
    println!("appended update {} to {key} ({} bytes)", record.id, update.len());
    database.close().await;
    Ok(())
}

async fn run_resolve(config: AppConfig, args: ResolveArgs) -> anyhow::Result<()> {
    let database = Database::connect(&config).await?;
    let state = build_state(&database, &config);
    let key = args.group.key();
    let resolved = state.document_store.resolve_state(&key).await?;
    database.close().await;

    match args.output {
        Some(path) => {
            write_output(&path, &resolved)?;
            println!("wrote {} bytes to {}", resolved.len(), path.display());
        }
        None => println!("{}", BASE64.encode(&resolved)),
    }
    Ok(())
}

async fn run_status(config: AppConfig) -> anyhow::Result<()> {
    let database = Database::connect(&config).await?;
    let state = build_state(&database, &config);
    let summary = state::pending_summary(&state).await?;
    database.close().await;

    if summary.is_empty() {
        println!("no pending updates");
        return Ok(());
    }
    for group in summary {
        println!("{}\t{}", group.key, group.pending);
    }
    Ok(())
}

fn write_output(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("create output directory {}", parent.display()))?;
    }
    fs::write(path, bytes).with_context(|| format!("write state to {}", path.display()))
}

enum EnvLoadStatus {
    Loaded(PathBuf),
    NotFound,
    Failed(DotenvError),
}

fn load_env_file() -> EnvLoadStatus {
    if let Ok(env_file) = std::env::var("SNAPFOLD_ENV_FILE") {
        let trimmed = env_file.trim();
        if !trimmed.is_empty() {
            let path = PathBuf::from(trimmed);
            return match from_filename(&path) {
                Ok(_) => EnvLoadStatus::Loaded(make_relative(&path).unwrap_or(path)),
                Err(err) => EnvLoadStatus::Failed(err),
            };
        }
    }

    match dotenv() {
        Ok(path) => EnvLoadStatus::Loaded(make_relative(&path).unwrap_or(path)),
        Err(DotenvError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
            EnvLoadStatus::NotFound
        }
        Err(err) => EnvLoadStatus::Failed(err),
    }
}

fn report_env_status(status: &EnvLoadStatus) {
    match status {
        EnvLoadStatus::Loaded(path) => {
            info!("Loaded environment variables from {}", path.display());
        }
        EnvLoadStatus::NotFound => {
            info!("No .env file found; using process environment only");
        }
        EnvLoadStatus::Failed(err) => {
            warn!("Failed to load .env file: {err:?}");
        }
    }
}

fn make_relative(path: &Path) -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    path.strip_prefix(&cwd).map(Path::to_path_buf).ok()
}

async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
        let mut int = signal(SignalKind::interrupt()).context("install SIGINT handler")?;

        tokio::select! {
            _ = term.recv() => {},
            _ = int.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("listen for ctrl-c")?;
    }

    Ok(())
}
