//! Outbox CLI - Command line interface for the offline action queue.
//!
//! This tool queues actions against a remote HTTP service, shows what is
//! still pending, and drains the queue when the service is reachable.

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use outbox_common::ActionKind;
use outbox_storage::{FileStore, KeyValueStore, MemoryStore, SqliteStore};
use outbox_sync::{
    ConnectivityProbe, DrainOutcome, HttpProbe, HttpRemote, NetworkMonitor, SkipReason,
    StoreKind, SyncConfig, SyncEngine,
};

#[derive(Parser)]
#[command(name = "outbox")]
#[command(about = "Outbox - Offline action queue with background sync")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (default: <data-dir>/config.json).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the queue.
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Override the remote endpoint.
    #[arg(short, long, global = true)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue an action for delivery.
    Enqueue {
        /// Action kind: "create", "update", or "delete".
        #[arg(short, long)]
        kind: ActionKind,

        /// Target path, resolved against the endpoint.
        #[arg(short, long)]
        target: String,

        /// HTTP method used to deliver the action.
        #[arg(short, long, default_value = "POST")]
        method: String,

        /// JSON payload.
        #[arg(short, long)]
        payload: Option<String>,
    },

    /// List pending actions.
    List,

    /// Show sync status.
    Status,

    /// Drain the queue now.
    Sync,

    /// Discard all pending actions.
    Clear,

    /// Keep running, draining whenever connectivity returns.
    Watch,

    /// Generate shell completions.
    Completions {
        /// Target shell.
        shell: Shell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "outbox", &mut std::io::stdout());
        return Ok(());
    }

    let data_dir = match &cli.data_dir {
        Some(dir) => dir.clone(),
        None => default_data_dir()?,
    };
    let config = load_config(&cli, &data_dir).await?;
    let engine = open_engine(&config, &data_dir).await?;

    let result = match cli.command {
        Commands::Enqueue {
            kind,
            target,
            method,
            payload,
        } => cmd_enqueue(&engine, kind, &target, &method, payload.as_deref()).await,

        Commands::List => cmd_list(&engine).await,

        Commands::Status => cmd_status(&engine),

        Commands::Sync => cmd_sync(&engine).await,

        Commands::Clear => cmd_clear(&engine).await,

        Commands::Watch => cmd_watch(&engine).await,

        Commands::Completions { .. } => Ok(()),
    };

    engine.shutdown().await;
    result
}

fn default_data_dir() -> Result<PathBuf> {
    dirs::data_dir()
        .map(|dir| dir.join("outbox"))
        .context("Could not determine a data directory, pass --data-dir")
}

/// Load configuration and apply command line overrides.
async fn load_config(cli: &Cli, data_dir: &Path) -> Result<SyncConfig> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(|| data_dir.join("config.json"));

    let mut config = SyncConfig::load(&path)
        .await
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    if let Some(endpoint) = &cli.endpoint {
        config = config.with_endpoint(endpoint.clone());
        config.validate().context("Invalid endpoint")?;
    }
    Ok(config)
}

/// Build the configured key-value backend under `data_dir`.
async fn build_store(kind: StoreKind, data_dir: &Path) -> Result<Arc<dyn KeyValueStore>> {
    let store: Arc<dyn KeyValueStore> = match kind {
        StoreKind::Memory => Arc::new(MemoryStore::new()),
        StoreKind::File => {
            Arc::new(FileStore::new(data_dir.join("queue")).context("Failed to open file store")?)
        }
        StoreKind::Sqlite => {
            tokio::fs::create_dir_all(data_dir)
                .await
                .with_context(|| format!("Failed to create {}", data_dir.display()))?;
            Arc::new(
                SqliteStore::open(data_dir.join("outbox.db"))
                    .context("Failed to open SQLite store")?,
            )
        }
    };
    Ok(store)
}

/// Open the engine with connectivity taken from a single probe.
async fn open_engine(config: &SyncConfig, data_dir: &Path) -> Result<SyncEngine> {
    let endpoint = config.endpoint_url()?;
    let kv = build_store(config.store, data_dir).await?;

    let probe = HttpProbe::new(endpoint.clone(), config.request_timeout())?;
    let online = probe.check().await;
    info!(
        "Endpoint {} is {}",
        endpoint,
        if online { "reachable" } else { "unreachable" }
    );

    let remote = HttpRemote::new(endpoint, config.request_timeout())?;
    let engine = SyncEngine::open(
        config.clone(),
        kv,
        Arc::new(remote),
        NetworkMonitor::new(online),
    )
    .await
    .context("Failed to open sync engine")?;
    Ok(engine)
}

/// Queue an action and deliver it right away when possible.
async fn cmd_enqueue(
    engine: &SyncEngine,
    kind: ActionKind,
    target: &str,
    method: &str,
    payload: Option<&str>,
) -> Result<()> {
    let payload = match payload {
        Some(raw) => serde_json::from_str(raw).context("Payload is not valid JSON")?,
        None => serde_json::Value::Null,
    };

    let id = engine
        .enqueue(kind, target, payload, method)
        .await
        .context("Failed to queue action")?;
    println!("Queued {} {} ({})", method.to_ascii_uppercase(), target, id);

    if engine.config().drain_on_enqueue && engine.status().online {
        let outcome = engine.request_sync().await?;
        // The drain scheduled by the enqueue itself may have sent it already
        let still_pending = engine.pending().await.iter().any(|action| action.id == id);
        println!("{}", enqueue_outcome_message(&outcome, still_pending));
    } else {
        println!("Offline, {} actions pending", engine.status().pending_count);
    }

    Ok(())
}

/// List pending actions.
async fn cmd_list(engine: &SyncEngine) -> Result<()> {
    let pending = engine.pending().await;

    if pending.is_empty() {
        println!("No pending actions.");
        return Ok(());
    }

    println!("Pending actions ({}):", pending.len());
    for action in pending {
        println!(
            "  {}  {:<6} {:<6} {}  [{}/{} attempts, queued {}]",
            action.id,
            action.kind,
            action.method,
            action.target,
            action.attempts,
            action.max_attempts,
            action.enqueued_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}

/// Show sync status as JSON.
fn cmd_status(engine: &SyncEngine) -> Result<()> {
    let status = engine.status();
    println!("{}", serde_json::to_string_pretty(&status)?);
    if engine.is_degraded() {
        eprintln!("warning: queue store is unavailable, changes are held in memory");
    }
    Ok(())
}

/// Drain the queue now.
async fn cmd_sync(engine: &SyncEngine) -> Result<()> {
    print_outcome(&engine.force_sync().await);
    Ok(())
}

/// Discard all pending actions.
async fn cmd_clear(engine: &SyncEngine) -> Result<()> {
    let count = engine.status().pending_count;
    engine
        .clear_pending()
        .await
        .context("Failed to clear pending actions")?;
    println!("Cleared {} pending actions.", count);
    Ok(())
}

/// Probe connectivity and drain on reconnect until interrupted.
async fn cmd_watch(engine: &SyncEngine) -> Result<()> {
    let probe = HttpProbe::new(engine.config().endpoint_url()?, engine.config().request_timeout())?;
    engine.attach_probe(Arc::new(probe));

    let mut reports = engine.subscribe_reports();
    let mut status = engine.subscribe_status();
    println!(
        "Watching {} ({} pending). Press Ctrl-C to stop.",
        engine.config().endpoint,
        engine.status().pending_count
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            report = reports.recv() => match report {
                Ok(report) => println!("{}", report.summary()),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                info!(
                    "online={} pending={} in_progress={}",
                    current.online, current.pending_count, current.in_progress
                );
            }
        }
    }

    Ok(())
}

fn print_outcome(outcome: &DrainOutcome) {
    println!("{}", describe_outcome(outcome));
}

fn describe_outcome(outcome: &DrainOutcome) -> String {
    match outcome {
        DrainOutcome::Completed(report) => {
            let mut text = report.summary();
            for id in &report.dropped {
                text.push_str(&format!("\n  dropped {}", id));
            }
            text
        }
        DrainOutcome::Skipped(SkipReason::Offline) => "Offline, nothing sent.".to_string(),
        DrainOutcome::Skipped(SkipReason::Empty) => "Nothing to sync.".to_string(),
        DrainOutcome::Skipped(SkipReason::InProgress) => "A sync is already running.".to_string(),
    }
}

/// Result line for a freshly queued action after its follow-up drain.
fn enqueue_outcome_message(outcome: &DrainOutcome, still_pending: bool) -> String {
    match outcome {
        DrainOutcome::Skipped(_) if !still_pending => "Delivered.".to_string(),
        _ => describe_outcome(outcome),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_cli_parses_enqueue() {
        let cli = Cli::try_parse_from([
            "outbox", "enqueue", "--kind", "update", "--target", "/profile", "--payload",
            r#"{"name":"x"}"#,
        ])
        .unwrap();

        match cli.command {
            Commands::Enqueue {
                kind,
                target,
                method,
                payload,
            } => {
                assert_eq!(kind, ActionKind::Update);
                assert_eq!(target, "/profile");
                assert_eq!(method, "POST");
                assert!(payload.is_some());
            }
            _ => panic!("expected enqueue"),
        }
    }

    #[test]
    fn test_cli_rejects_unknown_kind() {
        let result = Cli::try_parse_from(["outbox", "enqueue", "--kind", "upsert", "--target", "/x"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[tokio::test]
    async fn test_build_store_for_each_kind() {
        let temp = TempDir::new().unwrap();

        for kind in [StoreKind::Memory, StoreKind::File, StoreKind::Sqlite] {
            let store = build_store(kind, temp.path()).await.unwrap();
            store.put("outbox.check", "1".to_string()).await.unwrap();
            assert_eq!(
                store.get("outbox.check").await.unwrap(),
                Some("1".to_string())
            );
        }
        assert!(temp.path().join("outbox.db").exists());
    }

    #[tokio::test]
    async fn test_endpoint_override() {
        let temp = TempDir::new().unwrap();
        let cli = Cli::try_parse_from([
            "outbox",
            "--endpoint",
            "https://api.example.com/v2",
            "status",
        ])
        .unwrap();

        let config = load_config(&cli, temp.path()).await.unwrap();
        assert_eq!(
            config.endpoint_url().unwrap().as_str(),
            "https://api.example.com/v2/"
        );
    }

    #[test]
    fn test_enqueue_message_when_earlier_drain_delivered() {
        let empty = DrainOutcome::Skipped(SkipReason::Empty);
        assert_eq!(enqueue_outcome_message(&empty, false), "Delivered.");

        let busy = DrainOutcome::Skipped(SkipReason::InProgress);
        assert_eq!(enqueue_outcome_message(&busy, false), "Delivered.");
        assert_eq!(enqueue_outcome_message(&busy, true), "A sync is already running.");

        let offline = DrainOutcome::Skipped(SkipReason::Offline);
        assert_eq!(enqueue_outcome_message(&offline, true), "Offline, nothing sent.");
    }

    #[tokio::test]
    async fn test_enqueue_then_request_sync_reports_delivery() {
        let temp = TempDir::new().unwrap();
        let config = SyncConfig::default().with_endpoint("https://api.example.com".to_string());
        let engine = SyncEngine::open(
            config,
            build_store(StoreKind::Memory, temp.path()).await.unwrap(),
            Arc::new(AcceptAll),
            NetworkMonitor::new(true),
        )
        .await
        .unwrap();

        let id = engine
            .enqueue(ActionKind::Create, "/chat", serde_json::json!({"text": "hi"}), "POST")
            .await
            .unwrap();
        let outcome = engine.request_sync().await.unwrap();
        let still_pending = engine.pending().await.iter().any(|action| action.id == id);

        assert!(!still_pending);
        let message = enqueue_outcome_message(&outcome, still_pending);
        assert_ne!(message, "Nothing to sync.");
        engine.shutdown().await;
    }

    struct AcceptAll;

    #[async_trait::async_trait]
    impl outbox_sync::RemoteExecutor for AcceptAll {
        async fn execute(&self, _action: &outbox_common::PendingAction) -> outbox_common::Result<()> {
            Ok(())
        }
    }
}
