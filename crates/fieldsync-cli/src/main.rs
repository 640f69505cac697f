//! Fieldsync - keep working offline and sync when back online.
//!
//! One-shot commands (`submit`, `sync`, `status`, `artifact`, `assets`) open
//! the local store, do their work and exit. `watch` stays running, probing
//! the remote host and draining the outbox whenever connectivity returns.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fieldsync_core::assets::DirSnapshotStorage;
use fieldsync_core::{
    ArtifactProgress, AssetManifest, AssetProxy, AssetRequest, ChannelSink, Config, Engine,
    FileBackend, Level, Notification, NotificationSink, ProxyOutcome, ReachabilityProbe,
    RestClient, Status, SubmitOutcome, TracingSink, Url,
};

// ============================================================================
// Constants
// ============================================================================

/// Notifications buffered between the engine and the console printer
const NOTIFICATION_BUFFER: usize = 64;

/// How long to wait for queued notifications to print on exit
const NOTIFICATION_FLUSH_TIMEOUT_SECS: u64 = 2;

/// Log file name prefix inside the log directory
const LOG_FILE_PREFIX: &str = "fieldsync";

/// Default stderr filter. Notifications are printed by the console printer,
/// so their log copies only go to the file.
const DEFAULT_STDERR_FILTER: &str = "warn,fieldsync_core::notify=off";

// ============================================================================
// Command line
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "fieldsync")]
#[command(about = "Offline outbox, document cache and asset snapshots", long_about = None)]
struct Cli {
    /// Treat the network as unavailable instead of probing the remote host
    #[arg(long, global = true)]
    offline: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a write to the remote store, queueing it if that fails
    Submit {
        /// Remote collection (table) name
        destination: String,
        /// JSON payload
        payload: String,
    },
    /// Replay queued writes now
    Sync,
    /// Show connectivity, pending writes and cache contents
    Status,
    /// Cached documents
    Artifact {
        #[command(subcommand)]
        action: ArtifactAction,
    },
    /// Static asset snapshot
    Assets {
        #[command(subcommand)]
        action: AssetsAction,
    },
    /// Probe connectivity and sync on every reconnect until interrupted
    Watch,
}

#[derive(Subcommand, Debug)]
enum ArtifactAction {
    /// Print a document, downloading it if it is not cached
    Get {
        url: String,
        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Download again even if cached
        #[arg(long)]
        refresh: bool,
    },
    List,
    Clear,
}

#[derive(Subcommand, Debug)]
enum AssetsAction {
    /// Install and activate the configured snapshot version
    Install,
    /// Resolve a request through the proxy and report where it was served from
    Fetch { path: String },
}

// ============================================================================
// Setup
// ============================================================================

/// Initialize the tracing subscriber for logging.
///
/// Stderr gets `RUST_LOG` (default warnings only); the daily log file under the
/// data directory records everything at info and above. The returned guard
/// must be held until exit so buffered file output is flushed.
fn init_tracing(log_dir: Option<PathBuf>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_STDERR_FILTER));

    let mut guard = None;
    let file_layer = log_dir.and_then(|dir| {
        let appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(LOG_FILE_PREFIX)
            .filename_suffix("log")
            .build(&dir)
            .map_err(|e| eprintln!("warning: file logging disabled ({}): {}", dir.display(), e))
            .ok()?;
        let (writer, worker) = tracing_appender::non_blocking(appender);
        guard = Some(worker);
        Some(
            fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(EnvFilter::new("info")),
        )
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr).with_filter(filter))
        .with(file_layer)
        .init();

    guard
}

/// Print engine notifications for the operator until every sender is gone.
/// Each one is also logged so the log file has the full history.
async fn print_notifications(mut rx: mpsc::Receiver<Notification>) {
    while let Some(notification) = rx.recv().await {
        TracingSink.notify(&notification.message, notification.level);
        eprintln!("[{}] {}", level_tag(notification.level), notification.message);
    }
}

/// Console prefix for a notification level
fn level_tag(level: Level) -> &'static str {
    match level {
        Level::Info => "..",
        Level::Success => "ok",
        Level::Warning => "!!",
    }
}

fn remote_client(config: &Config) -> Result<Arc<RestClient>> {
    let mut client = RestClient::new(config.remote_url()?).context("Failed to build HTTP client")?;
    if let Some(ref key) = config.api_key {
        client = client.with_api_key(key.clone());
    }
    Ok(Arc::new(client))
}

fn probe_for(client: &RestClient, config: &Config) -> Option<ReachabilityProbe> {
    let (host, port) = client.endpoint()?;
    Some(ReachabilityProbe::new(host, port).with_interval(config.probe_interval()))
}

fn asset_proxy(
    config: &Config,
    client: Arc<RestClient>,
    sink: Arc<dyn NotificationSink>,
) -> Result<Option<AssetProxy>> {
    let (Some(origin), Some(manifest)) = (config.app_origin.as_deref(), config.asset_manifest())
    else {
        return Ok(None);
    };
    let origin = Url::parse(origin).with_context(|| format!("Invalid app_origin '{}'", origin))?;
    let storage = DirSnapshotStorage::new(config.assets_dir()?);
    Ok(Some(AssetProxy::new(
        origin,
        manifest,
        Arc::new(storage),
        client,
        sink,
    )))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let config = Config::load().context("Failed to load configuration")?;

    let _log_guard = init_tracing(config.log_dir().ok());
    info!(command = ?cli.command, "Fieldsync starting");

    let (sink, rx) = ChannelSink::new(NOTIFICATION_BUFFER);
    let printer = tokio::spawn(print_notifications(rx));

    let result = run(cli, &config, Arc::new(sink)).await;

    // Every sender is dropped by now; give the printer a moment to finish
    let flush = Duration::from_secs(NOTIFICATION_FLUSH_TIMEOUT_SECS);
    if tokio::time::timeout(flush, printer).await.is_err() {
        debug!("Notification printer did not finish in time");
    }
    result
}

async fn run(cli: Cli, config: &Config, sink: Arc<dyn NotificationSink>) -> Result<()> {
    let client = remote_client(config)?;
    let probe = probe_for(&client, config);

    let initial = if cli.offline {
        Status::Offline
    } else {
        match probe {
            Some(ref probe) => probe.check().await,
            None => Status::Online,
        }
    };

    let engine = Engine::open(
        FileBackend::new(config.store_dir()?),
        client.clone(),
        client.clone(),
        initial,
        sink.clone(),
    )
    .await
    .context("Failed to open local storage")?;
    let engine = match asset_proxy(config, client, sink)? {
        Some(proxy) => engine.with_assets(proxy),
        None => engine,
    };

    match cli.command {
        Command::Submit {
            destination,
            payload,
        } => submit(&engine, &destination, &payload).await,
        Command::Sync => sync(&engine).await,
        Command::Status => status(&engine).await,
        Command::Artifact { action } => artifact(&engine, action).await,
        Command::Assets { action } => assets(&engine, action).await,
        Command::Watch => match probe {
            Some(probe) => watch(engine, probe).await,
            None => anyhow::bail!("remote_url has no host to probe"),
        },
    }
}

// ============================================================================
// Commands
// ============================================================================

async fn submit(engine: &Engine, destination: &str, payload: &str) -> Result<()> {
    let payload: Value = serde_json::from_str(payload).context("Payload is not valid JSON")?;
    match engine.submit(destination, payload).await? {
        SubmitOutcome::Delivered => println!("delivered"),
        SubmitOutcome::Queued(id) => println!("queued {}", id),
    }
    Ok(())
}

async fn sync(engine: &Engine) -> Result<()> {
    if !engine.connectivity().is_online() {
        anyhow::bail!("Offline; queued writes will be sent once the remote store is reachable");
    }
    match engine.drain().await {
        Some(report) => println!("{}", serde_json::to_string_pretty(&report)?),
        None => warn!("No local storage, nothing to sync"),
    }
    Ok(())
}

async fn status(engine: &Engine) -> Result<()> {
    let pending: Vec<Value> = match engine.outbox() {
        Some(outbox) => outbox
            .pending()
            .await?
            .into_iter()
            .map(|r| json!({"id": r.id, "destination": r.destination, "enqueued_at": r.enqueued_at}))
            .collect(),
        None => Vec::new(),
    };
    let artifacts = if engine.is_persistent() {
        engine.artifacts().cached_keys().await?.len()
    } else {
        0
    };
    let live_assets = match engine.assets() {
        Some(proxy) => proxy.load_live().await?,
        None => None,
    };

    let report = json!({
        "connectivity": engine.connectivity().status(),
        "persistent": engine.is_persistent(),
        "schema_version": engine.store().map(|s| s.schema_version()),
        "pending": pending,
        "cached_artifacts": artifacts,
        "live_assets": live_assets,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn artifact(engine: &Engine, action: ArtifactAction) -> Result<()> {
    let cache = engine.artifacts();
    match action {
        ArtifactAction::Get {
            url,
            output,
            refresh,
        } => {
            let progress = |p: ArtifactProgress| debug!(progress = %p, url = %url, "Artifact progress");
            let bytes = if refresh {
                cache.refetch(&url, progress).await?
            } else {
                cache.get_or_fetch(&url, progress).await?
            };
            match output {
                Some(path) => {
                    tokio::fs::write(&path, &bytes)
                        .await
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    println!("{} bytes written to {}", bytes.len(), path.display());
                }
                None => io::stdout().write_all(&bytes)?,
            }
        }
        ArtifactAction::List => {
            for entry in cache.entries().await? {
                println!(
                    "{}\t{} bytes\t{}\t{}",
                    entry.key,
                    entry.size(),
                    entry.age_display(),
                    &entry.digest[..12.min(entry.digest.len())]
                );
            }
        }
        ArtifactAction::Clear => cache.clear().await?,
    }
    Ok(())
}

async fn assets(engine: &Engine, action: AssetsAction) -> Result<()> {
    let proxy = engine
        .assets()
        .context("No asset snapshot configured (set app_origin and asset_version)")?;
    match action {
        AssetsAction::Install => {
            proxy.start().await?;
            let manifest: &AssetManifest = proxy.manifest();
            println!(
                "snapshot {} live ({} resources)",
                manifest.version,
                manifest.resources.len()
            );
        }
        AssetsAction::Fetch { path } => {
            proxy.load_live().await?;
            let url = proxy
                .origin()
                .join(&path)
                .with_context(|| format!("Invalid path '{}'", path))?;
            match proxy.handle(&AssetRequest::get(url)).await? {
                ProxyOutcome::Passthrough => println!("passthrough"),
                ProxyOutcome::Cached(r) => println!("cache\t{}\t{} bytes", r.status, r.body.len()),
                ProxyOutcome::Network(r) => println!("network\t{}\t{} bytes", r.status, r.body.len()),
            }
        }
    }
    Ok(())
}

async fn watch(engine: Engine, probe: ReachabilityProbe) -> Result<()> {
    let monitor = engine.monitor();
    let (tx, rx) = mpsc::channel(8);

    let probe_task = tokio::spawn(probe.run(tx));
    let monitor_task = tokio::spawn(monitor.run(rx));

    if engine.connectivity().is_online() {
        let report = engine.drain().await;
        debug!(?report, "Startup drain finished");
    }
    info!("Watching connectivity, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Stopping");

    // Dropping the probe's sender ends the monitor loop
    probe_task.abort();
    if let Err(e) = monitor_task.await {
        warn!(error = %e, "Connectivity monitor task failed");
    }
    Ok(())
}
