//! Sensor Pipeline CLI
//!
//! Records simulated sensor sessions to disk and syncs them to a server.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

use sensor_pipeline::{
    clock::system_clock,
    config::{parse_sensors, Config},
    recording::{RecordingEvent, RecordingMode},
    sync::{generate_device_id, GatewayConfig, SyncOrchestrator, SyncOutcome},
    AppContext, SimulatedSource, VERSION,
};

#[derive(Parser)]
#[command(name = "sensor-pipeline")]
#[command(version = VERSION)]
#[command(about = "Record sensor sessions durably and sync them when online", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record a session until Ctrl+C or the duration elapses
    Record {
        /// Sensors to record (comma-separated, or all)
        #[arg(long)]
        sensors: Option<String>,

        /// Recording mode (sensor_only, audio_only, sensor_and_audio)
        #[arg(long)]
        mode: Option<RecordingMode>,

        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<u64>,

        /// Do not sync in the background while recording
        #[arg(long)]
        no_sync: bool,
    },

    /// Upload queued chunks and pull server changes
    Sync,

    /// Requeue failed uploads and sync
    Retry,

    /// Show queue, storage and cumulative statistics
    Status,

    /// Delete synced chunks older than the retention period
    Purge {
        /// Override the configured retention, in hours
        #[arg(long)]
        older_than_hours: Option<u64>,
    },

    /// Show or update configuration
    Config {
        /// Sync server base URL
        #[arg(long)]
        gateway_url: Option<String>,

        /// Bearer token for the sync server
        #[arg(long)]
        gateway_token: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Record {
            sensors,
            mode,
            duration,
            no_sync,
        } => cmd_record(sensors, mode, duration.map(Duration::from_secs), no_sync).await,
        Commands::Sync => cmd_sync(false).await,
        Commands::Retry => cmd_sync(true).await,
        Commands::Status => cmd_status().await,
        Commands::Purge { older_than_hours } => cmd_purge(older_than_hours).await,
        Commands::Config {
            gateway_url,
            gateway_token,
        } => cmd_config(gateway_url, gateway_token),
    }
}

/// Load configuration and make sure it carries a device id.
fn load_config() -> Result<Config> {
    let mut config = Config::load().context("failed to load configuration")?;
    if config.device_id.is_none() {
        config.device_id = Some(generate_device_id());
        if let Err(e) = config.save() {
            eprintln!("Warning: Could not save device id: {e}");
        }
    }
    Ok(config)
}

fn open_context(config: Config) -> Result<AppContext> {
    let clock = system_clock();
    let source = Arc::new(SimulatedSource::new(clock.clone()));
    AppContext::builder(config, source)
        .clock(clock)
        .build()
        .context("failed to open pipeline")
}

async fn cmd_record(
    sensors: Option<String>,
    mode: Option<RecordingMode>,
    duration: Option<Duration>,
    no_sync: bool,
) -> Result<()> {
    let mut config = load_config()?;
    if let Some(sensors) = sensors {
        config.recording.sensors = parse_sensors(&sensors)?;
    }
    if let Some(mode) = mode {
        config.recording.mode = mode;
    }
    if no_sync {
        config.auto_sync = false;
    }

    println!("Sensor Pipeline v{VERSION}");
    println!();

    let ctx = open_context(config)?;
    let settings = ctx.config.recording.clone();

    ctx.recording.add_listener(|event| {
        if let RecordingEvent::Error {
            origin, message, ..
        } = &event.payload
        {
            eprintln!("[{origin}] {message}");
        }
    });

    let session_id = ctx.recording.start(settings.recording_config()).await?;
    println!("Recording session {session_id}");
    println!("  Mode: {}", settings.mode);
    let names: Vec<String> = settings.sensors.iter().map(|s| s.to_string()).collect();
    println!("  Sensors: {}", names.join(", "));
    println!("  Rate: {} Hz", settings.rate.hz());
    println!("  Data directory: {}", ctx.config.data_path.display());

    let sync_task = ctx.start_auto_sync();
    match &sync_task {
        Some(_) => println!(
            "  Background sync: every {}s",
            ctx.config.sync_interval.as_secs()
        ),
        None => println!("  Background sync: disabled"),
    }

    println!();
    println!("Press Ctrl+C to stop");
    println!();

    let running = Arc::new(AtomicBool::new(true));
    ctrlc_handler(running.clone())?;

    let started = Instant::now();
    let mut last_report = Instant::now();
    while running.load(Ordering::SeqCst) {
        if duration.is_some_and(|limit| started.elapsed() >= limit) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        if last_report.elapsed() >= Duration::from_secs(10) {
            if let Some(stats) = ctx.recording.statistics() {
                let (samples, dropped) = stats
                    .sensors
                    .as_ref()
                    .map(|s| (s.total_samples, s.total_dropped))
                    .unwrap_or_default();
                println!(
                    "[{}s] samples: {samples} | dropped: {dropped} | buffered: {}",
                    stats.duration_ms / 1_000,
                    stats.buffered_samples
                );
            }
            last_report = Instant::now();
        }
    }

    println!();
    println!("Stopping recording...");
    if let Some(task) = sync_task {
        task.abort();
    }

    let summary = ctx.stop_recording().await?;
    println!(
        "Session {} | {}s | {} samples in {} chunks",
        summary.session_id,
        summary.duration_ms / 1_000,
        summary.sample_count,
        summary.chunk_count
    );
    if summary.unsealed_chunks > 0 {
        eprintln!(
            "Warning: {} chunks could not be sealed and will be retried on shutdown",
            summary.unsealed_chunks
        );
    }

    if ctx.config.auto_sync {
        if let Some(sync) = &ctx.sync {
            println!("Syncing session...");
            report_outcome(sync, sync.start_sync().await);
        }
    }

    println!();
    println!("{}", ctx.ledger.summary());
    ctx.shutdown().await?;
    Ok(())
}

async fn cmd_sync(retry: bool) -> Result<()> {
    let config = load_config()?;
    let ctx = open_context(config)?;
    let Some(sync) = ctx.sync.clone() else {
        ctx.shutdown().await?;
        bail!("no sync server configured; run `sensor-pipeline config --gateway-url <URL>`");
    };

    let result = if retry {
        sync.retry_failed_items().await
    } else {
        sync.start_sync().await
    };
    report_outcome(&sync, result);

    ctx.shutdown().await?;
    Ok(())
}

fn report_outcome(
    sync: &SyncOrchestrator,
    result: Result<SyncOutcome, sensor_pipeline::sync::SyncError>,
) {
    match result {
        Ok(SyncOutcome::Completed(report)) => {
            println!(
                "Sync complete | pushed: {} | failed: {} | parked: {} | pulled: {}",
                report.synced, report.failed, report.parked, report.pulled
            );
            if let Some(error) = report.pull_error {
                eprintln!("Warning: Pull failed: {error}");
            }
        }
        Ok(SyncOutcome::Deferred { reason }) => {
            println!("Sync deferred: {reason:?}");
        }
        Ok(SyncOutcome::AlreadyRunning) => {
            println!("Sync already running");
        }
        Err(e) => {
            eprintln!("Sync failed: {e} (state: {:?})", sync.state());
        }
    }
}

async fn cmd_status() -> Result<()> {
    let config = load_config()?;
    let ctx = open_context(config)?;

    println!("Sensor Pipeline Status");
    println!("======================");
    println!();

    let (chunks, unsynced, bytes) = ctx.store.chunk_totals().await?;
    println!("Storage:");
    println!("  Data directory: {}", ctx.config.data_path.display());
    println!("  Chunks: {chunks} ({unsynced} not yet synced)");
    println!("  Bytes on disk: {bytes}");
    println!();

    let queue = ctx.store.queue_counts().await?;
    println!("Sync queue:");
    println!("  Pending: {}", queue.pending);
    println!("  In progress: {}", queue.in_progress);
    println!("  Failed: {} ({} parked)", queue.failed, queue.parked);
    match ctx.store.last_sync_at().await? {
        Some(at) => println!("  Last sync: {}", format_ms(at)),
        None => println!("  Last sync: never"),
    }
    println!(
        "  Server: {}",
        ctx.config
            .gateway
            .as_ref()
            .map(|g| g.base_url.as_str())
            .unwrap_or("not configured")
    );
    println!();

    let sessions = ctx.store.sessions(5).await?;
    if sessions.is_empty() {
        println!("No sessions recorded yet.");
    } else {
        println!("Recent sessions:");
        for session in sessions {
            println!(
                "  {} | {} | {} | {} samples in {} chunks",
                session.session_id,
                format_ms(session.start_timestamp),
                session.state,
                session.sample_count,
                session.chunk_count
            );
        }
    }
    println!();
    println!("{}", ctx.ledger.summary());

    ctx.shutdown().await?;
    Ok(())
}

async fn cmd_purge(older_than_hours: Option<u64>) -> Result<()> {
    let mut config = load_config()?;
    if let Some(hours) = older_than_hours {
        config.chunks.retention = Duration::from_secs(hours * 3600);
    }
    let ctx = open_context(config)?;

    let report = ctx.purge().await?;
    println!(
        "Purged {} synced chunks ({} bytes)",
        report.chunks, report.bytes
    );

    ctx.shutdown().await?;
    Ok(())
}

fn cmd_config(gateway_url: Option<String>, gateway_token: Option<String>) -> Result<()> {
    let mut config = load_config()?;

    if gateway_url.is_some() || gateway_token.is_some() {
        let mut gateway = match (gateway_url, config.gateway.take()) {
            (Some(url), Some(existing)) => GatewayConfig {
                base_url: url,
                ..existing
            },
            (Some(url), None) => GatewayConfig::new(url),
            (None, Some(existing)) => existing,
            (None, None) => bail!("--gateway-token requires --gateway-url"),
        };
        if let Some(token) = gateway_token {
            gateway.token = Some(token);
        }
        config.gateway = Some(gateway);
        config.validate()?;
        config.save()?;
        println!("Configuration updated.");
        println!();
    }

    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {:?}", Config::config_path());
    println!();
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

fn format_ms(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| ms.to_string())
}

/// Set up Ctrl+C handler.
fn ctrlc_handler(running: Arc<AtomicBool>) -> Result<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .context("Error setting Ctrl+C handler")
}
