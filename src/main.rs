//! Fedi Ingestion Service
//! Stream and directory harvesting for federated social-network servers
//!
//! Commands:
//! - `stream`: public timeline events from every server in the roster
//! - `new-users`: newest accounts from every server's profile directory
//! - `archive`: bundle one completed day by hand
//! - `status`: roster and today's bucket sizes

use anyhow::{bail, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, info_span, Span};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fedi_ingestion::append_log::{AppendLogStorage, FileSystemAppendLog};
use fedi_ingestion::bucket::{self, Category, Clock, SystemClock};
use fedi_ingestion::config::Config;
use fedi_ingestion::http_client::{HttpClient, HttpClientConfig};
use fedi_ingestion::metrics::start_metrics_server;
use fedi_ingestion::roster::{load_roster, SourceDescriptor};
use fedi_ingestion::rotation::{Archiver, RotationOutcome};
use fedi_ingestion::sources::{MastodonDirectoryClient, MastodonStreamClient};
use fedi_ingestion::supervisor::{Supervisor, SupervisorSettings};
use fedi_ingestion::worker::{
    shutdown_channel, PullWorkerFactory, PullWorkerSettings, PushWorkerFactory,
    PushWorkerSettings, ShutdownTrigger, WorkerFactory,
};

/// Fedi Ingestion - per-server stream and directory harvesting
#[derive(Parser, Debug)]
#[command(name = "fedi-ingestion")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Stream and directory harvesting for federated social-network servers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, default_value = "false", global = true)]
    json_logs: bool,

    /// Roster file, overriding ROSTER_PATH
    #[arg(long, global = true)]
    roster: Option<PathBuf>,

    /// Output folder, overriding BASE_FOLDER
    #[arg(long, global = true)]
    base_folder: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Stream public timeline events from every server
    Stream,

    /// Poll every server's directory for newly created accounts
    NewUsers,

    /// Archive one completed UTC day
    Archive {
        /// Day to archive (YYYY-MM-DD)
        #[arg(long, value_parser = parse_date)]
        date: NaiveDate,
    },

    /// Show roster and today's bucket sizes
    Status,
}

#[derive(Debug, Clone, Copy)]
enum Mode {
    Push,
    Pull,
}

fn parse_date(s: &str) -> std::result::Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| format!("expected YYYY-MM-DD: {}", e))
}

/// Generates a new correlation ID for the session
fn generate_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Sets up structured logging with tracing
fn setup_logging(log_level: &str, json_output: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if json_output {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

/// Fires the shutdown trigger on SIGTERM/SIGINT
async fn shutdown_signal(trigger: ShutdownTrigger) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping workers between events...");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping workers between events...");
        }
    }

    trigger.trigger();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli.log_level, cli.json_logs);

    let correlation_id = generate_correlation_id();
    let session = info_span!("session", correlation_id = %correlation_id);

    info!(
        parent: &session,
        version = env!("CARGO_PKG_VERSION"),
        "Starting Fedi Ingestion Service"
    );

    let mut config = Config::load()?;
    if let Some(roster) = cli.roster {
        config.roster_path = roster;
    }
    if let Some(base_folder) = cli.base_folder {
        config.base_folder = base_folder;
    }
    config.validate()?;

    info!(
        parent: &session,
        base_folder = %config.base_folder.display(),
        roster = %config.roster_path.display(),
        max_concurrent = config.max_concurrent_requests,
        "Configuration loaded"
    );

    match cli.command {
        Commands::Stream => run_service(Mode::Push, config, session).await?,
        Commands::NewUsers => run_service(Mode::Pull, config, session).await?,
        Commands::Archive { date } => archive_day(&config, date).await?,
        Commands::Status => show_status(&config).await?,
    }

    Ok(())
}

/// Runs one worker per roster entry until SIGTERM/SIGINT
async fn run_service(mode: Mode, config: Config, session: Span) -> Result<()> {
    // Roster problems abort before any worker starts
    let sources = load_roster(&config.roster_path).await?;
    tokio::fs::create_dir_all(&config.base_folder).await?;

    let http = Arc::new(HttpClient::new(HttpClientConfig::from_config(&config))?);
    let storage: Arc<dyn AppendLogStorage> = Arc::new(FileSystemAppendLog::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let archiver = config
        .archive_enabled
        .then(|| Arc::new(Archiver::tar_gz(&config.base_folder)));

    let factory: Arc<dyn WorkerFactory> = match mode {
        Mode::Push => Arc::new(PushWorkerFactory {
            client: Arc::new(MastodonStreamClient::new(http)),
            storage,
            base: config.base_folder.clone(),
            clock,
            archiver,
            settings: PushWorkerSettings::from_config(&config),
        }),
        Mode::Pull => Arc::new(PullWorkerFactory {
            fetcher: Arc::new(MastodonDirectoryClient::new(http, config.directory_limit)),
            storage,
            base: config.base_folder.clone(),
            clock,
            archiver,
            settings: PullWorkerSettings::from_config(&config),
        }),
    };

    if config.metrics_enabled {
        let metrics_addr: SocketAddr = format!("0.0.0.0:{}", config.metrics_port).parse()?;
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(metrics_addr).await {
                error!(error = %e, "Metrics server failed");
            }
        });
        info!(parent: &session, port = config.metrics_port, "Metrics server started at /metrics");
    }

    let (trigger, signal) = shutdown_channel();
    tokio::spawn(shutdown_signal(trigger));

    info!(parent: &session, servers = sources.len(), mode = ?mode, "Saving files to {}", config.base_folder.display());

    let supervisor = Supervisor::new(factory, SupervisorSettings::from_config(&config), session.clone());
    let report = supervisor.run(sources, signal).await;

    let restarts: u32 = report.restarts.iter().map(|(_, n)| n).sum();
    info!(parent: &session, restarts, "Fedi Ingestion Service stopped");
    Ok(())
}

/// Archives a past day outside the running service
async fn archive_day(config: &Config, date: NaiveDate) -> Result<()> {
    let today = Utc::now().date_naive();
    if date >= today {
        bail!("refusing to archive {}: the day is not over yet (today is {} UTC)", date, today);
    }

    let archiver = Archiver::tar_gz(&config.base_folder);
    match archiver.archive_day(date).await {
        RotationOutcome::Archived { bundle, .. } => {
            println!("Archived {} -> {}", date, bundle.display());
        }
        RotationOutcome::AlreadyArchived { .. } => {
            println!("Nothing to archive for {} (no day directory)", date);
        }
        RotationOutcome::Skipped { .. } => {
            println!("Archiving skipped for {}", date);
        }
        RotationOutcome::Failed { reason, .. } => {
            bail!("archiving {} failed, day directory kept: {}", date, reason);
        }
    }
    Ok(())
}

async fn file_size(path: &Path) -> Option<u64> {
    tokio::fs::metadata(path).await.ok().map(|m| m.len())
}

/// Shows roster and today's bucket sizes
async fn show_status(config: &Config) -> Result<()> {
    let now = Utc::now();

    println!("\nFedi Ingestion Service Status");
    println!("=============================\n");

    println!("Storage:");
    println!("  Base folder: {}", config.base_folder.display());
    println!("  Today:       {}", bucket::day_dir(&config.base_folder, now.date_naive()).display());
    println!("  Archiving:   {}", if config.archive_enabled { "enabled" } else { "disabled" });

    let sources: Vec<SourceDescriptor> = match load_roster(&config.roster_path).await {
        Ok(sources) => sources,
        Err(e) => {
            println!("\nRoster: {} ({})", config.roster_path.display(), e);
            return Ok(());
        }
    };

    println!("\nRoster: {} ({} servers)", config.roster_path.display(), sources.len());
    println!("\n{:<40} {:>14} {:>14}", "Server", "Stream bytes", "New users bytes");
    println!("{}", "-".repeat(70));

    for source in &sources {
        let stream = bucket::bucket_path(&config.base_folder, &source.id, now, None);
        let new_users = bucket::bucket_path(&config.base_folder, &source.id, now, Some(Category::NewUsers));
        let show = |size: Option<u64>| size.map_or_else(|| "-".to_string(), |s| s.to_string());
        println!(
            "{:<40} {:>14} {:>14}",
            source.id,
            show(file_size(&stream).await),
            show(file_size(&new_users).await)
        );
    }

    Ok(())
}
