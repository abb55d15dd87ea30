//! crosspost-relay - Relay daemon
//!
//! Polls the source feed for the configured handles and relays every new
//! post to the destination account.

use clap::Parser;
use libcrosspost::config::{Config, SessionSettings};
use libcrosspost::credentials::{open_store, CredentialStore, DomainRule};
use libcrosspost::logging::{self, LogFormat};
use libcrosspost::media::MediaStore;
use libcrosspost::relay::RelayClient;
use libcrosspost::scheduler::PollScheduler;
use libcrosspost::session::SessionClient;
use libcrosspost::source::{SourceFeed, TwitterFeedClient};
use libcrosspost::{CrosspostError, PipelineSettings, RecordStore, RelayPipeline, Result};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "crosspost-relay")]
#[command(version)]
#[command(about = "Relay source posts to the destination account")]
#[command(long_about = "\
crosspost-relay - Relay daemon

DESCRIPTION:
    crosspost-relay polls the source feed for the configured handles,
    records every new post, downloads its photos, and relays it to the
    destination account. Each post is relayed at most once; failures are
    recorded with their error text and not retried.

USAGE:
    # Run in foreground (logs to stderr)
    crosspost-relay

    # Poll every two minutes
    crosspost-relay --interval 2m

    # Run one cycle and exit
    crosspost-relay --once

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (finishes the current cycle)

CONFIGURATION:
    Configuration file: ~/.config/crosspost/config.toml
    (override with --config or CROSSPOST_CONFIG)

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime or configuration error
    2 - Authentication error (destination cookies expired)
")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, value_name = "PATH", env = "CROSSPOST_CONFIG")]
    config: Option<PathBuf>,

    /// Poll interval, e.g. "60s" or "2m" (overrides config)
    #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration)]
    interval: Option<Duration>,

    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    verbose: bool,

    /// Log output format
    #[arg(long, value_name = "FORMAT", env = "CROSSPOST_LOG_FORMAT")]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut log_config = logging::from_env(cli.verbose);
    if let Some(format) = cli.log_format {
        log_config.format = format;
    }
    if let Err(e) = log_config.init() {
        eprintln!("Error: {}", e);
        return ExitCode::from(e.exit_code() as u8);
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "crosspost-relay failed");
            eprintln!("Error: {}", e);
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };

    let store = RecordStore::new(&config.database.path).await?;
    let media = MediaStore::new(&config.media, config.session.timeout())?;
    media.ensure_dirs().await?;

    let rule = DomainRule::from_config(&config.session);
    let credentials = open_store(&config.session)?;
    let credential = credentials.load(&rule)?;
    let session =
        SessionClient::authenticate(&config.session, &config.destination, rule, credential).await?;
    let relay = Arc::new(RelayClient::new(session, config.destination.clone()));

    let mut settings = PipelineSettings::from_config(&config.source)?;
    if let Some(interval) = cli.interval {
        if interval.is_zero() {
            return Err(CrosspostError::InvalidInput(
                "--interval must be greater than zero".to_string(),
            ));
        }
        settings.interval = interval;
    }

    let pipeline = Arc::new(RelayPipeline::new(store, media, relay.clone(), settings));
    let feed: Arc<dyn SourceFeed> = Arc::new(TwitterFeedClient::new(
        &config.source.api_base,
        &config.source.bearer_token,
        config.session.timeout(),
    )?);

    info!(
        backend = credentials.backend_name(),
        interval_secs = pipeline.settings().interval.as_secs(),
        "crosspost-relay starting"
    );

    if cli.once {
        let report = pipeline.run_once(&feed).await?;
        println!(
            "fetched {} inserted {} delivered {} failed {}",
            report.fetched, report.inserted, report.delivered, report.failed
        );
    } else {
        let scheduler = PollScheduler::new(feed, pipeline.clone());
        setup_signal_handlers(scheduler.clone())?;
        scheduler.start(pipeline.initial_params().await?);
        scheduler.wait_idle().await;
    }

    save_credential(credentials.as_ref(), &relay, &config.session);
    info!("crosspost-relay stopped");
    Ok(())
}

/// Persist cookies the destination rotated during the run
fn save_credential(store: &dyn CredentialStore, relay: &RelayClient, settings: &SessionSettings) {
    match store.save(&relay.session().credential()) {
        Ok(()) => info!(path = %settings.credential_path, "Saved destination credential"),
        Err(e) => error!(error = %e, "Failed to save destination credential"),
    }
}

/// Stop the poll chain on SIGINT/SIGTERM
#[cfg(unix)]
fn setup_signal_handlers(scheduler: PollScheduler) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM])
        .map_err(|e| CrosspostError::InvalidInput(format!("Signal setup failed: {}", e)))?;

    std::thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            info!(signal, "Received shutdown signal, finishing current cycle");
            scheduler.stop();
        }
    });

    Ok(())
}

#[cfg(not(unix))]
fn setup_signal_handlers(scheduler: PollScheduler) -> Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, finishing current cycle");
            scheduler.stop();
        }
    });
    Ok(())
}
