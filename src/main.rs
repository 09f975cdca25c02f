//! ephemail daemon entrypoint.

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use ephemail::config::Config;
use ephemail::ingest::IngestScheduler;
use ephemail::store;
use ephemail::sweep::RetentionSweeper;
use ephemail::transport;
use ephemail::MailCore;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ephemail", about = "Disposable email ingestion service")]
struct Cli {
    /// Path to the TOML configuration file. Defaults to ./ephemail.toml,
    /// then the user config directory.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write daily-rotated log files into this directory instead of stderr.
    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the ingestion and retention service (default).
    Serve,
    /// Open a throwaway connection to the configured IMAP account and
    /// report whether it works.
    CheckImap,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // The guard must outlive main or buffered log lines are dropped.
    let _log_guard = init_tracing(cli.log_dir.as_deref());

    let config_path = resolve_config_path(cli.config)?;
    let config = Config::load(&config_path)?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::CheckImap => check_imap(config).await,
        Command::Serve => serve(config).await,
    }
}

fn init_tracing(log_dir: Option<&std::path::Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ephemail=info"))
    };

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "ephemail.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter()).init();
            None
        }
    }
}

/// An explicit --config wins; otherwise try the working directory, then
/// the platform config directory.
fn resolve_config_path(explicit: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path);
    }

    let local = PathBuf::from("ephemail.toml");
    if local.exists() {
        return Ok(local);
    }

    let fallback = dirs::config_dir()
        .map(|dir| dir.join("ephemail").join("ephemail.toml"))
        .filter(|path| path.exists());

    fallback.ok_or_else(|| {
        anyhow::anyhow!("no config file found; pass --config or create ephemail.toml")
    })
}

async fn check_imap(config: Config) -> anyhow::Result<()> {
    let settings = config.imap.clone();
    tokio::task::spawn_blocking(move || transport::test_connection(&settings))
        .await
        .context("connection test task failed")??;

    println!("IMAP connection OK: {}:{}", config.imap.host, config.imap.port);
    Ok(())
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let pool = store::connect(&config.storage.database_url).await?;
    let core = MailCore::new(pool, config.retention.clone());

    let stats = core.stats().await?;
    tracing::info!(
        mailboxes = stats.mailboxes,
        messages = stats.messages,
        "store opened"
    );

    let scheduler = IngestScheduler::new(config.imap.clone(), core.directory(), core.messages());
    let sweeper = RetentionSweeper::new(config.retention, core.directory(), core.messages());

    scheduler.start().await?;
    sweeper.start().await?;
    tracing::info!(
        poll_interval_secs = config.imap.poll_interval_secs,
        "ephemail running, press ctrl-c to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    tracing::info!("shutting down");
    scheduler.shutdown().await;
    sweeper.shutdown().await;

    Ok(())
}
