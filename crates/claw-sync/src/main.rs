//! claw-sync - cluster state mirror
//!
//! Keeps a local copy of the admin API's entities up to date and reports
//! what it sees.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use claw_sync::entity::WizardEntry;
use claw_sync::{
    EntityKind, ErrorLog, FeatureFlags, HttpBackend, SyncConfig, SyncEngine, SyncEvent,
};

#[derive(Parser, Debug)]
#[command(name = "claw-sync")]
#[command(about = "Mirror cluster state from the admin API")]
#[command(version)]
struct Cli {
    /// Backend URL (overrides the config file)
    #[arg(long, env = "CLAW_SYNC_HOST")]
    host: Option<String>,

    /// Path to a JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Fixed poll interval in seconds; disables automatic adjustment
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    poll_rate: Option<u64>,

    /// Basic-auth user
    #[arg(long, env = "CLAW_SYNC_USER")]
    user: Option<String>,

    /// Basic-auth password
    #[arg(long, env = "CLAW_SYNC_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Directory for the persisted error log
    #[arg(long)]
    error_log_dir: Option<PathBuf>,

    /// Accept self-signed TLS certificates
    #[arg(long)]
    insecure: bool,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = Format::Table)]
    format: Format,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
enum Format {
    #[default]
    Table,
    Json,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Commands {
    /// Sync continuously and log changes until interrupted
    Watch,

    /// Load everything once and print a summary
    Snapshot,

    /// Show or clear the persisted error log
    Errors {
        /// Delete all recorded errors
        #[arg(long)]
        clear: bool,
    },
}

#[derive(Debug, Serialize)]
struct Snapshot {
    counts: BTreeMap<String, usize>,
    features: FeatureFlags,
    tenants: usize,
    wizards: Vec<WizardEntry>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(EnvFilter::from_default_env().add_directive("claw_sync=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = build_config(&cli)?;

    match cli.command {
        Commands::Watch => watch(config, cli.poll_rate).await?,
        Commands::Snapshot => snapshot(config, cli.format).await?,
        Commands::Errors { clear } => errors(&config, clear, cli.format)?,
    }

    Ok(())
}

fn build_config(cli: &Cli) -> anyhow::Result<SyncConfig> {
    let mut config = match &cli.config {
        Some(path) => SyncConfig::from_file(path)?,
        None => SyncConfig::default(),
    };
    if let Some(host) = &cli.host {
        config.host.clone_from(host);
    }
    if let Some(user) = &cli.user {
        config = config.with_credentials(user, cli.password.clone().unwrap_or_default());
    }
    if let Some(dir) = &cli.error_log_dir {
        config = config.with_error_log_dir(dir);
    }
    if cli.insecure {
        config = config.with_accept_invalid_certs(true);
    }
    config.validate()?;
    Ok(config)
}

async fn watch(config: SyncConfig, poll_rate: Option<u64>) -> anyhow::Result<()> {
    let backend = HttpBackend::from_config(&config)?;
    let engine = SyncEngine::new(backend, config)?;
    if let Some(secs) = poll_rate {
        engine.set_poll_rate(Duration::from_secs(secs))?;
    }

    let mut events = engine.notifier().events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SyncEvent::EntityDone(key)) => info!(%key, "entity updated"),
                Ok(SyncEvent::CollectionDone(kind)) => info!(%kind, "collection loaded"),
                Ok(SyncEvent::ReloadFinished) => {}
                Ok(SyncEvent::Notice(message)) => info!(%message, "notice"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event log fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let cycle = engine.start().await;
    info!(
        executed = cycle.drain.executed,
        nodes = engine.store().len(EntityKind::Node),
        "initial sync complete"
    );

    engine
        .run(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received SIGINT, shutting down");
            }
        })
        .await;
    Ok(())
}

async fn snapshot(config: SyncConfig, format: Format) -> anyhow::Result<()> {
    let backend = HttpBackend::from_config(&config)?;
    let engine = SyncEngine::new(backend, config)?;
    engine.start().await;

    let store = engine.store();
    let snapshot = Snapshot {
        counts: EntityKind::ALL
            .into_iter()
            .map(|kind| (kind.plural().to_string(), store.len(kind)))
            .collect(),
        features: engine.features(),
        tenants: engine.tenants().tenants.len(),
        wizards: store.wizards(),
    };

    let mut stdout = io::stdout().lock();
    match format {
        Format::Json => {
            serde_json::to_writer_pretty(&mut stdout, &snapshot)?;
            writeln!(stdout)?;
        }
        Format::Table => {
            writeln!(stdout, "{:<20} {:>6}", "KIND", "COUNT")?;
            for (kind, count) in &snapshot.counts {
                writeln!(stdout, "{kind:<20} {count:>6}")?;
            }
            let enabled: Vec<_> = snapshot
                .features
                .iter_enabled()
                .map(|s| s.service_name())
                .collect();
            writeln!(stdout)?;
            let subsystems = if enabled.is_empty() {
                "none".to_string()
            } else {
                enabled.join(", ")
            };
            writeln!(stdout, "subsystems: {subsystems}")?;
            for wizard in &snapshot.wizards {
                writeln!(stdout, "wizard: {} ({})", wizard.title, wizard.path)?;
            }
        }
    }
    Ok(())
}

fn errors(config: &SyncConfig, clear: bool, format: Format) -> anyhow::Result<()> {
    let Some(dir) = &config.error_log_dir else {
        anyhow::bail!("no error log directory configured (use --error-log-dir)");
    };
    let log = ErrorLog::persistent(dir, config.max_error_entries);

    if clear {
        log.clear()?;
        println!("error log cleared");
        return Ok(());
    }

    let mut stdout = io::stdout().lock();
    let entries = log.entries();
    match format {
        Format::Json => {
            serde_json::to_writer_pretty(&mut stdout, &entries)?;
            writeln!(stdout)?;
        }
        Format::Table => {
            if entries.is_empty() {
                writeln!(stdout, "no errors recorded")?;
            }
            for entry in &entries {
                writeln!(
                    stdout,
                    "{} [{}] {} ({})",
                    entry.recorded_at.to_rfc3339(),
                    entry.kind,
                    entry.message,
                    entry.origin
                )?;
            }
        }
    }
    Ok(())
}
