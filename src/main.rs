use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use audit_ledger::anchor::{spawn_anchor_workers, BatchAnchorer};
use audit_ledger::config::AppConfig;
use audit_ledger::ledger::LedgerWriter;

#[derive(Parser)]
#[command(name = "audit-ledger")]
#[command(about = "Tamper-evident append-only audit ledger")]
struct Cli {
    /// Configuration file (TOML or YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Append newline-delimited event messages read from stdin
    #[arg(long)]
    ingest_stdin: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "audit_ledger=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    info!("Starting audit ledger");

    let config = AppConfig::load(cli.config.as_deref())?;
    info!("Configuration loaded");

    let store = config.connect_store().await?;
    info!("Ledger store ready");

    let signer = config.build_signer()?;
    let objects = config.build_object_store()?;
    let writer = LedgerWriter::new(
        store.clone(),
        signer.clone(),
        config.canonicalizer()?,
        config.writer_config(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let workers = if config.anchor.enabled {
        let anchorer = Arc::new(BatchAnchorer::new(
            store.clone(),
            objects,
            signer,
            config.anchor_config(),
        ));
        spawn_anchor_workers(anchorer, config.anchor.workers, shutdown_rx.clone())
    } else {
        info!("Anchoring disabled");
        Vec::new()
    };

    if cli.ingest_stdin {
        let writer = writer.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        error!("Failed to read event from stdin: {}", e);
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match writer.append_message(line.as_bytes()).await {
                    Ok(outcome) if outcome.already_recorded => {
                        info!("Event {} already recorded", outcome.event.id)
                    }
                    Ok(_) => {}
                    Err(e) if e.is_retryable() => warn!("Event not recorded, retry later: {}", e),
                    Err(e) => error!("Event rejected: {}", e),
                }
            }
            info!("Stdin ingestion finished");
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    let _ = shutdown_tx.send(true);

    for worker in workers {
        if let Err(e) = worker.await {
            error!("Anchor worker ended abnormally: {}", e);
        }
    }

    info!("Audit ledger stopped");
    Ok(())
}
