//! Ledger verification CLI
//!
//! Verifies individual events (hash, signature, batch and inclusion proof)
//! or walks the whole hash chain. Exits non-zero on any tamper signal.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::error;

use audit_ledger::config::AppConfig;
use audit_ledger::verify::{VerificationStatus, Verifier};

#[derive(Parser)]
#[command(name = "ledger-verify")]
#[command(about = "Verify audit ledger events and chain integrity")]
struct Cli {
    /// Configuration file (TOML or YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Event ids to verify
    #[arg(short, long = "event")]
    events: Vec<String>,

    /// Walk and check the full chain
    #[arg(long)]
    chain: bool,

    /// Rows fetched per page during the chain walk
    #[arg(long, default_value_t = 1000)]
    page_size: usize,

    /// Skip Merkle inclusion proofs against stored artifacts
    #[arg(long)]
    no_inclusion: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;

    let mut verifier = Verifier::new(
        config.connect_store().await?,
        config.build_signer()?,
        config.canonicalizer()?,
    )
    .with_policy(config.retry_policy());
    if !cli.no_inclusion {
        verifier = verifier.with_object_store(config.build_object_store()?);
    }

    let mut failed = false;

    for event_id in &cli.events {
        match verifier.verify(event_id).await {
            Ok(report) => {
                println!("{}", serde_json::to_string_pretty(&report)?);
                if matches!(
                    report.status(),
                    VerificationStatus::TamperDetected | VerificationStatus::Inconsistent
                ) {
                    failed = true;
                }
            }
            Err(e) => {
                error!("Could not verify {}: {}", event_id, e);
                failed = true;
            }
        }
    }

    if cli.chain {
        let report = verifier.verify_chain(cli.page_size).await?;
        println!("{}", report.summary());
        for link in &report.broken_links {
            println!("  broken link at {} ({}): {}", link.append_order, link.event_id, link.description);
        }
        for id in &report.tampered {
            println!("  tampered: {}", id);
        }
        failed |= !report.is_valid();
    }

    if failed {
        std::process::exit(1);
    }
    Ok(())
}
