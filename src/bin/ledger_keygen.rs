//! Signing key generator
//!
//! Creates a secp256k1 key file for the local signer and prints the key id
//! and public key to register with verifiers.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use audit_ledger::crypto::KeyMaterial;

#[derive(Parser)]
#[command(name = "ledger-keygen")]
#[command(about = "Generate a local ledger signing key")]
struct Cli {
    /// Where to write the hex-encoded secret key (must not exist)
    #[arg(short, long)]
    output: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let key = KeyMaterial::generate();
    key.save(&cli.output)?;

    println!("Key written to {}", cli.output.display());
    println!("key_id:     {}", key.key_id);
    println!("public_key: {}", key.public_key_hex());
    Ok(())
}
