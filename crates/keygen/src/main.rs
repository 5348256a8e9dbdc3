#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Passgate key generator
//!
//! Writes the RSA key pair used to sign and verify access tokens.

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use passgate_api::{
    auth::{generate_rsa_key_pair, FsKeyStore, KeyGenError, RsaKeyLength},
    Config,
};

/// Generate the RSA key pair for token signing
#[derive(Parser, Debug)]
#[command(name = "passgate-keygen", version, about)]
struct Args {
    /// Key length in bits (2048, 3072 or 4096)
    #[arg(long, default_value_t = 4096)]
    length: usize,

    /// Overwrite existing keys
    #[arg(long)]
    force: bool,
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,passgate_api=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let length = RsaKeyLength::try_from(args.length)?;

    let config = Config::from_env()?;
    let keys = &config.jwt.keys;
    let store = FsKeyStore::new(keys.keys_path.clone());

    match generate_rsa_key_pair(&store, keys, length, args.force) {
        Ok(()) => {
            tracing::info!(path = %store.root().display(), "Encryption keys generated successfully.");
            Ok(())
        }
        Err(KeyGenError::AlreadyExists) => {
            tracing::error!("{}", KeyGenError::AlreadyExists);
            std::process::exit(1);
        }
        Err(e) => Err(e).context("failed to generate encryption keys"),
    }
}
