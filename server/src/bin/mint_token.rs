//! Credential tokens for local testing
//!
//! Usage:
//!   cargo run --bin mint-token -- keygen
//!   cargo run --bin mint-token -- sign --secret <hex> --wallet A --tokens 100 --punches 50 --referred-by B
//!
//! `keygen` prints a signing secret and the verifying key to pass to the
//! server as `--verifying-key`. `sign` prints a token for `POST /api/wallet`.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ed25519_dalek::SigningKey;
use punchcard_server::sign_token;
use punchcard_types::{Claims, ProgressReport};
use rand::rngs::OsRng;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Parser, Debug)]
#[command(name = "mint-token")]
#[command(about = "Generate token keys and sign progress reports")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a new Ed25519 keypair
    Keygen,
    /// Sign a progress report
    Sign {
        /// Hex-encoded 32-byte signing secret
        #[arg(long)]
        secret: String,

        #[arg(long)]
        wallet: String,

        #[arg(long)]
        tokens: Option<i64>,

        #[arg(long)]
        punches: Option<i64>,

        #[arg(long)]
        referred_by: Option<String>,

        #[arg(long)]
        character_name: Option<String>,

        /// Seconds until the token expires (no expiry when omitted)
        #[arg(long)]
        ttl: Option<u64>,
    },
}

fn main() {
    if let Err(err) = run() {
        eprintln!("mint-token failed: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    match Args::parse().command {
        Command::Keygen => {
            let signing = SigningKey::generate(&mut OsRng);
            println!("secret:        {}", hex::encode(signing.to_bytes()));
            println!(
                "verifying key: {}",
                hex::encode(signing.verifying_key().as_bytes())
            );
        }
        Command::Sign {
            secret,
            wallet,
            tokens,
            punches,
            referred_by,
            character_name,
            ttl,
        } => {
            let secret: [u8; 32] = hex::decode(secret.trim())
                .context("secret is not hex")?
                .try_into()
                .map_err(|_| anyhow::anyhow!("secret must be 32 bytes"))?;
            let signing = SigningKey::from_bytes(&secret);

            let mut claims = Claims::new(
                wallet,
                ProgressReport {
                    tokens,
                    punches,
                    referred_by,
                    character_name,
                },
            );
            if let Some(ttl) = ttl {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .context("system clock before unix epoch")?
                    .as_secs();
                claims = claims.with_expiry(now.saturating_add(ttl));
            }
            println!("{}", sign_token(&signing, &claims)?);
        }
    }
    Ok(())
}
