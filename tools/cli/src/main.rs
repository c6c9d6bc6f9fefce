//! MQVault - encrypted secret store served over stdin/stdout.
//!
//! Reads one JSON request per line on stdin and answers each on stdout.
//! Logs go to stderr.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use mqvault_app::{App, AppConfig};
use mqvault_crypto::KdfParams;

#[derive(Parser, Debug)]
#[command(name = "mqvault")]
#[command(about = "MQVault - Encrypted secret store")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Vault directory for the local backend.
    #[arg(long, env = "MQVAULT_DIR")]
    vault: Option<PathBuf>,

    /// Storage backend: "local" or "memory".
    #[arg(short, long)]
    backend: Option<String>,

    /// JSON configuration file. Flags override its values.
    #[arg(short, long, env = "MQVAULT_CONFIG")]
    config: Option<PathBuf>,

    /// Seconds of inactivity before the vault locks itself (0 disables).
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Limit for each storage call in milliseconds (0 disables).
    #[arg(long)]
    io_timeout: Option<u64>,

    /// KDF strength for new keys: "interactive", "moderate", or "sensitive".
    #[arg(long)]
    kdf: Option<String>,
}

impl Cli {
    /// Build the effective configuration: file first, then flags.
    fn into_config(self) -> Result<AppConfig> {
        let mut config = match &self.config {
            Some(path) => AppConfig::load(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => AppConfig::default(),
        };

        config.verbose |= self.verbose;
        if let Some(dir) = self.vault {
            config.vault_dir = dir;
        }
        if let Some(backend) = self.backend {
            config.backend = backend;
        }
        if let Some(secs) = self.idle_timeout {
            config.idle_timeout_secs = secs;
        }
        if let Some(ms) = self.io_timeout {
            config.io_timeout_ms = ms;
        }
        if let Some(name) = self.kdf {
            config.kdf = KdfParams::from_name(&name).with_context(|| {
                format!(
                    "Invalid KDF strength '{}'. Use: interactive, moderate, or sensitive",
                    name
                )
            })?;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = cli.into_config()?;
    info!(
        backend = %config.backend,
        vault = %config.vault_dir.display(),
        "Starting MQVault"
    );

    let app = App::new(config).context("Invalid configuration")?;
    app.run().await.context("Vault service failed")?;

    info!("Shut down cleanly");
    Ok(())
}
