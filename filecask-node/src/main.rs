//! Filecask Node - Encrypted File Repository Daemon
//!
//! Runs the repository's periodic maintenance (expiration sweep, compaction)
//! and offers operational subcommands for saving, fetching and inspecting
//! stored files. Ledger consensus and peer transport live elsewhere; this
//! binary only drives the repository core.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use filecask_core::{
    ContentHash, PendingFileTracker, RepositoryConfig, RepositoryManager, StoredRecord,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Filecask Node Configuration
#[derive(Parser, Debug)]
#[command(name = "filecask")]
#[command(author = "Filecask Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Encrypted file repository node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the maintenance schedulers until interrupted
    Start {
        /// Repository root directory
        #[arg(short, long, default_value = "./data/repo")]
        dir: PathBuf,

        /// Enable debug logging
        #[arg(long)]
        debug: bool,
    },

    /// Initialize a new repository with a default config file
    Init {
        /// Repository path
        dir: PathBuf,
    },

    /// Print aggregate state and diagnostics as JSON
    Status {
        #[arg(short, long, default_value = "./data/repo")]
        dir: PathBuf,
    },

    /// Store a file's bytes (already-encrypted blob) in the repository
    Save {
        #[arg(short, long, default_value = "./data/repo")]
        dir: PathBuf,

        /// File whose bytes should be stored
        path: PathBuf,

        /// Days until the record may be expired by peers
        #[arg(long, default_value_t = 30)]
        expires_days: i64,
    },

    /// Fetch a stored blob by content hash
    Get {
        #[arg(short, long, default_value = "./data/repo")]
        dir: PathBuf,

        /// Content hash (hex)
        hash: String,

        /// Output file
        out: PathBuf,
    },
}

fn init_tracing(debug: bool) {
    let env_filter = if debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { dir, debug } => {
            init_tracing(debug);
            info!("Starting filecask node");
            info!("Repository root: {}", dir.display());

            let config = RepositoryConfig::load(&dir)?;
            let expiry_interval = Duration::from_secs(config.expiry_sweep_secs);
            let compaction_interval = Duration::from_secs(config.compaction_sweep_secs);

            let manager = Arc::new(
                RepositoryManager::open(config).context("Failed to open repository")?,
            );
            info!("Repository opened at {}", dir.display());

            // Expiration sweep. When a ledger engine is wired in, its lock
            // must be taken before any repository call, never after.
            {
                let manager = manager.clone();
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(expiry_interval);
                    ticker.tick().await;
                    loop {
                        ticker.tick().await;
                        let manager = manager.clone();
                        let result = tokio::task::spawn_blocking(move || {
                            let now = chrono::Utc::now().timestamp();
                            manager.find_and_recycle_expired(now)
                        })
                        .await;
                        match result {
                            Ok(Ok(recycled)) if recycled > 0 => {
                                info!(recycled, "expiration sweep recycled files")
                            }
                            Ok(Ok(_)) => {}
                            // log and retry at the next tick
                            Ok(Err(e)) => warn!("expiration sweep failed: {e}"),
                            Err(e) => error!("expiration sweep panicked: {e}"),
                        }
                    }
                });
            }

            // Compaction check.
            {
                let manager = manager.clone();
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(compaction_interval);
                    ticker.tick().await;
                    loop {
                        ticker.tick().await;
                        let manager = manager.clone();
                        let result =
                            tokio::task::spawn_blocking(move || manager.compact()).await;
                        match result {
                            Ok(Ok(true)) => info!("compaction pass completed"),
                            Ok(Ok(false)) => {}
                            Ok(Err(e)) => warn!("compaction failed: {e}"),
                            Err(e) => error!("compaction panicked: {e}"),
                        }
                    }
                });
            }

            info!("Maintenance schedulers running, press ctrl-c to stop");
            tokio::signal::ctrl_c().await?;

            info!("Shutting down, flushing repository");
            let manager = manager.clone();
            tokio::task::spawn_blocking(move || manager.flush())
                .await?
                .context("Failed to flush repository")?;
            Ok(())
        }

        Commands::Init { dir } => {
            init_tracing(false);
            let config = RepositoryConfig::new(&dir);
            config.save()?;
            let _ = RepositoryManager::open(config).context("Failed to create repository")?;
            info!("Repository initialized at {}", dir.display());
            Ok(())
        }

        Commands::Status { dir } => {
            init_tracing(false);
            let config = RepositoryConfig::load(&dir)?;
            let manager = RepositoryManager::open(config)?;
            let tracker = PendingFileTracker::new();

            let status = serde_json::json!({
                "aggregate": manager.aggregate(),
                "needs_compaction": manager.needs_compaction(),
                "diagnostics": tracker.diagnostics(&manager),
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }

        Commands::Save {
            dir,
            path,
            expires_days,
        } => {
            init_tracing(false);
            let config = RepositoryConfig::load(&dir)?;
            let manager = RepositoryManager::open(config)?;

            let bytes = std::fs::read(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let expires_at = chrono::Utc::now().timestamp() + expires_days * 24 * 60 * 60;
            let mut record = StoredRecord::new(bytes, expires_at, true);
            let pos = manager.save(&mut record)?;
            manager.flush()?;

            println!("{} stored at {}", record.hash, pos);
            Ok(())
        }

        Commands::Get { dir, hash, out } => {
            init_tracing(false);
            let config = RepositoryConfig::load(&dir)?;
            let manager = RepositoryManager::open(config)?;

            let hash = ContentHash::from_hex(&hash).context("Invalid content hash")?;
            let payload = manager.read_payload(&hash)?;
            std::fs::write(&out, &payload)
                .with_context(|| format!("Failed to write {}", out.display()))?;

            println!("{} bytes written to {}", payload.len(), out.display());
            Ok(())
        }
    }
}
