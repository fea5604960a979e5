//! PostgreSQL backup runner
//!
//! Takes a logical and a physical backup, ships both to remote storage, mails the operator
//! and prunes old local backups. Meant to be started by cron or a systemd timer.

// pgbackup/src/main.rs
mod backup;
mod config;
mod errors;
mod notify;
mod orchestrator;
mod retention;
mod run;
mod upload;
mod utils;

use anyhow::{Context, Result};
use config::BackupCycleConfig;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;

const DEFAULT_CONFIG_PATH: &str = "config.json";

#[tokio::main]
async fn main() -> ExitCode {
    match run_app().await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<u8> {
    dotenv::dotenv().ok();

    let config_path = config_path();
    let config = BackupCycleConfig::load_from_json(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;
    utils::logger::init(&config.log_level).context("Failed to initialise logging")?;

    let cancel = CancellationToken::new();
    if let Some(limit) = config.run_timeout {
        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            tracing::warn!("Run timeout of {}s reached, cancelling", limit.as_secs());
            token.cancel();
        });
    }
    {
        let token = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, cancelling");
                token.cancel();
            }
        });
    }

    Ok(orchestrator::run_backup_cycle(&config, &cancel).await)
}

/// First CLI argument, then `PGBACKUP_CONFIG`, then `config.json` in the working directory.
fn config_path() -> PathBuf {
    env::args()
        .nth(1)
        .or_else(|| env::var("PGBACKUP_CONFIG").ok())
        .filter(|p| !p.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}
