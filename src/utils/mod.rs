pub mod logger;
pub mod setting;

use std::future::Future;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use tokio_util::sync::CancellationToken;
use which::which;

use crate::errors::{AppError, Result};

/// Source of the run timestamp.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Resolves `program` to an absolute path. An explicit `configured` path wins.
pub fn find_executable(program: &str, configured: Option<&Path>) -> Result<PathBuf> {
    match configured {
        Some(path) => Ok(which(path)?),
        None => Ok(which(program)?),
    }
}

/// Runs `fut` unless `cancel` fires first.
pub async fn cancellable<T, F>(cancel: &CancellationToken, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        // a token cancelled before the call always wins
        biased;
        _ = cancel.cancelled() => Err(AppError::Cancelled(what.to_string())),
        res = fut => res,
    }
}

/// Human readable size, the way `du -h` prints it.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "K", "M", "G", "T"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{}{}", bytes, UNITS[0])
    } else {
        format!("{:.1}{}", value, UNITS[unit])
    }
}
