//! Logging: console diagnostics through `tracing`, and the durable run log
//! whose tail is mailed to the operator when something goes wrong.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::Local;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Initialize console logging with the specified level. `RUST_LOG` takes precedence.
pub fn init(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()?;

    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warn,
    Error,
}

impl Level {
    fn as_str(self) -> &'static str {
        match self {
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }
}

/// Lines kept for `tail` when the log file could not be opened.
const MEMORY_LINES: usize = 1000;

enum Sink {
    File(File),
    Memory(VecDeque<String>),
}

/// Append-only, timestamped log file shared by every task of a run.
pub struct RunLog {
    path: PathBuf,
    sink: Mutex<Sink>,
}

impl RunLog {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            sink: Mutex::new(Sink::File(file)),
        })
    }

    /// Like [`RunLog::open`], but an unusable log file never stops the run: lines then
    /// only go to `tracing` and an in-memory ring that still serves `tail`.
    pub fn open_or_memory(path: &Path) -> Self {
        match Self::open(path) {
            Ok(log) => log,
            Err(e) => {
                tracing::error!(
                    "Failed to open log file {}, keeping the run log in memory: {}",
                    path.display(),
                    e
                );
                Self {
                    path: path.to_path_buf(),
                    sink: Mutex::new(Sink::Memory(VecDeque::with_capacity(MEMORY_LINES))),
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// False when the log file could not be opened.
    pub fn is_durable(&self) -> bool {
        matches!(*self.lock(), Sink::File(_))
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.append(Level::Info, message.as_ref());
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        self.append(Level::Warn, message.as_ref());
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.append(Level::Error, message.as_ref());
    }

    fn append(&self, level: Level, message: &str) {
        match level {
            Level::Info => tracing::info!("{}", message),
            Level::Warn => tracing::warn!("{}", message),
            Level::Error => tracing::error!("{}", message),
        }

        // continuation lines of multi-line diagnostics stay visually attached
        let message = message.trim_end().replace('\n', "\n    ");
        let line = format!(
            "[{}] {} {}\n",
            Local::now().format(TIMESTAMP_FORMAT),
            level.as_str(),
            message
        );

        match &mut *self.lock() {
            Sink::File(file) => {
                if let Err(e) = file.write_all(line.as_bytes()).and_then(|_| file.flush()) {
                    tracing::warn!("Failed to append to run log {}: {}", self.path.display(), e);
                }
            }
            Sink::Memory(ring) => {
                for physical in line.lines() {
                    if ring.len() == MEMORY_LINES {
                        ring.pop_front();
                    }
                    ring.push_back(physical.to_string());
                }
            }
        }
    }

    /// The last `lines` lines of the log, oldest first.
    pub fn tail(&self, lines: usize) -> Vec<String> {
        if lines == 0 {
            return Vec::new();
        }

        // hold the writer lock so a half-written line is never read
        let guard = self.lock();
        if let Sink::Memory(ring) = &*guard {
            let skip = ring.len().saturating_sub(lines);
            return ring.iter().skip(skip).cloned().collect();
        }

        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!("Failed to read run log {}: {}", self.path.display(), e);
                return Vec::new();
            }
        };

        let mut tail = VecDeque::with_capacity(lines);
        for line in BufReader::new(file).lines().map_while(std::io::Result::ok) {
            if tail.len() == lines {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        Vec::from(tail)
    }

    fn lock(&self) -> MutexGuard<'_, Sink> {
        self.sink.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
