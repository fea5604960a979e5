use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("AWS SDK S3 error: {0}")]
    S3Sdk(String),

    // stderr is kept verbatim so the operator sees the tool's own words
    #[error("{program} exited with {status}: {stderr}")]
    Command {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("Directory walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Executable not found: {0}")]
    MissingExecutable(#[from] which::Error),

    #[error("Data directory {} does not exist or is not a directory", .0.display())]
    MissingDataDirectory(PathBuf),

    #[error("Message transport error: {0}")]
    Transport(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl AppError {
    /// Builds a [`AppError::Command`] from a finished process that reported failure.
    pub fn command(program: &str, output: &std::process::Output) -> Self {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let stderr = if stderr.is_empty() {
            String::from_utf8_lossy(&output.stdout).trim().to_string()
        } else {
            stderr
        };
        AppError::Command {
            program: program.to_string(),
            status: output.status.to_string(),
            stderr,
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
