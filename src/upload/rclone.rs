use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::errors::{AppError, Result};
use crate::upload::RemoteTransfer;
use crate::utils::{cancellable, find_executable};

/// Copies files to any rclone remote (`name:path`) with `rclone copy`.
pub struct RcloneTransfer {
    destination: String,
    binary: Option<PathBuf>,
}

impl RcloneTransfer {
    pub fn new(destination: String, binary: Option<PathBuf>) -> Self {
        Self {
            destination,
            binary,
        }
    }

    fn remote_path(&self, local_path: &Path) -> String {
        let file_name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        format!("{}/{}", self.destination.trim_end_matches('/'), file_name)
    }
}

#[async_trait]
impl RemoteTransfer for RcloneTransfer {
    async fn copy(&self, local_path: &Path, cancel: &CancellationToken) -> Result<String> {
        let rclone = find_executable("rclone", self.binary.as_deref())?;

        let mut cmd = Command::new(&rclone);
        cmd.arg("copy")
            .arg(local_path)
            .arg(&self.destination)
            .kill_on_drop(true);

        let output = cancellable(cancel, "rclone copy", async {
            cmd.output().await.map_err(AppError::from)
        })
        .await?;

        if !output.status.success() {
            return Err(AppError::command("rclone", &output));
        }
        Ok(self.remote_path(local_path))
    }

    fn location(&self) -> String {
        self.destination.clone()
    }
}
