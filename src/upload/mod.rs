pub(crate) mod rclone;
pub(crate) mod s3_upload;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::backup::{Artifact, StageStatus};
use crate::config::RemoteTarget;
use crate::errors::Result;
use crate::run::{StageResult, TaskId};
use crate::utils::logger::RunLog;

pub use rclone::RcloneTransfer;
pub use s3_upload::S3Transfer;

/// Copies a local file to remote storage. Never modifies or removes the local file.
#[async_trait]
pub trait RemoteTransfer: Send + Sync {
    /// Returns the remote location the file now lives at.
    async fn copy(&self, local_path: &Path, cancel: &CancellationToken) -> Result<String>;

    /// Human readable remote location, for logs and notifications.
    fn location(&self) -> String;
}

/// Picks the transfer implementation for the configured remote.
pub fn transfer_for(remote: &RemoteTarget) -> Arc<dyn RemoteTransfer> {
    match remote {
        RemoteTarget::S3(spaces) => Arc::new(S3Transfer::new(spaces.clone())),
        RemoteTarget::Rclone {
            destination,
            binary,
        } => Arc::new(RcloneTransfer::new(destination.clone(), binary.clone())),
    }
}

pub struct UploadTask<'a> {
    transfer: &'a dyn RemoteTransfer,
    log: &'a RunLog,
}

impl<'a> UploadTask<'a> {
    pub fn new(transfer: &'a dyn RemoteTransfer, log: &'a RunLog) -> Self {
        Self { transfer, log }
    }

    /// Ships one artifact. Only succeeded artifacts are attempted, anything else is
    /// reported as a failed result without touching the transport.
    pub async fn execute(&self, artifact: &Artifact, cancel: &CancellationToken) -> StageResult {
        let task = TaskId::Upload(artifact.kind);

        if artifact.status != StageStatus::Succeeded {
            let detail = format!(
                "{} was not produced ({:?}), nothing to upload",
                artifact.file_name(),
                artifact.status
            );
            self.log.error(format!("Refusing upload: {}", detail));
            return StageResult::failed(task, detail);
        }

        self.log.info(format!(
            "Uploading {} to {}",
            artifact.file_name(),
            self.transfer.location()
        ));

        match self.transfer.copy(&artifact.path, cancel).await {
            Ok(remote) => {
                self.log
                    .info(format!("Uploaded {} to {}", artifact.file_name(), remote));
                StageResult::succeeded(task, remote)
            }
            Err(e) => {
                self.log
                    .error(format!("Upload of {} failed: {}", artifact.file_name(), e));
                StageResult::failed(task, e.to_string())
            }
        }
    }
}
