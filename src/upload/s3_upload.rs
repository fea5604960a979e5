// pgbackup/src/upload/s3_upload.rs
use std::path::Path;

use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::Region;
use s3::error::DisplayErrorContext;
use s3::primitives::ByteStream;
use tokio_util::sync::CancellationToken;

use crate::config::SpacesConfig;
use crate::errors::{AppError, Result};
use crate::upload::RemoteTransfer;
use crate::utils::cancellable;

/// Uploads to an S3-compatible object storage service (AWS, DigitalOcean Spaces, MinIO).
pub struct S3Transfer {
    spaces_config: SpacesConfig,
}

impl S3Transfer {
    pub fn new(spaces_config: SpacesConfig) -> Self {
        Self { spaces_config }
    }

    async fn client(&self) -> s3::Client {
        let spaces_config = &self.spaces_config;
        let sdk_config = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .endpoint_url(&spaces_config.endpoint_url)
            .region(Region::new(spaces_config.region.clone()))
            .credentials_provider(s3::config::Credentials::new(
                &spaces_config.access_key_id,
                &spaces_config.secret_access_key,
                None, // session_token
                None, // expiry
                "Static",
            ))
            .load()
            .await;

        s3::Client::new(&sdk_config)
    }

    async fn put(&self, file_path: &Path, s3_key: &str) -> Result<()> {
        let client = self.client().await;

        let body = ByteStream::from_path(file_path).await.map_err(|e| {
            AppError::S3Sdk(format!(
                "Failed to read {} for upload: {}",
                file_path.display(),
                e
            ))
        })?;

        client
            .put_object()
            .bucket(&self.spaces_config.bucket_name)
            .key(s3_key)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                AppError::S3Sdk(format!(
                    "Failed to upload {} to bucket {} with key {}: {}",
                    file_path.display(),
                    self.spaces_config.bucket_name,
                    s3_key,
                    DisplayErrorContext(&e)
                ))
            })?;

        Ok(())
    }
}

#[async_trait]
impl RemoteTransfer for S3Transfer {
    async fn copy(&self, local_path: &Path, cancel: &CancellationToken) -> Result<String> {
        let file_name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                AppError::S3Sdk(format!("{} has no file name", local_path.display()))
            })?;
        let s3_key = self.spaces_config.object_key(&file_name);

        tracing::debug!(
            "Uploading {} to S3 bucket {} with key {}",
            local_path.display(),
            self.spaces_config.bucket_name,
            s3_key
        );
        cancellable(cancel, "S3 upload", self.put(local_path, &s3_key)).await?;

        Ok(format!("s3://{}/{}", self.spaces_config.bucket_name, s3_key))
    }

    fn location(&self) -> String {
        self.spaces_config.location()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spaces(prefix: Option<&str>) -> SpacesConfig {
        SpacesConfig {
            endpoint_url: "http://127.0.0.1:9".to_string(),
            region: "us-east-1".to_string(),
            access_key_id: "key".to_string(),
            secret_access_key: "secret".to_string(),
            bucket_name: "pg-backups".to_string(),
            folder_prefix: prefix.map(str::to_string),
        }
    }

    #[test]
    fn test_location_includes_prefix() {
        assert_eq!(S3Transfer::new(spaces(Some("db1/"))).location(), "s3://pg-backups/db1");
        assert_eq!(S3Transfer::new(spaces(None)).location(), "s3://pg-backups");
    }

    #[tokio::test]
    async fn test_missing_local_file_fails_before_network() {
        let dir = tempfile::tempdir().unwrap();
        let transfer = S3Transfer::new(spaces(None));
        let res = transfer
            .copy(&dir.path().join("absent.dump"), &CancellationToken::new())
            .await;
        assert!(matches!(res, Err(AppError::S3Sdk(msg)) if msg.contains("absent.dump")));
    }
}
