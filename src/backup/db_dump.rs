// pgbackup/src/backup/db_dump.rs
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::{DatabaseIdentity, DumpFormat};
use crate::errors::{AppError, Result};
use crate::utils::{cancellable, find_executable};

/// Produces a logical export of one database into a single file.
#[async_trait]
pub trait DumpMechanism: Send + Sync {
    async fn dump(
        &self,
        identity: &DatabaseIdentity,
        format: DumpFormat,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// Shells out to `pg_dump`.
#[derive(Debug)]
pub struct PgDump {
    binary: Option<PathBuf>,
}

impl PgDump {
    /// `binary` overrides the `pg_dump` found on `PATH`.
    pub fn new(binary: Option<PathBuf>) -> Self {
        Self { binary }
    }
}

/// Arguments for `pg_dump`. The password never appears here, it travels in `PGPASSWORD`.
fn pg_dump_args(identity: &DatabaseIdentity, format: DumpFormat, destination: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "--host".into(),
        identity.host.clone().into(),
        "--port".into(),
        identity.port.to_string().into(),
        "--username".into(),
        identity.user.clone().into(),
        "--no-password".into(),
        "--format".into(),
        format.pg_dump_flag().into(),
        "--file".into(),
    ];
    args.push(destination.as_os_str().to_os_string());
    args.push(identity.name.clone().into());
    args
}

#[async_trait]
impl DumpMechanism for PgDump {
    async fn dump(
        &self,
        identity: &DatabaseIdentity,
        format: DumpFormat,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let pg_dump_path = find_executable("pg_dump", self.binary.as_deref())?;
        tracing::debug!(
            "Dumping {} with {} to {}",
            identity.redacted_url(),
            pg_dump_path.display(),
            destination.display()
        );

        let mut cmd = Command::new(&pg_dump_path);
        cmd.args(pg_dump_args(identity, format, destination))
            .kill_on_drop(true);
        if let Some(password) = &identity.password {
            cmd.env("PGPASSWORD", password);
        }

        let output = cancellable(cancel, "pg_dump", async {
            cmd.output().await.map_err(AppError::from)
        })
        .await?;

        if !output.status.success() {
            return Err(AppError::command("pg_dump", &output));
        }
        Ok(())
    }
}
