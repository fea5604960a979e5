pub(crate) mod archive;
pub(crate) mod db_dump;

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::config::{DatabaseIdentity, DumpFormat};
use crate::errors::{AppError, Result};
use crate::run::{RUN_TIMESTAMP_FORMAT, StageResult, TaskId};
use crate::utils::format_size;
use crate::utils::logger::RunLog;
use crate::utils::setting::DatabaseServer;

pub use archive::{Archiver, TarGzArchiver};
pub use db_dump::{DumpMechanism, PgDump};

const PHYSICAL_PREFIX: &str = "pg_base_backup";
const PHYSICAL_EXTENSION: &str = "tar.gz";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Logical,
    Physical,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactKind::Logical => f.write_str("logical backup"),
            ArtifactKind::Physical => f.write_str("physical backup"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    NotStarted,
    Succeeded,
    Failed,
}

/// A file produced by a [`BackupTask`].
#[derive(Debug, Clone)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub path: PathBuf,
    /// Only known once the task succeeded.
    pub size: Option<u64>,
    pub status: StageStatus,
}

impl Artifact {
    pub fn new(kind: ArtifactKind, path: PathBuf) -> Self {
        Self {
            kind,
            path,
            size: None,
            status: StageStatus::NotStarted,
        }
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// Where the artifact of `kind` lives for a run started at `timestamp`.
pub fn artifact_path(
    backup_dir: &Path,
    database: &str,
    format: DumpFormat,
    kind: ArtifactKind,
    timestamp: &DateTime<Local>,
) -> PathBuf {
    let stamp = timestamp.format(RUN_TIMESTAMP_FORMAT);
    let file_name = match kind {
        ArtifactKind::Logical => format!("{}_{}.{}", database, stamp, format.extension()),
        ArtifactKind::Physical => format!("{}_{}.{}", PHYSICAL_PREFIX, stamp, PHYSICAL_EXTENSION),
    };
    backup_dir.join(file_name)
}

/// File name patterns of every artifact this tool may have written for `database`,
/// whatever dump format was configured at the time.
pub fn retention_patterns(database: &str) -> Result<Vec<Regex>> {
    let extensions = DumpFormat::ALL
        .iter()
        .map(|f| regex::escape(f.extension()))
        .collect::<Vec<_>>()
        .join("|");

    let logical = format!(r"^{}_\d{{8}}_\d{{6}}\.({})$", regex::escape(database), extensions);
    let physical = format!(
        r"^{}_\d{{8}}_\d{{6}}\.{}$",
        regex::escape(PHYSICAL_PREFIX),
        regex::escape(PHYSICAL_EXTENSION)
    );

    [logical, physical]
        .iter()
        .map(|p| Regex::new(p).map_err(|e| AppError::Config(format!("invalid artifact pattern: {}", e))))
        .collect()
}

/// Produces one artifact from the live database.
pub struct BackupTask<'a> {
    identity: &'a DatabaseIdentity,
    format: DumpFormat,
    server: &'a dyn DatabaseServer,
    dumper: &'a dyn DumpMechanism,
    archiver: &'a dyn Archiver,
    log: &'a RunLog,
}

impl<'a> BackupTask<'a> {
    pub fn new(
        identity: &'a DatabaseIdentity,
        format: DumpFormat,
        server: &'a dyn DatabaseServer,
        dumper: &'a dyn DumpMechanism,
        archiver: &'a dyn Archiver,
        log: &'a RunLog,
    ) -> Self {
        Self {
            identity,
            format,
            server,
            dumper,
            archiver,
            log,
        }
    }

    /// Runs the task for `artifact` and updates its status and size. Never returns an error:
    /// every failure ends up in the returned [`StageResult`].
    pub async fn execute(&self, artifact: &mut Artifact, cancel: &CancellationToken) -> StageResult {
        let task = TaskId::Backup(artifact.kind);
        self.log.info(format!(
            "Starting {} to {}",
            artifact.kind,
            artifact.path.display()
        ));

        match self.produce(artifact.kind, &artifact.path, cancel).await {
            Ok(size) => {
                artifact.size = Some(size);
                artifact.status = StageStatus::Succeeded;
                let detail = format!("{} ({})", artifact.file_name(), format_size(size));
                self.log.info(format!("{} completed: {}", capitalize(&artifact.kind.to_string()), detail));
                StageResult::succeeded(task, detail)
            }
            Err(e) => {
                artifact.status = StageStatus::Failed;
                self.log.error(format!("{} failed: {}", capitalize(&artifact.kind.to_string()), e));
                StageResult::failed(task, e.to_string())
            }
        }
    }

    async fn produce(
        &self,
        kind: ArtifactKind,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        match kind {
            ArtifactKind::Logical => {
                self.dumper
                    .dump(self.identity, self.format, destination, cancel)
                    .await?;
            }
            ArtifactKind::Physical => {
                // resolved on every run, the cluster may have been moved
                let data_dir = self.server.data_directory(self.identity, cancel).await?;
                self.log
                    .info(format!("PostgreSQL data directory: {}", data_dir.display()));

                let is_dir = tokio::fs::metadata(&data_dir)
                    .await
                    .map(|m| m.is_dir())
                    .unwrap_or(false);
                if !is_dir {
                    return Err(AppError::MissingDataDirectory(data_dir));
                }

                self.log.warn(
                    "Archiving the live data directory, the copy is not a consistent point-in-time snapshot",
                );
                self.archiver.archive(&data_dir, destination, cancel).await?;
            }
        }

        Ok(tokio::fs::metadata(destination).await?.len())
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;

    struct StubServer {
        data_dir: Option<PathBuf>,
    }

    #[async_trait]
    impl DatabaseServer for StubServer {
        async fn ping(&self, _: &DatabaseIdentity, _: &CancellationToken) -> Result<()> {
            Ok(())
        }

        async fn data_directory(&self, _: &DatabaseIdentity, _: &CancellationToken) -> Result<PathBuf> {
            self.data_dir
                .clone()
                .ok_or_else(|| AppError::Config("data_directory is not set".to_string()))
        }
    }

    struct StubDump {
        fail: bool,
    }

    #[async_trait]
    impl DumpMechanism for StubDump {
        async fn dump(
            &self,
            _: &DatabaseIdentity,
            _: DumpFormat,
            destination: &Path,
            _: &CancellationToken,
        ) -> Result<()> {
            if self.fail {
                return Err(AppError::Command {
                    program: "pg_dump".to_string(),
                    status: "exit status: 1".to_string(),
                    stderr: "pg_dump: error: connection to server failed".to_string(),
                });
            }
            tokio::fs::write(destination, b"PGDMP....").await?;
            Ok(())
        }
    }

    struct CopyArchiver;

    #[async_trait]
    impl Archiver for CopyArchiver {
        async fn archive(&self, _: &Path, destination: &Path, _: &CancellationToken) -> Result<()> {
            tokio::fs::write(destination, vec![0u8; 2048]).await?;
            Ok(())
        }
    }

    fn identity() -> DatabaseIdentity {
        DatabaseIdentity {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: None,
            name: "shop".to_string(),
        }
    }

    #[test]
    fn test_artifact_paths_are_deterministic() {
        let ts = Local.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let dir = Path::new("/var/backups/postgresql");

        let a = artifact_path(dir, "shop", DumpFormat::Custom, ArtifactKind::Logical, &ts);
        let b = artifact_path(dir, "shop", DumpFormat::Custom, ArtifactKind::Logical, &ts);
        assert_eq!(a, b);
        assert_eq!(a, dir.join("shop_20260102_030405.dump"));
        assert_eq!(
            artifact_path(dir, "shop", DumpFormat::Plain, ArtifactKind::Logical, &ts),
            dir.join("shop_20260102_030405.sql")
        );
        assert_eq!(
            artifact_path(dir, "shop", DumpFormat::Custom, ArtifactKind::Physical, &ts),
            dir.join("pg_base_backup_20260102_030405.tar.gz")
        );
    }

    #[test]
    fn test_retention_patterns_match_only_artifacts() {
        let patterns = retention_patterns("shop").unwrap();
        let matches = |name: &str| patterns.iter().any(|p| p.is_match(name));

        assert!(matches("shop_20260102_030405.dump"));
        assert!(matches("shop_20260102_030405.sql"));
        assert!(matches("shop_20260102_030405.tar"));
        assert!(matches("pg_base_backup_20260102_030405.tar.gz"));

        assert!(!matches("other_20260102_030405.dump"));
        assert!(!matches("shop_20260102_030405.dump.partial"));
        assert!(!matches("pgbackup.log"));
        assert!(!matches("pg_base_backup_latest.tar.gz"));
    }

    #[tokio::test]
    async fn test_logical_backup_populates_size() {
        let dir = tempfile::tempdir().unwrap();
        let log = RunLog::open(&dir.path().join("run.log")).unwrap();
        let (server, dumper, archiver) = (StubServer { data_dir: None }, StubDump { fail: false }, CopyArchiver);
        let id = identity();
        let task = BackupTask::new(&id, DumpFormat::Custom, &server, &dumper, &archiver, &log);

        let mut artifact = Artifact::new(ArtifactKind::Logical, dir.path().join("out/shop_1.dump"));
        let result = task.execute(&mut artifact, &CancellationToken::new()).await;

        assert!(result.success, "{}", result);
        assert_eq!(artifact.status, StageStatus::Succeeded);
        assert_eq!(artifact.size, Some(9));
        assert!(result.detail.contains("shop_1.dump"));
    }

    #[tokio::test]
    async fn test_dump_failure_keeps_diagnostic() {
        let dir = tempfile::tempdir().unwrap();
        let log = RunLog::open(&dir.path().join("run.log")).unwrap();
        let (server, dumper, archiver) = (StubServer { data_dir: None }, StubDump { fail: true }, CopyArchiver);
        let id = identity();
        let task = BackupTask::new(&id, DumpFormat::Custom, &server, &dumper, &archiver, &log);

        let mut artifact = Artifact::new(ArtifactKind::Logical, dir.path().join("shop_1.dump"));
        let result = task.execute(&mut artifact, &CancellationToken::new()).await;

        assert!(!result.success);
        assert_eq!(artifact.status, StageStatus::Failed);
        assert!(artifact.size.is_none());
        assert!(result.detail.contains("connection to server failed"));
        assert!(log.tail(1)[0].contains("Logical backup failed"));
    }

    #[tokio::test]
    async fn test_unresolvable_data_directory_fails_physical_backup() {
        let dir = tempfile::tempdir().unwrap();
        let log = RunLog::open(&dir.path().join("run.log")).unwrap();
        let (server, dumper, archiver) = (StubServer { data_dir: None }, StubDump { fail: false }, CopyArchiver);
        let id = identity();
        let task = BackupTask::new(&id, DumpFormat::Custom, &server, &dumper, &archiver, &log);

        let mut artifact = Artifact::new(ArtifactKind::Physical, dir.path().join("base.tar.gz"));
        let result = task.execute(&mut artifact, &CancellationToken::new()).await;

        assert!(!result.success);
        assert_eq!(result.task, TaskId::Backup(ArtifactKind::Physical));
        assert_eq!(artifact.status, StageStatus::Failed);
        assert!(artifact.size.is_none());
        assert!(result.detail.contains("data_directory is not set"));
        // the archiver never ran
        assert!(!artifact.path.exists());
        assert!(log.tail(1)[0].contains("Physical backup failed"));
    }

    #[tokio::test]
    async fn test_physical_backup_requires_existing_data_directory() {
        let dir = tempfile::tempdir().unwrap();
        let log = RunLog::open(&dir.path().join("run.log")).unwrap();
        let missing = dir.path().join("no-such-cluster");
        let server = StubServer { data_dir: Some(missing.clone()) };
        let (dumper, archiver) = (StubDump { fail: false }, CopyArchiver);
        let id = identity();
        let task = BackupTask::new(&id, DumpFormat::Custom, &server, &dumper, &archiver, &log);

        let mut artifact = Artifact::new(ArtifactKind::Physical, dir.path().join("base.tar.gz"));
        let result = task.execute(&mut artifact, &CancellationToken::new()).await;

        assert!(!result.success);
        assert!(result.detail.contains("no-such-cluster"));
        assert!(!artifact.path.exists());
    }

    #[tokio::test]
    async fn test_physical_backup_archives_resolved_directory() {
        let dir = tempfile::tempdir().unwrap();
        let log = RunLog::open(&dir.path().join("run.log")).unwrap();
        let data_dir = dir.path().join("cluster");
        std::fs::create_dir_all(&data_dir).unwrap();
        let server = StubServer { data_dir: Some(data_dir.clone()) };
        let (dumper, archiver) = (StubDump { fail: false }, CopyArchiver);
        let id = identity();
        let task = BackupTask::new(&id, DumpFormat::Custom, &server, &dumper, &archiver, &log);

        let mut artifact = Artifact::new(ArtifactKind::Physical, dir.path().join("base.tar.gz"));
        let result = task.execute(&mut artifact, &CancellationToken::new()).await;

        assert!(result.success, "{}", result);
        assert_eq!(artifact.size, Some(2048));
        assert!(log.tail(10).iter().any(|l| l.contains("PostgreSQL data directory")));
    }
}
