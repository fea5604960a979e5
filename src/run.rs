//! State of one invocation of the backup cycle.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use uuid::Uuid;

use crate::backup::{Artifact, ArtifactKind, artifact_path};
use crate::config::DumpFormat;

/// Format of the timestamp embedded in every artifact name of a run.
pub const RUN_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Identifies the task a [`StageResult`] belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskId {
    Preflight,
    Backup(ArtifactKind),
    Upload(ArtifactKind),
    Notification,
    Cleanup(PathBuf),
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskId::Preflight => f.write_str("preflight check"),
            TaskId::Backup(kind) => write!(f, "{}", kind),
            TaskId::Upload(kind) => write!(f, "upload of {}", kind),
            TaskId::Notification => f.write_str("notification"),
            TaskId::Cleanup(path) => write!(f, "cleanup of {}", path.display()),
        }
    }
}

/// Outcome of a single task. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageResult {
    pub task: TaskId,
    pub success: bool,
    pub detail: String,
}

impl StageResult {
    pub fn succeeded(task: TaskId, detail: impl Into<String>) -> Self {
        Self {
            task,
            success: true,
            detail: detail.into(),
        }
    }

    pub fn failed(task: TaskId, detail: impl Into<String>) -> Self {
        Self {
            task,
            success: false,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for StageResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.task, self.detail)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    FailedAtPreflight,
    FailedAtBackup,
    FailedAtUpload,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Pending | RunStatus::Running)
    }

    /// Process exit code for a terminal status. Every failure shares code 1.
    pub fn exit_code(self) -> u8 {
        match self {
            RunStatus::Succeeded => 0,
            _ => 1,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::FailedAtPreflight => "failed at preflight",
            RunStatus::FailedAtBackup => "failed at backup",
            RunStatus::FailedAtUpload => "failed at upload",
        };
        f.write_str(s)
    }
}

/// One invocation of the pipeline. Owns the artifacts it creates.
#[derive(Debug)]
pub struct BackupJobRun {
    pub id: Uuid,
    /// Frozen at creation, every artifact name derives from it.
    timestamp: DateTime<Local>,
    pub status: RunStatus,
    pub logical: Artifact,
    pub physical: Artifact,
    pub outcomes: Vec<StageResult>,
}

impl BackupJobRun {
    pub fn new(
        backup_dir: &Path,
        database: &str,
        format: DumpFormat,
        timestamp: DateTime<Local>,
    ) -> Self {
        let logical = Artifact::new(
            ArtifactKind::Logical,
            artifact_path(backup_dir, database, format, ArtifactKind::Logical, &timestamp),
        );
        let physical = Artifact::new(
            ArtifactKind::Physical,
            artifact_path(backup_dir, database, format, ArtifactKind::Physical, &timestamp),
        );

        Self {
            id: Uuid::new_v4(),
            timestamp,
            status: RunStatus::Pending,
            logical,
            physical,
            outcomes: Vec::new(),
        }
    }

    pub fn stamp(&self) -> String {
        self.timestamp.format(RUN_TIMESTAMP_FORMAT).to_string()
    }

    pub fn artifacts(&self) -> [&Artifact; 2] {
        [&self.logical, &self.physical]
    }

    pub fn record(&mut self, result: StageResult) {
        self.outcomes.push(result);
    }

    pub fn exit_code(&self) -> u8 {
        debug_assert!(self.status.is_terminal(), "run {} is still {}", self.id, self.status);
        self.status.exit_code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 3, 14, h, m, s).unwrap()
    }

    #[test]
    fn test_new_run_derives_artifact_paths_from_timestamp() {
        let run = BackupJobRun::new(Path::new("/backups"), "shop", DumpFormat::Custom, at(2, 30, 0));

        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.stamp(), "20260314_023000");
        assert_eq!(run.logical.path, PathBuf::from("/backups/shop_20260314_023000.dump"));
        assert_eq!(
            run.physical.path,
            PathBuf::from("/backups/pg_base_backup_20260314_023000.tar.gz")
        );
        assert!(run.artifacts().iter().all(|a| a.size.is_none()));
    }

    #[test]
    fn test_runs_with_different_timestamps_never_collide() {
        let first = BackupJobRun::new(Path::new("/b"), "shop", DumpFormat::Plain, at(2, 30, 0));
        let second = BackupJobRun::new(Path::new("/b"), "shop", DumpFormat::Plain, at(2, 30, 1));

        assert_ne!(first.logical.path, second.logical.path);
        assert_ne!(first.physical.path, second.physical.path);
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(RunStatus::Succeeded.exit_code(), 0);
        for status in [
            RunStatus::FailedAtPreflight,
            RunStatus::FailedAtBackup,
            RunStatus::FailedAtUpload,
        ] {
            assert_eq!(status.exit_code(), 1);
            assert!(status.is_terminal());
        }
        assert!(!RunStatus::Running.is_terminal());
    }

    #[test]
    fn test_task_labels() {
        assert_eq!(TaskId::Backup(ArtifactKind::Logical).to_string(), "logical backup");
        assert_eq!(
            TaskId::Upload(ArtifactKind::Physical).to_string(),
            "upload of physical backup"
        );
        let result = StageResult::failed(TaskId::Preflight, "connection refused");
        assert_eq!(result.to_string(), "preflight check: connection refused");
    }
}
