//! Age based pruning of local artifacts.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use regex::Regex;
use walkdir::WalkDir;

use crate::errors::Result;
use crate::run::{StageResult, TaskId};
use crate::utils::logger::RunLog;

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// A file in the backup directory that looks like one of our artifacts.
#[derive(Debug, Clone)]
pub struct RetentionCandidate {
    pub path: PathBuf,
    pub age: Duration,
}

#[derive(Debug, Default)]
pub struct SweepReport {
    pub deleted: usize,
    /// One entry per file the sweep tried to delete.
    pub items: Vec<StageResult>,
}

pub struct RetentionCleaner<'a> {
    log: &'a RunLog,
}

impl<'a> RetentionCleaner<'a> {
    pub fn new(log: &'a RunLog) -> Self {
        Self { log }
    }

    /// Every regular file directly inside `directory` whose name matches one of `patterns`.
    pub fn candidates(
        &self,
        directory: &Path,
        patterns: &[Regex],
        now: SystemTime,
    ) -> Result<Vec<RetentionCandidate>> {
        let mut candidates = Vec::new();
        if !directory.is_dir() {
            return Ok(candidates);
        }

        for entry in WalkDir::new(directory).min_depth(1).max_depth(1) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if !patterns.iter().any(|p| p.is_match(&name)) {
                continue;
            }

            let modified = entry.metadata()?.modified()?;
            // files stamped in the future count as brand new
            let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
            candidates.push(RetentionCandidate {
                path: entry.into_path(),
                age,
            });
        }
        Ok(candidates)
    }

    /// Deletes candidates strictly older than `max_age_days`.
    pub fn sweep(
        &self,
        directory: &Path,
        patterns: &[Regex],
        max_age_days: u32,
        now: SystemTime,
    ) -> Result<SweepReport> {
        let max_age = Duration::from_secs(u64::from(max_age_days) * SECS_PER_DAY);
        self.log.info(format!(
            "Removing backups older than {} days from {}",
            max_age_days,
            directory.display()
        ));

        let mut report = SweepReport::default();
        for candidate in self.candidates(directory, patterns, now)? {
            if candidate.age <= max_age {
                continue;
            }

            let task = TaskId::Cleanup(candidate.path.clone());
            let days = candidate.age.as_secs() / SECS_PER_DAY;
            match fs::remove_file(&candidate.path) {
                Ok(()) => {
                    self.log.info(format!(
                        "Deleted old backup: {} ({} days old)",
                        candidate.path.display(),
                        days
                    ));
                    report.deleted += 1;
                    report
                        .items
                        .push(StageResult::succeeded(task, format!("deleted, {} days old", days)));
                }
                Err(e) => {
                    self.log.error(format!(
                        "Failed to delete old backup {}: {}",
                        candidate.path.display(),
                        e
                    ));
                    report.items.push(StageResult::failed(task, e.to_string()));
                }
            }
        }

        self.log
            .info(format!("Retention cleanup removed {} file(s)", report.deleted));
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::retention_patterns;
    use std::fs::File;

    const DAY: Duration = Duration::from_secs(SECS_PER_DAY);

    fn touch(dir: &Path, name: &str, age: Duration, now: SystemTime) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, b"x").unwrap();
        let file = File::options().write(true).open(&path).unwrap();
        file.set_modified(now - age).unwrap();
        path
    }

    struct Fixture {
        dir: tempfile::TempDir,
        log: RunLog,
        now: SystemTime,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let log = RunLog::open(&dir.path().join("logs/run.log")).unwrap();
        Fixture {
            dir,
            log,
            now: SystemTime::now(),
        }
    }

    #[test]
    fn test_deletes_only_old_matching_files() {
        let fx = fixture();
        let root = fx.dir.path();
        let patterns = retention_patterns("shop").unwrap();

        let old_dump = touch(root, "shop_20260101_020000.dump", 10 * DAY, fx.now);
        let old_base = touch(root, "pg_base_backup_20260101_020000.tar.gz", 8 * DAY, fx.now);
        let fresh = touch(root, "shop_20260110_020000.dump", 2 * DAY, fx.now);
        let unrelated = touch(root, "notes.txt", 30 * DAY, fx.now);
        let other_db = touch(root, "billing_20260101_020000.dump", 30 * DAY, fx.now);

        let report = RetentionCleaner::new(&fx.log)
            .sweep(root, &patterns, 7, fx.now)
            .unwrap();

        assert_eq!(report.deleted, 2);
        assert!(report.items.iter().all(|r| r.success));
        assert!(!old_dump.exists());
        assert!(!old_base.exists());
        assert!(fresh.exists());
        assert!(unrelated.exists());
        assert!(other_db.exists());

        let logged = fx.log.tail(10).join("\n");
        assert!(logged.contains("Deleted old backup"));
        assert!(logged.contains("shop_20260101_020000.dump"));
    }

    #[test]
    fn test_age_must_strictly_exceed_window() {
        let fx = fixture();
        let root = fx.dir.path();
        let patterns = retention_patterns("shop").unwrap();

        let at_limit = touch(root, "shop_20260101_020000.sql", 7 * DAY, fx.now);
        let just_over = touch(root, "shop_20260101_010000.sql", 7 * DAY + Duration::from_secs(1), fx.now);

        let report = RetentionCleaner::new(&fx.log)
            .sweep(root, &patterns, 7, fx.now)
            .unwrap();

        assert_eq!(report.deleted, 1);
        assert!(at_limit.exists());
        assert!(!just_over.exists());
    }

    #[test]
    fn test_second_sweep_is_a_no_op() {
        let fx = fixture();
        let root = fx.dir.path();
        let patterns = retention_patterns("shop").unwrap();
        touch(root, "shop_20260101_020000.dump", 10 * DAY, fx.now);

        let cleaner = RetentionCleaner::new(&fx.log);
        assert_eq!(cleaner.sweep(root, &patterns, 7, fx.now).unwrap().deleted, 1);
        let second = cleaner.sweep(root, &patterns, 7, fx.now).unwrap();
        assert_eq!(second.deleted, 0);
        assert!(second.items.is_empty());
    }

    #[test]
    fn test_subdirectories_and_missing_directory_are_ignored() {
        let fx = fixture();
        let root = fx.dir.path();
        let patterns = retention_patterns("shop").unwrap();

        let nested = root.join("archive");
        fs::create_dir_all(&nested).unwrap();
        let deep = touch(&nested, "shop_20250101_020000.dump", 100 * DAY, fx.now);

        let cleaner = RetentionCleaner::new(&fx.log);
        assert_eq!(cleaner.sweep(root, &patterns, 7, fx.now).unwrap().deleted, 0);
        assert!(deep.exists());

        let report = cleaner
            .sweep(&root.join("does-not-exist"), &patterns, 7, fx.now)
            .unwrap();
        assert_eq!(report.deleted, 0);
    }

    #[test]
    fn test_future_mtime_counts_as_new() {
        let fx = fixture();
        let root = fx.dir.path();
        let patterns = retention_patterns("shop").unwrap();
        let path = root.join("shop_20300101_000000.dump");
        fs::write(&path, b"x").unwrap();
        File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(fx.now + 3 * DAY)
            .unwrap();

        let candidates = RetentionCleaner::new(&fx.log)
            .candidates(root, &patterns, fx.now)
            .unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].age, Duration::ZERO);
    }
}
