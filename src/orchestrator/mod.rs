//! The backup cycle state machine.
//!
//! ```text
//! Preflight --ok--> Backup stage --all ok--> Upload stage --all ok--> notify success -> retention
//!     |                  |                         |
//!     +-- fail ----------+-------------------------+--> notify failure -> exit 1
//! ```
//!
//! Both tasks of a stage are always driven to completion before the stage gate is evaluated.
//! Every terminal path sends exactly one notification, and its delivery never changes the verdict.

use std::sync::Arc;
use std::time::SystemTime;

use tokio_util::sync::CancellationToken;

use crate::backup::{Archiver, BackupTask, DumpMechanism, PgDump, StageStatus, TarGzArchiver, retention_patterns};
use crate::config::BackupCycleConfig;
use crate::notify::{MessageTransport, Notifier, SendmailTransport};
use crate::retention::RetentionCleaner;
use crate::run::{BackupJobRun, RunStatus, StageResult, TaskId};
use crate::upload::{RemoteTransfer, UploadTask, transfer_for};
use crate::utils::logger::RunLog;
use crate::utils::setting::{DatabaseServer, PgServer};
use crate::utils::{Clock, SystemClock, format_size};

/// Every external system the orchestrator talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub server: Arc<dyn DatabaseServer>,
    pub dumper: Arc<dyn DumpMechanism>,
    pub archiver: Arc<dyn Archiver>,
    pub transfer: Arc<dyn RemoteTransfer>,
    pub transport: Arc<dyn MessageTransport>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// The real implementations: PostgreSQL, `pg_dump`, tar.gz, the configured remote and sendmail.
    pub fn for_config(config: &BackupCycleConfig) -> Self {
        Self {
            server: Arc::new(PgServer::new(config.preflight_timeout)),
            dumper: Arc::new(PgDump::new(config.pg_dump_path.clone())),
            archiver: Arc::new(TarGzArchiver),
            transfer: transfer_for(&config.remote),
            transport: Arc::new(SendmailTransport::new(config.notification.sendmail_path.clone())),
            clock: Arc::new(SystemClock),
        }
    }
}

pub struct Orchestrator<'a> {
    config: &'a BackupCycleConfig,
    collaborators: &'a Collaborators,
    log: &'a RunLog,
    host: String,
}

impl<'a> Orchestrator<'a> {
    pub fn new(config: &'a BackupCycleConfig, collaborators: &'a Collaborators, log: &'a RunLog) -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string());

        Self {
            config,
            collaborators,
            log,
            host,
        }
    }

    /// Runs one full cycle. The returned run is always in a terminal state.
    pub async fn run(&self, cancel: &CancellationToken) -> BackupJobRun {
        let config = self.config;
        let mut run = BackupJobRun::new(
            &config.local_backup_dir,
            &config.database.name,
            config.dump_format,
            self.collaborators.clock.now(),
        );

        self.log.info(format!(
            "Starting backup run {} of {} at {}, shipping to {}",
            run.id,
            config.database.redacted_url(),
            run.stamp(),
            config.remote
        ));
        self.transition(&mut run, RunStatus::Running);

        let preflight = self.preflight(cancel).await;
        let reachable = preflight.success;
        run.record(preflight.clone());
        if !reachable {
            let subject = format!("PostgreSQL backup FAILED on {}: server unreachable", self.host);
            let body = self.failure_body(
                &run,
                "PostgreSQL is not running or not reachable. No backup was attempted.",
                &[preflight],
                false,
            );
            self.conclude(&mut run, RunStatus::FailedAtPreflight, &subject, &body)
                .await;
            return run;
        }

        let failed = self.backup_stage(&mut run, cancel).await;
        if !failed.is_empty() {
            let subject = format!("PostgreSQL backup FAILED on {}", self.host);
            let body = self.failure_body(
                &run,
                "Backup failed. Nothing was uploaded and no old backups were removed.",
                &failed,
                false,
            );
            self.conclude(&mut run, RunStatus::FailedAtBackup, &subject, &body)
                .await;
            return run;
        }

        let failed = self.upload_stage(&mut run, cancel).await;
        if !failed.is_empty() {
            let subject = format!("PostgreSQL backup upload FAILED on {}", self.host);
            let body = self.failure_body(
                &run,
                "Backups were created locally but could not be uploaded. No old backups were removed.",
                &failed,
                true,
            );
            self.conclude(&mut run, RunStatus::FailedAtUpload, &subject, &body)
                .await;
            return run;
        }

        let subject = format!("PostgreSQL backup successful on {}", self.host);
        let body = self.success_body(&run);
        let sent = self.notifier().notify(&subject, &body).await;
        run.record(sent);

        self.cleanup(&mut run);
        self.transition(&mut run, RunStatus::Succeeded);
        self.log
            .info(format!("Backup run {} finished: {}", run.id, run.status));
        run
    }

    async fn preflight(&self, cancel: &CancellationToken) -> StageResult {
        let identity = &self.config.database;
        self.log.info(format!(
            "Checking that PostgreSQL is running at {}:{}",
            identity.host, identity.port
        ));

        match self.collaborators.server.ping(identity, cancel).await {
            Ok(()) => {
                self.log.info("PostgreSQL is running");
                StageResult::succeeded(TaskId::Preflight, "server is reachable")
            }
            Err(e) => {
                self.log
                    .error(format!("PostgreSQL is not running or not reachable: {}", e));
                StageResult::failed(TaskId::Preflight, e.to_string())
            }
        }
    }

    /// Produces both artifacts and returns the failed results.
    async fn backup_stage(&self, run: &mut BackupJobRun, cancel: &CancellationToken) -> Vec<StageResult> {
        let c = self.collaborators;
        let task = BackupTask::new(
            &self.config.database,
            self.config.dump_format,
            c.server.as_ref(),
            c.dumper.as_ref(),
            c.archiver.as_ref(),
            self.log,
        );

        let (logical, physical) = tokio::join!(
            task.execute(&mut run.logical, cancel),
            task.execute(&mut run.physical, cancel),
        );
        self.gate(run, "backup", [logical, physical])
    }

    async fn upload_stage(&self, run: &mut BackupJobRun, cancel: &CancellationToken) -> Vec<StageResult> {
        let task = UploadTask::new(self.collaborators.transfer.as_ref(), self.log);

        let (logical, physical) = tokio::join!(
            task.execute(&run.logical, cancel),
            task.execute(&run.physical, cancel),
        );
        self.gate(run, "upload", [logical, physical])
    }

    fn gate(&self, run: &mut BackupJobRun, stage: &str, results: [StageResult; 2]) -> Vec<StageResult> {
        let failed: Vec<StageResult> = results.iter().filter(|r| !r.success).cloned().collect();
        for result in results {
            run.record(result);
        }

        if failed.is_empty() {
            self.log.info(format!("All {} tasks succeeded", stage));
        } else {
            self.log.error(format!(
                "{} of 2 {} tasks failed",
                failed.len(),
                stage
            ));
        }
        failed
    }

    fn cleanup(&self, run: &mut BackupJobRun) {
        let config = self.config;
        let cleaner = RetentionCleaner::new(self.log);
        let now = SystemTime::from(self.collaborators.clock.now());

        let swept = retention_patterns(&config.database.name).and_then(|patterns| {
            cleaner.sweep(&config.local_backup_dir, &patterns, config.retention_days, now)
        });
        match swept {
            Ok(report) => {
                for item in report.items {
                    run.record(item);
                }
            }
            // the verdict is already out, a broken sweep only shows up in the log
            Err(e) => self.log.error(format!("Retention cleanup failed: {}", e)),
        }
    }

    async fn conclude(&self, run: &mut BackupJobRun, status: RunStatus, subject: &str, body: &str) {
        let sent = self.notifier().notify(subject, body).await;
        run.record(sent);
        self.transition(run, status);
        self.log
            .error(format!("Backup run {} finished: {}", run.id, run.status));
    }

    fn transition(&self, run: &mut BackupJobRun, status: RunStatus) {
        self.log
            .info(format!("Run {}: {} -> {}", run.id, run.status, status));
        run.status = status;
    }

    fn notifier(&self) -> Notifier<'_> {
        let notification = &self.config.notification;
        Notifier::new(
            self.collaborators.transport.as_ref(),
            &notification.from,
            &notification.to,
            self.config.notify_timeout,
            self.log,
        )
    }

    fn failure_body(
        &self,
        run: &BackupJobRun,
        summary: &str,
        failed: &[StageResult],
        list_local: bool,
    ) -> String {
        let mut body = format!(
            "Backup run {} of database {} on {} failed.\n\n{}\n\nFailed tasks:\n",
            run.id, self.config.database.name, self.host, summary
        );
        for result in failed {
            body.push_str(&format!("  - {}\n", result));
        }

        if list_local {
            body.push_str("\nLocal backups kept for manual recovery:\n");
            for artifact in run.artifacts() {
                if artifact.status == StageStatus::Succeeded && artifact.path.exists() {
                    let size = artifact.size.map(format_size).unwrap_or_default();
                    body.push_str(&format!("  - {} ({})\n", artifact.path.display(), size));
                }
            }
        }

        let tail = self.log.tail(self.config.log_tail_lines);
        body.push_str(&format!(
            "\nLast {} lines of {}:\n",
            tail.len(),
            self.log.path().display()
        ));
        for line in tail {
            body.push_str(&line);
            body.push('\n');
        }
        body
    }

    fn success_body(&self, run: &BackupJobRun) -> String {
        let mut body = format!(
            "Backup run {} of database {} on {} completed successfully.\n\nArtifacts:\n",
            run.id, self.config.database.name, self.host
        );
        for artifact in run.artifacts() {
            let size = artifact.size.map(format_size).unwrap_or_default();
            body.push_str(&format!("  - {} ({})\n", artifact.file_name(), size));
        }
        body.push_str(&format!(
            "\nUploaded to: {}\nLocal copies: {}\nLocal backups older than {} days are removed after this run.\n",
            self.collaborators.transfer.location(),
            self.config.local_backup_dir.display(),
            self.config.retention_days
        ));
        body
    }
}

/// Entry point for the CLI: runs one cycle with the real collaborators and returns the exit code.
pub async fn run_backup_cycle(config: &BackupCycleConfig, cancel: &CancellationToken) -> u8 {
    let collaborators = Collaborators::for_config(config);
    run_cycle_with(config, &collaborators, cancel).await
}

/// Runs one cycle against `collaborators`. An unusable log file degrades the run log,
/// it never prevents the backup.
pub async fn run_cycle_with(
    config: &BackupCycleConfig,
    collaborators: &Collaborators,
    cancel: &CancellationToken,
) -> u8 {
    let log = RunLog::open_or_memory(&config.log_file);
    if !log.is_durable() {
        log.warn(format!(
            "Log file {} is not writable, this run is only logged to the console",
            config.log_file.display()
        ));
    }

    let run = Orchestrator::new(config, collaborators, &log).run(cancel).await;
    run.exit_code()
}
