// pgbackup/src/config/mod.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use url::Url;

const DEFAULT_PORT: u16 = 5432;
const DEFAULT_RETENTION_DAYS: u32 = 7;
const DEFAULT_LOG_TAIL_LINES: usize = 20;
const DEFAULT_PREFLIGHT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_NOTIFY_TIMEOUT_SECS: u64 = 30;
const DEFAULT_LOG_LEVEL: &str = "info";

// Structs for deserializing config.json
#[derive(Debug, Clone, Deserialize)]
pub struct JsonDatabaseConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum JsonRemoteConfig {
    S3 {
        bucket_name: Option<String>,
        region: Option<String>,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
        endpoint_url: Option<String>,
        folder_prefix: Option<String>,
    },
    Rclone {
        destination: Option<String>,
        binary: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonNotificationConfig {
    pub to: Option<String>,
    pub from: Option<String>,
    pub sendmail_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawJsonConfig {
    pub database: Option<JsonDatabaseConfig>,
    pub local_backup_dir: Option<PathBuf>,
    pub retention_days: Option<u32>,
    pub dump_format: Option<String>,
    pub pg_dump_path: Option<PathBuf>,
    pub remote: Option<JsonRemoteConfig>,
    pub notification: Option<JsonNotificationConfig>,
    pub log_file: Option<PathBuf>,
    pub log_tail_lines: Option<usize>,
    pub log_level: Option<String>,
    pub preflight_timeout_secs: Option<u64>,
    pub notify_timeout_secs: Option<u64>,
    pub run_timeout_secs: Option<u64>,
}

// Application's internal configuration structs

/// Who and where the database server is.
#[derive(Clone)]
pub struct DatabaseIdentity {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub name: String,
}

impl DatabaseIdentity {
    /// Connection URL without the password, safe for logs.
    pub fn redacted_url(&self) -> String {
        let raw = format!("postgres://{}:{}/{}", self.host, self.port, self.name);
        match Url::parse(&raw) {
            Ok(mut url) => {
                let _ = url.set_username(&self.user);
                url.to_string()
            }
            Err(_) => raw,
        }
    }
}

impl fmt::Debug for DatabaseIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseIdentity")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("name", &self.name)
            .finish()
    }
}

/// Output format handed to `pg_dump`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DumpFormat {
    #[default]
    Custom,
    Plain,
    Tar,
}

impl DumpFormat {
    pub const ALL: [DumpFormat; 3] = [DumpFormat::Custom, DumpFormat::Plain, DumpFormat::Tar];

    pub fn extension(self) -> &'static str {
        match self {
            DumpFormat::Custom => "dump",
            DumpFormat::Plain => "sql",
            DumpFormat::Tar => "tar",
        }
    }

    pub fn pg_dump_flag(self) -> &'static str {
        match self {
            DumpFormat::Custom => "c",
            DumpFormat::Plain => "p",
            DumpFormat::Tar => "t",
        }
    }
}

impl FromStr for DumpFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "custom" | "c" => Ok(DumpFormat::Custom),
            "plain" | "p" => Ok(DumpFormat::Plain),
            "tar" | "t" => Ok(DumpFormat::Tar),
            other => Err(anyhow::anyhow!(
                "dump_format must be one of 'custom', 'plain' or 'tar', got '{}'",
                other
            )),
        }
    }
}

#[derive(Clone)]
pub struct SpacesConfig {
    pub endpoint_url: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket_name: String,
    pub folder_prefix: Option<String>,
}

impl SpacesConfig {
    /// Object key for a local file name, honouring the folder prefix.
    pub fn object_key(&self, file_name: &str) -> String {
        match &self.folder_prefix {
            Some(prefix) => format!("{}/{}", prefix.trim_matches('/'), file_name),
            None => file_name.to_string(),
        }
    }

    pub fn location(&self) -> String {
        match &self.folder_prefix {
            Some(prefix) => format!("s3://{}/{}", self.bucket_name, prefix.trim_matches('/')),
            None => format!("s3://{}", self.bucket_name),
        }
    }
}

impl fmt::Debug for SpacesConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpacesConfig")
            .field("endpoint_url", &self.endpoint_url)
            .field("region", &self.region)
            .field("bucket_name", &self.bucket_name)
            .field("folder_prefix", &self.folder_prefix)
            .finish_non_exhaustive()
    }
}

/// Where finished artifacts are shipped.
#[derive(Debug, Clone)]
pub enum RemoteTarget {
    S3(SpacesConfig),
    Rclone {
        destination: String,
        binary: Option<PathBuf>,
    },
}

impl fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteTarget::S3(spaces) => f.write_str(&spaces.location()),
            RemoteTarget::Rclone { destination, .. } => f.write_str(destination),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NotificationConfig {
    pub to: String,
    pub from: String,
    pub sendmail_path: Option<PathBuf>,
}

/// Immutable configuration of one backup cycle, built once at start-up.
#[derive(Debug, Clone)]
pub struct BackupCycleConfig {
    pub database: DatabaseIdentity,
    pub local_backup_dir: PathBuf,
    pub retention_days: u32,
    pub dump_format: DumpFormat,
    /// Explicit `pg_dump` binary; looked up on `PATH` when absent.
    pub pg_dump_path: Option<PathBuf>,
    pub remote: RemoteTarget,
    pub notification: NotificationConfig,
    pub log_file: PathBuf,
    pub log_tail_lines: usize,
    pub log_level: String,
    pub preflight_timeout: Duration,
    pub notify_timeout: Duration,
    pub run_timeout: Option<Duration>,
}

impl BackupCycleConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let raw_json_config: RawJsonConfig = serde_json::from_str(&config_content)
            .with_context(|| {
                format!(
                    "Failed to parse JSON from config file at {}",
                    config_path.display()
                )
            })?;

        Self::from_raw(raw_json_config, std::env::var("PGPASSWORD").ok())
    }

    /// Validates the raw JSON values. `env_password` is used when the config carries none.
    pub fn from_raw(raw: RawJsonConfig, env_password: Option<String>) -> Result<Self> {
        let database = load_database_identity(
            raw.database
                .as_ref()
                .context("database must be set in config.json")?,
            env_password,
        )?;

        let local_backup_dir = raw
            .local_backup_dir
            .clone()
            .context("local_backup_dir must be set in config.json")?;
        if local_backup_dir.as_os_str().is_empty() {
            anyhow::bail!("local_backup_dir cannot be empty in config.json.");
        }

        let retention_days = raw.retention_days.unwrap_or(DEFAULT_RETENTION_DAYS);
        if retention_days == 0 {
            // would let a run sweep away the artifacts it just produced
            anyhow::bail!("retention_days must be at least 1 in config.json.");
        }

        let dump_format = match &raw.dump_format {
            Some(fmt) => fmt.parse::<DumpFormat>()?,
            None => DumpFormat::default(),
        };

        let remote = load_remote_target(
            raw.remote
                .as_ref()
                .context("remote must be set in config.json")?,
        )?;

        let notification = load_notification_config(
            raw.notification
                .as_ref()
                .context("notification must be set in config.json")?,
        )?;

        let log_file = raw
            .log_file
            .clone()
            .context("log_file must be set in config.json")?;

        let log_tail_lines = raw.log_tail_lines.unwrap_or(DEFAULT_LOG_TAIL_LINES);

        Ok(BackupCycleConfig {
            database,
            local_backup_dir,
            retention_days,
            dump_format,
            pg_dump_path: raw.pg_dump_path.clone(),
            remote,
            notification,
            log_file,
            log_tail_lines,
            log_level: raw
                .log_level
                .clone()
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            preflight_timeout: Duration::from_secs(
                raw.preflight_timeout_secs
                    .unwrap_or(DEFAULT_PREFLIGHT_TIMEOUT_SECS),
            ),
            notify_timeout: Duration::from_secs(
                raw.notify_timeout_secs.unwrap_or(DEFAULT_NOTIFY_TIMEOUT_SECS),
            ),
            run_timeout: raw.run_timeout_secs.map(Duration::from_secs),
        })
    }
}

fn load_database_identity(
    raw: &JsonDatabaseConfig,
    env_password: Option<String>,
) -> Result<DatabaseIdentity> {
    let host = non_empty(&raw.host).context("database.host must be set in config.json")?;
    let user = non_empty(&raw.user).context("database.user must be set in config.json")?;
    let name = non_empty(&raw.name).context("database.name must be set in config.json")?;

    if name.contains(|c: char| !c.is_alphanumeric() && c != '_' && c != '-') {
        anyhow::bail!("Invalid character in database.name: {:?}", name);
    }

    Ok(DatabaseIdentity {
        host,
        port: raw.port.unwrap_or(DEFAULT_PORT),
        user,
        password: non_empty(&raw.password).or(env_password.filter(|p| !p.is_empty())),
        name,
    })
}

fn load_remote_target(raw: &JsonRemoteConfig) -> Result<RemoteTarget> {
    match raw {
        JsonRemoteConfig::S3 {
            bucket_name,
            region,
            access_key_id,
            secret_access_key,
            endpoint_url,
            folder_prefix,
        } => {
            let endpoint_url =
                non_empty(endpoint_url).context("remote.endpoint_url must be set for s3")?;
            Url::parse(&endpoint_url)
                .with_context(|| format!("remote.endpoint_url is not a valid URL: {}", endpoint_url))?;

            Ok(RemoteTarget::S3(SpacesConfig {
                bucket_name: non_empty(bucket_name)
                    .context("remote.bucket_name must be set for s3")?,
                region: non_empty(region).context("remote.region must be set for s3")?,
                access_key_id: non_empty(access_key_id)
                    .context("remote.access_key_id must be set for s3")?,
                secret_access_key: non_empty(secret_access_key)
                    .context("remote.secret_access_key must be set for s3")?,
                endpoint_url,
                folder_prefix: non_empty(folder_prefix),
            }))
        }
        JsonRemoteConfig::Rclone {
            destination,
            binary,
        } => {
            let destination =
                non_empty(destination).context("remote.destination must be set for rclone")?;
            if !destination.contains(':') {
                anyhow::bail!(
                    "remote.destination must be an rclone remote of the form 'name:path', got '{}'",
                    destination
                );
            }
            Ok(RemoteTarget::Rclone {
                destination,
                binary: binary.clone(),
            })
        }
    }
}

fn load_notification_config(raw: &JsonNotificationConfig) -> Result<NotificationConfig> {
    let to = non_empty(&raw.to).context("notification.to must be set in config.json")?;
    if !to.contains('@') {
        anyhow::bail!("notification.to is not an email address: {}", to);
    }

    let from = match non_empty(&raw.from) {
        Some(from) => from,
        None => default_from_address(),
    };

    Ok(NotificationConfig {
        to,
        from,
        sendmail_path: raw.sendmail_path.clone(),
    })
}

fn default_from_address() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());
    format!("pgbackup@{}", host)
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_ref()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
