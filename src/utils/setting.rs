// Talks to the live PostgreSQL server: reachability and the data directory location.
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgConnectOptions;
use sqlx::{Connection, PgConnection};
use tokio_util::sync::CancellationToken;

use crate::config::DatabaseIdentity;
use crate::errors::{AppError, Result};
use crate::utils::cancellable;

#[async_trait]
pub trait DatabaseServer: Send + Sync {
    /// Succeeds when the server accepts a connection for `identity`.
    async fn ping(&self, identity: &DatabaseIdentity, cancel: &CancellationToken) -> Result<()>;

    /// Asks the running server where its data directory currently lives.
    async fn data_directory(
        &self,
        identity: &DatabaseIdentity,
        cancel: &CancellationToken,
    ) -> Result<PathBuf>;
}

pub struct PgServer {
    connect_timeout: Duration,
}

impl PgServer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// Opens a connection to the configured database, bounded by the connect timeout.
    async fn connect(&self, identity: &DatabaseIdentity) -> Result<PgConnection> {
        let options = self.connect_options(identity);
        tokio::time::timeout(self.connect_timeout, PgConnection::connect_with(&options))
            .await
            .map_err(|_| {
                AppError::Timeout(format!(
                    "no answer from PostgreSQL at {}:{} after {}s",
                    identity.host,
                    identity.port,
                    self.connect_timeout.as_secs()
                ))
            })?
            .map_err(AppError::from)
    }

    fn connect_options(&self, identity: &DatabaseIdentity) -> PgConnectOptions {
        let options = PgConnectOptions::new()
            .host(&identity.host)
            .port(identity.port)
            .username(&identity.user)
            .database(&identity.name);
        match &identity.password {
            Some(password) => options.password(password),
            None => options,
        }
    }
}

#[async_trait]
impl DatabaseServer for PgServer {
    async fn ping(&self, identity: &DatabaseIdentity, cancel: &CancellationToken) -> Result<()> {
        cancellable(cancel, "database reachability check", async {
            let mut conn = self.connect(identity).await?;
            conn.ping().await?;
            conn.close().await?;
            Ok(())
        })
        .await
    }

    async fn data_directory(
        &self,
        identity: &DatabaseIdentity,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        cancellable(cancel, "data directory query", async {
            let mut conn = self.connect(identity).await?;
            let (data_directory,): (String,) = sqlx::query_as("SHOW data_directory")
                .fetch_one(&mut conn)
                .await?;
            conn.close().await?;
            Ok(PathBuf::from(data_directory.trim()))
        })
        .await
    }
}
