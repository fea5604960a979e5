pub(crate) mod sendmail;

use std::time::Duration;

use async_trait::async_trait;

use crate::errors::{AppError, Result};
use crate::run::{StageResult, TaskId};
use crate::utils::logger::RunLog;

pub use sendmail::SendmailTransport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Delivers a message to a mailbox.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn send(&self, message: &Message) -> Result<()>;
}

/// Best-effort operator notification. A delivery failure is logged and reported,
/// never propagated.
pub struct Notifier<'a> {
    transport: &'a dyn MessageTransport,
    from: &'a str,
    to: &'a str,
    timeout: Duration,
    log: &'a RunLog,
}

impl<'a> Notifier<'a> {
    pub fn new(
        transport: &'a dyn MessageTransport,
        from: &'a str,
        to: &'a str,
        timeout: Duration,
        log: &'a RunLog,
    ) -> Self {
        Self {
            transport,
            from,
            to,
            timeout,
            log,
        }
    }

    pub async fn notify(&self, subject: &str, body: &str) -> StageResult {
        let message = Message {
            from: self.from.to_string(),
            to: self.to.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        };
        self.log
            .info(format!("Sending notification \"{}\" to {}", subject, self.to));

        let sent = match tokio::time::timeout(self.timeout, self.transport.send(&message)).await {
            Ok(res) => res,
            Err(_) => Err(AppError::Timeout(format!(
                "no answer from the mail transport after {}s",
                self.timeout.as_secs()
            ))),
        };

        match sent {
            Ok(()) => {
                self.log.info(format!("Notification sent to {}", self.to));
                StageResult::succeeded(TaskId::Notification, format!("sent to {}", self.to))
            }
            Err(e) => {
                self.log.error(format!("Failed to send notification: {}", e));
                StageResult::failed(TaskId::Notification, e.to_string())
            }
        }
    }
}
