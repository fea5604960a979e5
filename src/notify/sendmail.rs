use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use chrono::Local;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::errors::{AppError, Result};
use crate::notify::{Message, MessageTransport};
use crate::utils::find_executable;

/// Hands messages to the local MTA through `sendmail -t`.
pub struct SendmailTransport {
    binary: Option<PathBuf>,
}

impl SendmailTransport {
    pub fn new(binary: Option<PathBuf>) -> Self {
        Self { binary }
    }
}

fn header_value(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}

/// RFC 5322 text of `message`; recipients are read from the headers by `sendmail -t`.
pub fn render_message(message: &Message) -> String {
    format!(
        "From: {}\r\nTo: {}\r\nSubject: {}\r\nDate: {}\r\nMIME-Version: 1.0\r\nContent-Type: text/plain; charset=UTF-8\r\nContent-Transfer-Encoding: 8bit\r\n\r\n{}\r\n",
        header_value(&message.from),
        header_value(&message.to),
        header_value(&message.subject),
        Local::now().to_rfc2822(),
        message.body.replace("\r\n", "\n").replace('\n', "\r\n"),
    )
}

#[async_trait]
impl MessageTransport for SendmailTransport {
    async fn send(&self, message: &Message) -> Result<()> {
        let sendmail = find_executable("sendmail", self.binary.as_deref())?;

        let mut child = Command::new(&sendmail)
            .arg("-t")
            .arg("-i")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| AppError::Transport("sendmail stdin is not available".to_string()))?;
        stdin.write_all(render_message(message).as_bytes()).await?;
        // closing stdin ends the message
        drop(stdin);

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(AppError::command("sendmail", &output));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> Message {
        Message {
            from: "pgbackup@db1".to_string(),
            to: "ops@example.com".to_string(),
            subject: "PostgreSQL backup FAILED on db1\nBcc: attacker@evil".to_string(),
            body: "line one\nline two".to_string(),
        }
    }

    #[test]
    fn test_render_message_headers_and_body() {
        let text = render_message(&message());
        let (headers, body) = text.split_once("\r\n\r\n").unwrap();

        assert!(headers.starts_with("From: pgbackup@db1\r\nTo: ops@example.com\r\n"));
        assert!(headers.contains("Content-Type: text/plain; charset=UTF-8"));
        assert!(headers.contains("\r\nDate: "));
        assert_eq!(body, "line one\r\nline two\r\n");
    }

    #[test]
    fn test_subject_cannot_inject_headers() {
        let text = render_message(&message());
        assert!(!text.contains("\r\nBcc:"));
        assert!(!text.contains("\nBcc:"));
        assert!(text.contains("Subject: PostgreSQL backup FAILED on db1 Bcc: attacker@evil\r\n"));
    }

    #[tokio::test]
    async fn test_missing_sendmail_is_reported() {
        let transport = SendmailTransport::new(Some(PathBuf::from("/nonexistent/sendmail")));
        let res = transport.send(&message()).await;
        assert!(matches!(res, Err(AppError::MissingExecutable(_))));
    }
}
