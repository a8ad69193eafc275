use crate::configs::NotificationConfig;
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

/// Tells operators how a host's run ended. Never fails the run.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, host: &str, subject: &str, lines: &[String]);
}

/// Used when notifications are disabled.
pub struct Silent;

#[async_trait]
impl Notifier for Silent {
    async fn notify(&self, _host: &str, _subject: &str, _lines: &[String]) {}
}

/// Sends mail through the system `mail` command.
pub struct MailNotifier {
    config: NotificationConfig,
}

impl MailNotifier {
    pub fn new(config: NotificationConfig) -> Self {
        Self { config }
    }

    async fn send(&self, host: &str, subject: &str, lines: &[String]) -> std::io::Result<()> {
        let mut child = Command::new(&self.config.mail_command)
            .args(mail_args(&self.config, subject))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(mail_body(host, lines).as_bytes()).await?;
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(std::io::Error::other(format!(
                "{} exited with {}: {}",
                self.config.mail_command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for MailNotifier {
    #[instrument(skip(self, lines))]
    async fn notify(&self, host: &str, subject: &str, lines: &[String]) {
        match self.send(host, subject, lines).await {
            Ok(()) => debug!("Notification sent to {}", self.config.to.join(",")),
            Err(err) => warn!(%err, "Failed to send notification"),
        }
    }
}

pub fn for_config(config: &NotificationConfig) -> Box<dyn Notifier> {
    if config.enabled {
        Box::new(MailNotifier::new(config.clone()))
    } else {
        Box::new(Silent)
    }
}

/// `-s <subject> -r <from> [-c <cc,...>] <to,...>`
fn mail_args(config: &NotificationConfig, subject: &str) -> Vec<String> {
    let mut args = vec![
        "-s".to_string(),
        subject.to_string(),
        "-r".to_string(),
        config.from.clone(),
    ];
    if !config.cc.is_empty() {
        args.push("-c".into());
        args.push(config.cc.join(","));
    }
    args.push(config.to.join(","));
    args
}

fn mail_body(host: &str, lines: &[String]) -> String {
    format!("IP Address: {host}\n\n{}\n", lines.join("\n"))
}
