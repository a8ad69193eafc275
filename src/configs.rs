use crate::classifier::{HostClassifier, ServerType};
use crate::error::PatchError;
use crate::template;
use chrono::format::{Item, StrftimeItems};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

/// Placeholders available to stop and start steps.
pub const STEP_PLACEHOLDERS: &[&str] = &[
    "dir",
    "exe",
    "name",
    "pid",
    "owner",
    "filter",
    "control_script",
    "launch_path",
];

/// Placeholders available to `launch-path-command`.
pub const LAUNCH_PLACEHOLDERS: &[&str] = &["process_filter", "pid"];

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct PatcherConfig {
    #[serde(default = "default_log")]
    pub log: String,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub server_types: HashMap<ServerType, String>,
    #[serde(default)]
    pub discovery: DiscoveryMode,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    pub applications: Vec<Application>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct NotificationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default = "default_mail_command")]
    pub mail_command: String,
}

/// Where processes are looked up.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DiscoveryMode {
    /// Process table of the machine running the patcher.
    #[default]
    Local,
    /// `ps` output fetched from the target host.
    Remote,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SnapshotLocation {
    #[default]
    Local,
    Remote,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct SnapshotConfig {
    #[serde(default)]
    pub location: SnapshotLocation,
    #[serde(default = "default_snapshot_directory")]
    pub directory: PathBuf,
    /// Must sort chronologically, the newest snapshot is picked by name.
    #[serde(default = "default_time_format")]
    pub time_format: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    /// Only hosts already present in the known-hosts file are accepted.
    Strict,
    /// Unknown hosts are recorded on first contact and verified afterwards.
    #[default]
    Pin,
    /// No verification at all.
    AcceptAny,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct SshConfig {
    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,
    #[serde(default = "default_known_hosts")]
    pub known_hosts: PathBuf,
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde", default)]
    pub command_timeout: Option<Duration>,
    #[serde(default)]
    pub key_exchanges: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Application {
    pub name: String,
    pub process_filter: String,
    #[serde(default)]
    pub launch_path_command: Option<String>,
    #[serde(default = "default_control_script")]
    pub control_script: String,
    #[serde(default)]
    pub stop_steps: Vec<CommandStep>,
    #[serde(default)]
    pub start_steps: Vec<CommandStep>,
    #[serde(default)]
    pub health_check: Option<HealthCheck>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct CommandStep {
    pub command: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct HealthCheck {
    pub command: String,
    #[serde(default = "default_num_retries")]
    pub num_retries: u32,
    /// Upper bound for a single attempt.
    #[serde(with = "humantime_serde", default = "default_health_timeout")]
    pub timeout: Duration,
    /// Pause between attempts.
    #[serde(with = "humantime_serde", default = "default_health_interval")]
    pub interval: Duration,
}

fn default_log() -> String {
    "info".into()
}

fn default_mail_command() -> String {
    "mail".into()
}

fn default_snapshot_directory() -> PathBuf {
    "/u/Server-Patcher-Automation".into()
}

fn default_time_format() -> String {
    "%Y%m%dT%H%M%S".into()
}

fn default_known_hosts() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_default()
        .join(".ssh/known_hosts")
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_control_script() -> String {
    "apachectl".into()
}

fn default_num_retries() -> u32 {
    3
}

fn default_health_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_health_interval() -> Duration {
    Duration::from_secs(5)
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            location: Default::default(),
            directory: default_snapshot_directory(),
            time_format: default_time_format(),
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host_key_policy: Default::default(),
            known_hosts: default_known_hosts(),
            connect_timeout: default_connect_timeout(),
            command_timeout: None,
            key_exchanges: Vec::new(),
        }
    }
}

impl PatcherConfig {
    pub fn application(&self, name: &str) -> Option<&Application> {
        self.applications.iter().find(|app| app.name == name)
    }

    /// Rejects everything that would otherwise only fail halfway through a run.
    pub fn validate(&self) -> Result<(), PatchError> {
        if self.applications.is_empty() {
            return Err(PatchError::Config("no applications configured".into()));
        }
        let mut names = HashSet::new();
        for app in &self.applications {
            app.validate()?;
            if !names.insert(app.name.as_str()) {
                return Err(PatchError::Config(format!(
                    "application `{}` is defined twice",
                    app.name
                )));
            }
        }

        HostClassifier::new(&self.server_types)?;

        if StrftimeItems::new(&self.snapshot.time_format).any(|item| matches!(item, Item::Error)) {
            return Err(PatchError::Config(format!(
                "invalid snapshot time-format `{}`",
                self.snapshot.time_format
            )));
        }

        if self.notifications.enabled
            && (self.notifications.from.trim().is_empty() || self.notifications.to.is_empty())
        {
            return Err(PatchError::Config(
                "notifications need a `from` address and at least one `to` address".into(),
            ));
        }
        Ok(())
    }
}

impl Application {
    fn validate(&self) -> Result<(), PatchError> {
        let invalid =
            |reason: String| PatchError::Config(format!("application `{}`: {reason}", self.name));

        if self.name.trim().is_empty() {
            return Err(PatchError::Config("application without a name".into()));
        }
        if self.process_filter.trim().is_empty() {
            return Err(invalid("process-filter must not be empty".into()));
        }
        if self.control_script.trim().is_empty() {
            return Err(invalid("control-script must not be empty".into()));
        }
        if let Some(command) = &self.launch_path_command {
            template::validate(command, LAUNCH_PLACEHOLDERS)
                .map_err(|err| invalid(format!("launch-path-command: {err}")))?;
        }
        for step in self.stop_steps.iter().chain(&self.start_steps) {
            template::validate(&step.command, STEP_PLACEHOLDERS)
                .map_err(|err| invalid(format!("step `{}`: {err}", step.command)))?;
        }
        if let Some(check) = &self.health_check {
            if check.command.trim().is_empty() {
                return Err(invalid("health-check command must not be empty".into()));
            }
            if check.num_retries == 0 {
                return Err(invalid("health-check num-retries must be at least 1".into()));
            }
        }
        Ok(())
    }
}
