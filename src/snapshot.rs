//! Durable record of what was running before a stop.
//!
//! Files are named `{host}-{date}.snapshot.yml` and never overwritten. The date
//! uses the configured `time-format`, which has to sort chronologically since
//! the newest snapshot for a host is the last one by name.

use crate::configs::SnapshotConfig;
use crate::error::{RemoteError, SnapshotError};
use crate::process::ApplicationProcesses;
use crate::remote::{RemoteExecutor, Target};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use new_string_template::template::Template;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument};

const NAME_TEMPLATE: &str = "{host}-{date}.snapshot.yml";
const SUFFIX: &str = ".snapshot.yml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Snapshot {
    pub host: String,
    pub taken_at: DateTime<Local>,
    pub applications: Vec<ApplicationProcesses>,
}

impl Snapshot {
    pub fn new(host: &str, applications: Vec<ApplicationProcesses>) -> Self {
        Self {
            host: host.to_string(),
            taken_at: Local::now(),
            applications,
        }
    }

    pub fn process_count(&self) -> usize {
        self.applications.iter().map(|app| app.processes.len()).sum()
    }

    fn encode(&self) -> Result<String, SnapshotError> {
        serde_yaml::to_string(self).map_err(SnapshotError::Encode)
    }

    fn decode(path: &Path, text: &str) -> Result<Self, SnapshotError> {
        serde_yaml::from_str(text).map_err(|source| SnapshotError::Decode {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Persists `snapshot` and returns where it went.
    async fn save(&self, snapshot: &Snapshot) -> Result<PathBuf, SnapshotError>;

    /// The newest snapshot recorded for `host`.
    async fn load(&self, host: &str) -> Result<Snapshot, SnapshotError>;
}

fn render_name(
    host: &str,
    taken_at: &DateTime<Local>,
    time_format: &str,
) -> Result<String, SnapshotError> {
    let template = Template::new(NAME_TEMPLATE);
    let data = {
        let mut map = HashMap::new();
        map.insert("host", host.to_string());
        map.insert("date", format!("{}", taken_at.format(time_format)));
        map
    };
    template
        .render(&data)
        .map_err(|err| SnapshotError::Name(err.to_string()))
}

async fn write_synced(path: &Path, contents: &[u8]) -> Result<(), SnapshotError> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .await
        .map_err(io_error(path))?;
    file.write_all(contents).await.map_err(io_error(path))?;
    file.sync_all().await.map_err(io_error(path))
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> SnapshotError {
    let path = path.to_path_buf();
    move |source| SnapshotError::Io { path, source }
}

/// Newest snapshot file name for `host` among `names`.
fn latest_for_host<'a>(names: impl IntoIterator<Item = &'a str>, host: &str) -> Option<&'a str> {
    let prefix = format!("{host}-");
    names
        .into_iter()
        .filter(|name| name.starts_with(&prefix) && name.ends_with(SUFFIX))
        .max()
}

/// Snapshots in a directory on the machine running the patcher.
pub struct LocalSnapshotStore {
    config: SnapshotConfig,
}

impl LocalSnapshotStore {
    pub fn new(config: SnapshotConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SnapshotStore for LocalSnapshotStore {
    #[instrument(skip_all, fields(host = %snapshot.host))]
    async fn save(&self, snapshot: &Snapshot) -> Result<PathBuf, SnapshotError> {
        let directory = &self.config.directory;
        tokio::fs::create_dir_all(directory)
            .await
            .map_err(io_error(directory))?;
        let name = render_name(&snapshot.host, &snapshot.taken_at, &self.config.time_format)?;
        let path = directory.join(&name);
        let partial = directory.join(format!(".{name}.partial"));
        let contents = snapshot.encode()?;

        // Only a complete, synced file ever appears under the final name.
        let written = write_synced(&partial, contents.as_bytes()).await;
        let published = match written {
            Ok(()) => match tokio::fs::hard_link(&partial, &path).await {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    Err(SnapshotError::AlreadyExists(path.clone()))
                }
                Err(err) => Err(io_error(&path)(err)),
            },
            Err(err) => Err(err),
        };
        if let Err(err) = tokio::fs::remove_file(&partial).await {
            debug!(%err, "Failed to remove {:?}", partial);
        }
        published?;

        info!("Snapshot saved at {:?}", path);
        Ok(path)
    }

    #[instrument(skip(self))]
    async fn load(&self, host: &str) -> Result<Snapshot, SnapshotError> {
        let directory = &self.config.directory;
        let mut entries = match tokio::fs::read_dir(directory).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(SnapshotError::NotFound(host.to_string()))
            }
            Err(err) => return Err(io_error(directory)(err)),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_error(directory))? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }

        let name = latest_for_host(names.iter().map(String::as_str), host)
            .ok_or_else(|| SnapshotError::NotFound(host.to_string()))?;
        let path = directory.join(name);
        debug!("Reading snapshot {:?}", path);
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(io_error(&path))?;
        Snapshot::decode(&path, &text)
    }
}

/// Snapshots kept on the target host itself.
pub struct RemoteSnapshotStore {
    config: SnapshotConfig,
    executor: Arc<dyn RemoteExecutor>,
    target: Target,
}

impl RemoteSnapshotStore {
    pub fn new(config: SnapshotConfig, executor: Arc<dyn RemoteExecutor>, target: Target) -> Self {
        Self {
            config,
            executor,
            target,
        }
    }

    fn quoted(path: &Path) -> String {
        shell_words::quote(&path.to_string_lossy()).into_owned()
    }
}

#[async_trait]
impl SnapshotStore for RemoteSnapshotStore {
    #[instrument(skip_all, fields(host = %snapshot.host))]
    async fn save(&self, snapshot: &Snapshot) -> Result<PathBuf, SnapshotError> {
        let name = render_name(&snapshot.host, &snapshot.taken_at, &self.config.time_format)?;
        let path = self.config.directory.join(name);

        match self
            .executor
            .run(&self.target, &format!("test ! -e {}", Self::quoted(&path)))
            .await
        {
            Ok(_) => {}
            Err(RemoteError::Exit { status: 1, .. }) => {
                return Err(SnapshotError::AlreadyExists(path))
            }
            Err(err) => return Err(err.into()),
        }

        let contents = snapshot.encode()?;
        self.executor
            .write_file(&self.target, &path, contents.as_bytes(), 0o644)
            .await?;
        info!("Snapshot saved at {}:{:?}", self.target.host, path);
        Ok(path)
    }

    #[instrument(skip(self))]
    async fn load(&self, host: &str) -> Result<Snapshot, SnapshotError> {
        let directory = &self.config.directory;
        let listing = match self
            .executor
            .run(&self.target, &format!("ls -1 {}", Self::quoted(directory)))
            .await
        {
            Ok(result) => result.stdout,
            Err(RemoteError::Exit { .. }) => return Err(SnapshotError::NotFound(host.to_string())),
            Err(err) => return Err(err.into()),
        };
        let name = latest_for_host(listing.lines().map(str::trim), host)
            .ok_or_else(|| SnapshotError::NotFound(host.to_string()))?;
        let path = directory.join(name);
        debug!("Reading snapshot {}:{:?}", self.target.host, path);
        let text = self
            .executor
            .run(&self.target, &format!("cat {}", Self::quoted(&path)))
            .await?
            .stdout;
        Snapshot::decode(&path, &text)
    }
}
