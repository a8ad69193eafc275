//! Fakes shared by the unit tests.

use crate::configs::Application;
use crate::error::{RemoteError, SnapshotError};
use crate::process::{ProcessContext, ProcessRecord, ProcessSource};
use crate::remote::{RemoteCommandResult, RemoteExecutor, Target};
use crate::snapshot::{Snapshot, SnapshotStore};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub fn record(pid: u32, parent: u32, executable: &str, args: &[&str]) -> ProcessRecord {
    ProcessRecord {
        pid,
        parent: Some(parent),
        name: executable.rsplit('/').next().map(String::from),
        executable: Some(executable.into()),
        cwd: Some("/".into()),
        cmdline: Some(args.iter().map(|arg| arg.to_string()).collect()),
        owner: Some("root".into()),
    }
}

pub fn context(pid: u32, executable: &str) -> ProcessContext {
    ProcessContext {
        pid,
        name: executable.rsplit('/').next().unwrap_or_default().to_string(),
        executable: executable.into(),
        launch_path: executable.into(),
        owner: "root".into(),
    }
}

pub fn application(name: &str, filter: &str) -> Application {
    serde_yaml::from_str(&format!("name: {name}\nprocess-filter: {filter}\n"))
        .expect("valid application")
}

pub fn target() -> Target {
    Target {
        host: "10.3.0.4".into(),
        port: 22,
        username: "patch".into(),
        password: "secret".into(),
    }
}

/// Shared, ordered record of side effects across fakes.
pub type Journal = Arc<Mutex<Vec<String>>>;

enum Failure {
    Connect,
    Transport,
    Exit(i32),
}

/// Records every command; answers with canned output or failures.
#[derive(Default)]
pub struct FakeExecutor {
    journal: Journal,
    responses: Mutex<Vec<(String, String)>>,
    failures: Mutex<Vec<(String, Failure)>>,
    unreachable: Mutex<bool>,
    uploads: Mutex<HashMap<PathBuf, String>>,
}

impl FakeExecutor {
    pub fn with_journal(journal: Journal) -> Self {
        Self {
            journal,
            ..Default::default()
        }
    }

    /// Commands containing `needle` print `stdout`.
    pub fn respond(&self, needle: &str, stdout: &str) {
        self.responses.lock().push((needle.into(), stdout.into()));
    }

    /// Commands containing `needle` fail in transit.
    pub fn fail_transport(&self, needle: &str) {
        self.failures.lock().push((needle.into(), Failure::Transport));
    }

    /// Commands containing `needle` exit with `status`.
    pub fn fail_exit(&self, needle: &str, status: i32) {
        self.failures.lock().push((needle.into(), Failure::Exit(status)));
    }

    /// Commands containing `needle` cannot connect.
    pub fn fail_connect_on(&self, needle: &str) {
        self.failures.lock().push((needle.into(), Failure::Connect));
    }

    /// Every connection is refused.
    pub fn fail_connect(&self) {
        *self.unreachable.lock() = true;
    }

    /// Commands run so far, oldest first.
    pub fn commands(&self) -> Vec<String> {
        self.journal
            .lock()
            .iter()
            .filter_map(|entry| entry.strip_prefix("run: ").map(String::from))
            .collect()
    }

    pub fn uploaded(&self, path: &Path) -> Option<String> {
        self.uploads.lock().get(path).cloned()
    }
}

#[async_trait]
impl RemoteExecutor for FakeExecutor {
    async fn run(
        &self,
        _target: &Target,
        command: &str,
    ) -> Result<RemoteCommandResult, RemoteError> {
        if *self.unreachable.lock() {
            return Err(RemoteError::Connect(std::io::Error::from(ErrorKind::ConnectionRefused)));
        }
        self.journal.lock().push(format!("run: {command}"));

        let failure = self
            .failures
            .lock()
            .iter()
            .find(|(needle, _)| command.contains(needle.as_str()))
            .map(|(_, failure)| match failure {
                Failure::Connect => {
                    RemoteError::Connect(std::io::Error::from(ErrorKind::ConnectionRefused))
                }
                Failure::Transport => RemoteError::Io(std::io::Error::from(ErrorKind::BrokenPipe)),
                Failure::Exit(status) => RemoteError::Exit {
                    status: *status,
                    stderr: "failed".into(),
                },
            });
        if let Some(err) = failure {
            return Err(err);
        }

        let stdout = self
            .responses
            .lock()
            .iter()
            .rev()
            .find(|(needle, _)| command.contains(needle.as_str()))
            .map(|(_, stdout)| stdout.clone())
            .unwrap_or_default();
        Ok(RemoteCommandResult {
            stdout,
            stderr: String::new(),
        })
    }

    async fn write_file(
        &self,
        _target: &Target,
        path: &Path,
        contents: &[u8],
        _mode: i32,
    ) -> Result<(), RemoteError> {
        if *self.unreachable.lock() {
            return Err(RemoteError::Connect(std::io::Error::from(ErrorKind::ConnectionRefused)));
        }
        self.journal.lock().push(format!("write: {}", path.display()));
        self.uploads
            .lock()
            .insert(path.to_path_buf(), String::from_utf8_lossy(contents).into_owned());
        Ok(())
    }
}

/// Process tables handed out one per call; the last one repeats.
pub struct FakeSource {
    tables: Mutex<VecDeque<Vec<ProcessRecord>>>,
}

impl FakeSource {
    pub fn new(tables: Vec<Vec<ProcessRecord>>) -> Self {
        Self {
            tables: Mutex::new(tables.into()),
        }
    }
}

impl ProcessSource for FakeSource {
    fn processes(&self) -> Vec<ProcessRecord> {
        let mut tables = self.tables.lock();
        if tables.len() > 1 {
            tables.pop_front().unwrap_or_default()
        } else {
            tables.front().cloned().unwrap_or_default()
        }
    }
}

/// Snapshots kept in memory.
#[derive(Default)]
pub struct MemoryStore {
    journal: Journal,
    saved: Mutex<Vec<Snapshot>>,
    fail_saves: bool,
}

impl MemoryStore {
    pub fn with_journal(journal: Journal) -> Self {
        Self {
            journal,
            ..Default::default()
        }
    }

    pub fn failing(journal: Journal) -> Self {
        Self {
            journal,
            fail_saves: true,
            ..Default::default()
        }
    }

    pub fn holding(snapshot: Snapshot) -> Self {
        Self {
            saved: Mutex::new(vec![snapshot]),
            ..Default::default()
        }
    }

    pub fn saved(&self) -> Vec<Snapshot> {
        self.saved.lock().clone()
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn save(&self, snapshot: &Snapshot) -> Result<PathBuf, SnapshotError> {
        if self.fail_saves {
            return Err(SnapshotError::Io {
                path: "/u/Server-Patcher-Automation".into(),
                source: std::io::Error::from(ErrorKind::PermissionDenied),
            });
        }
        self.journal.lock().push(format!("save: {}", snapshot.host));
        self.saved.lock().push(snapshot.clone());
        Ok(PathBuf::from(format!("memory://{}", snapshot.host)))
    }

    async fn load(&self, host: &str) -> Result<Snapshot, SnapshotError> {
        self.saved
            .lock()
            .iter()
            .rev()
            .find(|snapshot| snapshot.host == host)
            .cloned()
            .ok_or_else(|| SnapshotError::NotFound(host.to_string()))
    }
}
