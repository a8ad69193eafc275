use crate::classifier::ServerType;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that end a host's run.
#[derive(Error, Debug)]
pub enum PatchError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Cannot reach {host}: {source}")]
    Connectivity {
        host: String,
        #[source]
        source: RemoteError,
    },

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error("Server type {0} is not supported")]
    UnsupportedServerType(ServerType),

    #[error("Process discovery failed: {0}")]
    Discovery(String),

    #[error("Confirmation prompt failed: {0}")]
    Prompt(#[source] std::io::Error),

    #[error("Host run aborted: {0}")]
    Aborted(#[from] tokio::task::JoinError),
}

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("connection failed: {0}")]
    Connect(#[source] std::io::Error),

    #[error("ssh handshake failed: {0}")]
    Handshake(#[source] ssh2::Error),

    #[error("host key rejected: {0}")]
    HostKey(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("ssh session error: {0}")]
    Session(#[source] ssh2::Error),

    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    #[error("command exited with status {status}: {stderr}")]
    Exit { status: i32, stderr: String },

    #[error("ssh worker panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl RemoteError {
    /// Errors raised before a command could be started on the host.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            RemoteError::Connect(_)
                | RemoteError::Handshake(_)
                | RemoteError::HostKey(_)
                | RemoteError::Auth(_)
        )
    }
}

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("Snapshot I/O failed at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Snapshot already exists: {0:?}")]
    AlreadyExists(PathBuf),

    #[error("Failed to encode snapshot: {0}")]
    Encode(#[source] serde_yaml::Error),

    #[error("Failed to decode snapshot {path:?}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("No snapshot found for host {0}")]
    NotFound(String),

    #[error("Snapshot for host {0} records no processes")]
    Empty(String),

    #[error("Failed to render snapshot name: {0}")]
    Name(String),

    #[error("Remote snapshot access failed: {0}")]
    Remote(#[from] RemoteError),
}
