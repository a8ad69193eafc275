use crate::configs::{HostKeyPolicy, SshConfig};
use crate::error::RemoteError;
use async_trait::async_trait;
use parking_lot::Mutex;
use ssh2::{CheckResult, KnownHostFileKind, MethodType, Session};
use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A host and the credentials used to log into it.
#[derive(Clone)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Output of a command that exited with status 0.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteCommandResult {
    pub stdout: String,
    pub stderr: String,
}

#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Runs `command` in a fresh session. A non-zero exit is an error.
    async fn run(&self, target: &Target, command: &str) -> Result<RemoteCommandResult, RemoteError>;

    /// Uploads `contents` to `path`, creating the parent directory first.
    async fn write_file(
        &self,
        target: &Target,
        path: &Path,
        contents: &[u8],
        mode: i32,
    ) -> Result<(), RemoteError>;
}

/// Password-authenticated SSH, one connection per call.
pub struct SshExecutor {
    config: SshConfig,
    known_hosts: Arc<Mutex<()>>,
}

impl SshExecutor {
    pub fn new(config: SshConfig) -> Self {
        Self {
            config,
            known_hosts: Arc::new(Mutex::new(())),
        }
    }

    async fn with_session<T, F>(&self, target: &Target, work: F) -> Result<T, RemoteError>
    where
        T: Send + 'static,
        F: FnOnce(&Session) -> Result<T, RemoteError> + Send + 'static,
    {
        let config = self.config.clone();
        let known_hosts = self.known_hosts.clone();
        let target = target.clone();
        tokio::task::spawn_blocking(move || {
            let session = connect(&config, &target, &known_hosts)?;
            let result = work(&session);
            if let Err(err) = session.disconnect(None, "done", None) {
                debug!(?err, "Disconnect failed");
            }
            result
        })
        .await?
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    #[instrument(skip(self, target), fields(host = %target.host))]
    async fn run(
        &self,
        target: &Target,
        command: &str,
    ) -> Result<RemoteCommandResult, RemoteError> {
        let start = Instant::now();
        let owned = command.to_string();
        let timeout = self.config.command_timeout;
        let result = self
            .with_session(target, move |session| execute(session, &owned, timeout))
            .await;
        debug!(
            elapsed = %humantime::format_duration(start.elapsed()),
            ok = result.is_ok(),
            "Remote command finished"
        );
        result
    }

    #[instrument(skip(self, target, contents), fields(host = %target.host))]
    async fn write_file(
        &self,
        target: &Target,
        path: &Path,
        contents: &[u8],
        mode: i32,
    ) -> Result<(), RemoteError> {
        let path = path.to_path_buf();
        let contents = contents.to_vec();
        let timeout = self.config.command_timeout;
        self.with_session(target, move |session| {
            upload(session, &path, &contents, mode, timeout)
        })
        .await
    }
}

fn connect(
    config: &SshConfig,
    target: &Target,
    known_hosts: &Mutex<()>,
) -> Result<Session, RemoteError> {
    let address = (target.host.as_str(), target.port)
        .to_socket_addrs()
        .map_err(RemoteError::Connect)?
        .next()
        .ok_or_else(|| {
            RemoteError::Connect(std::io::Error::new(
                ErrorKind::NotFound,
                format!("no address for {}", target.host),
            ))
        })?;
    let tcp = TcpStream::connect_timeout(&address, config.connect_timeout)
        .map_err(RemoteError::Connect)?;

    let mut session = Session::new().map_err(RemoteError::Handshake)?;
    if !config.key_exchanges.is_empty() {
        session
            .method_pref(MethodType::Kex, &config.key_exchanges.join(","))
            .map_err(RemoteError::Handshake)?;
    }
    session.set_tcp_stream(tcp);
    session.handshake().map_err(RemoteError::Handshake)?;

    verify_host_key(&session, config, target, known_hosts)?;

    session
        .userauth_password(&target.username, &target.password)
        .map_err(|err| RemoteError::Auth(err.message().to_string()))?;
    if !session.authenticated() {
        return Err(RemoteError::Auth(format!(
            "{} rejected the credentials for {}",
            target.host, target.username
        )));
    }
    if let Some(timeout) = config.command_timeout {
        session.set_timeout(timeout.as_millis().min(u32::MAX as u128) as u32);
    }
    Ok(session)
}

fn verify_host_key(
    session: &Session,
    config: &SshConfig,
    target: &Target,
    lock: &Mutex<()>,
) -> Result<(), RemoteError> {
    if config.host_key_policy == HostKeyPolicy::AcceptAny {
        warn!(host = %target.host, "Host key verification is disabled");
        return Ok(());
    }
    let (key, key_type) = session
        .host_key()
        .ok_or_else(|| RemoteError::HostKey("server sent no host key".into()))?;

    let _guard = lock.lock();
    let mut known_hosts = session.known_hosts().map_err(RemoteError::Handshake)?;
    let path = &config.known_hosts;
    if path.exists() {
        known_hosts
            .read_file(path, KnownHostFileKind::OpenSSH)
            .map_err(|err| RemoteError::HostKey(format!("cannot read {path:?}: {err}")))?;
    }

    match known_hosts.check_port(&target.host, target.port, key) {
        CheckResult::Match => Ok(()),
        CheckResult::NotFound if config.host_key_policy == HostKeyPolicy::Pin => {
            known_hosts
                .add(&known_hosts_entry(target), key, "server-patcher", key_type.into())
                .map_err(RemoteError::Handshake)?;
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            known_hosts
                .write_file(path, KnownHostFileKind::OpenSSH)
                .map_err(|err| RemoteError::HostKey(format!("cannot write {path:?}: {err}")))?;
            info!(host = %target.host, "Pinned new host key in {:?}", path);
            Ok(())
        }
        CheckResult::NotFound => Err(RemoteError::HostKey(format!(
            "{} is not in {path:?}",
            target.host
        ))),
        CheckResult::Mismatch => Err(RemoteError::HostKey(format!(
            "key of {} does not match {path:?}",
            target.host
        ))),
        CheckResult::Failure => Err(RemoteError::HostKey(format!(
            "could not check the key of {}",
            target.host
        ))),
    }
}

fn known_hosts_entry(target: &Target) -> String {
    if target.port == 22 {
        target.host.clone()
    } else {
        format!("[{}]:{}", target.host, target.port)
    }
}

fn execute(
    session: &Session,
    command: &str,
    timeout: Option<Duration>,
) -> Result<RemoteCommandResult, RemoteError> {
    debug!(command, "Executing");
    let mut channel = session.channel_session().map_err(RemoteError::Session)?;
    channel.exec(command).map_err(RemoteError::Session)?;

    // Reading one stream to the end while the other fills its window would
    // stall the remote side, so both are polled together.
    let deadline = timeout.map(|timeout| Instant::now() + timeout);
    session.set_blocking(false);
    let drained = drain(
        &mut channel.stream(0),
        &mut channel.stderr(),
        || channel.eof(),
        deadline,
    );
    session.set_blocking(true);
    let (stdout, stderr) = drained?;

    channel.wait_close().map_err(RemoteError::Session)?;
    let status = channel.exit_status().map_err(RemoteError::Session)?;
    if status != 0 {
        return Err(RemoteError::Exit {
            status,
            stderr: stderr.trim().to_string(),
        });
    }
    Ok(RemoteCommandResult { stdout, stderr })
}

/// Reads both streams until `eof` holds and neither has data left.
fn drain(
    stdout: &mut impl Read,
    stderr: &mut impl Read,
    eof: impl Fn() -> bool,
    deadline: Option<Instant>,
) -> Result<(String, String), RemoteError> {
    let mut out = Vec::new();
    let mut err = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        let read_out = read_available(stdout, &mut out, &mut buf)?;
        let read_err = read_available(stderr, &mut err, &mut buf)?;
        if read_out || read_err {
            continue;
        }
        if eof() {
            break;
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(RemoteError::Io(std::io::Error::new(
                ErrorKind::TimedOut,
                "command output timed out",
            )));
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    Ok((
        String::from_utf8_lossy(&out).into_owned(),
        String::from_utf8_lossy(&err).into_owned(),
    ))
}

/// Whether anything was read. A pending stream reads as nothing.
fn read_available(
    stream: &mut impl Read,
    sink: &mut Vec<u8>,
    buf: &mut [u8],
) -> std::io::Result<bool> {
    match stream.read(buf) {
        Ok(0) => Ok(false),
        Ok(read) => {
            sink.extend_from_slice(&buf[..read]);
            Ok(true)
        }
        Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(false),
        Err(err) => Err(err),
    }
}

fn upload(
    session: &Session,
    path: &Path,
    contents: &[u8],
    mode: i32,
    timeout: Option<Duration>,
) -> Result<(), RemoteError> {
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        let dir = shell_words::quote(&dir.to_string_lossy()).into_owned();
        execute(session, &format!("mkdir -p {dir}"), timeout)?;
    }
    let mut remote = session
        .scp_send(path, mode, contents.len() as u64, None)
        .map_err(RemoteError::Session)?;
    remote.write_all(contents)?;
    remote.send_eof().map_err(RemoteError::Session)?;
    remote.wait_eof().map_err(RemoteError::Session)?;
    remote.close().map_err(RemoteError::Session)?;
    remote.wait_close().map_err(RemoteError::Session)?;
    debug!("Uploaded {} bytes to {:?}", contents.len(), path);
    Ok(())
}
