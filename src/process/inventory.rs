use super::{find_processes, render_launch_command, resolve_launch_path};
use super::{ProcessContext, ProcessRecord, ProcessSource};
use crate::configs::Application;
use crate::error::PatchError;
use crate::remote::{RemoteExecutor, Target};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// `ps` has no column for the working directory.
const PS_COMMAND: &str = "ps -eo pid=,ppid=,user=,comm=,args=";

/// Where the orchestrator looks for live processes.
#[async_trait]
pub trait ProcessInventory: Send + Sync {
    /// Every managed process matching the application's filter, in discovery order.
    async fn discover(&self, application: &Application) -> Result<Vec<ProcessContext>, PatchError>;
}

/// Discovery on the machine running the patcher.
pub struct LocalInventory {
    source: Box<dyn ProcessSource>,
}

impl LocalInventory {
    pub fn new(source: Box<dyn ProcessSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl ProcessInventory for LocalInventory {
    #[instrument(skip_all, fields(application = %application.name))]
    async fn discover(&self, application: &Application) -> Result<Vec<ProcessContext>, PatchError> {
        let records = self.source.processes();
        let mut contexts = Vec::new();
        for record in find_processes(&records, &application.process_filter) {
            let launch_path = resolve_launch_path(application, record).await?;
            contexts.push(context(record, launch_path));
        }
        debug!("Found {} processes", contexts.len());
        Ok(contexts)
    }
}

/// Discovery through `ps` on the target host.
pub struct RemoteInventory {
    executor: Arc<dyn RemoteExecutor>,
    target: Target,
}

impl RemoteInventory {
    pub fn new(executor: Arc<dyn RemoteExecutor>, target: Target) -> Self {
        Self { executor, target }
    }

    async fn run(&self, command: &str) -> Result<String, PatchError> {
        match self.executor.run(&self.target, command).await {
            Ok(result) if result.stderr.trim().is_empty() => Ok(result.stdout),
            Ok(result) => Err(PatchError::Config(format!(
                "`{command}` wrote to stderr: {}",
                result.stderr.trim()
            ))),
            Err(source) if source.is_connectivity() => Err(PatchError::Connectivity {
                host: self.target.host.clone(),
                source,
            }),
            Err(err) => Err(PatchError::Discovery(format!("`{command}` failed: {err}"))),
        }
    }
}

#[async_trait]
impl ProcessInventory for RemoteInventory {
    #[instrument(skip_all, fields(application = %application.name, host = %self.target.host))]
    async fn discover(&self, application: &Application) -> Result<Vec<ProcessContext>, PatchError> {
        let output = self.run(PS_COMMAND).await?;
        let records = parse_ps_output(&output);

        let mut contexts = Vec::new();
        for record in find_processes(&records, &application.process_filter) {
            let launch_path = match &application.launch_path_command {
                Some(command) => {
                    let command =
                        render_launch_command(command, &application.process_filter, record.pid)?;
                    match self.run(&command).await {
                        Ok(stdout) => stdout.trim().to_string(),
                        Err(PatchError::Discovery(reason)) => {
                            return Err(PatchError::Config(format!(
                                "launch-path-command {reason}"
                            )))
                        }
                        Err(err) => return Err(err),
                    }
                }
                None => record.cmdline.as_deref().unwrap_or_default().join(" "),
            };
            contexts.push(context(record, launch_path));
        }
        debug!("Found {} processes", contexts.len());
        Ok(contexts)
    }
}

fn context(record: &ProcessRecord, launch_path: String) -> ProcessContext {
    ProcessContext {
        pid: record.pid,
        name: record.name.clone().unwrap_or_default(),
        executable: record.executable.clone().unwrap_or_default(),
        launch_path,
        owner: record.owner.clone().unwrap_or_default(),
    }
}

/// Parses `ps -eo pid=,ppid=,user=,comm=,args=`.
///
/// The executable is the first word of `args`. The working directory is not
/// observable this way and is left empty, so it never contributes a match.
pub fn parse_ps_output(output: &str) -> Vec<ProcessRecord> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let (Some(pid), Some(parent), Some(user), Some(comm)) =
                (fields.next(), fields.next(), fields.next(), fields.next())
            else {
                warn!(line, "Skipping malformed ps line");
                return None;
            };
            let Ok(pid) = pid.parse::<u32>() else {
                warn!(line, "Skipping ps line without pid");
                return None;
            };
            let args: Vec<String> = fields.map(String::from).collect();
            Some(ProcessRecord {
                pid,
                parent: parent.parse().ok(),
                name: Some(comm.to_string()),
                executable: args.first().cloned(),
                cwd: Some(String::new()),
                cmdline: Some(args),
                owner: Some(user.to_string()),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{application, record, FakeExecutor, FakeSource};

    const PS: &str = "\
    1     0 root     systemd         /sbin/init
  812     1 root     httpd           /u/apache/site-a/bin/httpd -k start
  813   812 daemon   httpd           /u/apache/site-a/bin/httpd -k start
  901     1 root     httpd           /u/apache/site-b/bin/httpd -k start
  950     1 root     sshd            sshd: /usr/sbin/sshd -D
";

    #[test]
    fn parses_ps_columns() {
        let records = parse_ps_output(PS);
        assert_eq!(records.len(), 5);
        let httpd = &records[1];
        assert_eq!(httpd.pid, 812);
        assert_eq!(httpd.parent, Some(1));
        assert_eq!(httpd.owner.as_deref(), Some("root"));
        assert_eq!(httpd.executable.as_deref(), Some("/u/apache/site-a/bin/httpd"));
        assert_eq!(
            httpd.cmdline.as_ref().unwrap().join(" "),
            "/u/apache/site-a/bin/httpd -k start"
        );
    }

    #[tokio::test]
    async fn remote_inventory_filters_children_of_init() {
        let executor = Arc::new(FakeExecutor::default());
        executor.respond("ps -eo", PS);
        let inventory = RemoteInventory::new(executor.clone(), crate::testing::target());

        let found = inventory.discover(&application("apache", "httpd")).await.unwrap();
        let executables: Vec<&str> = found.iter().map(|p| p.executable.as_str()).collect();
        assert_eq!(
            executables,
            vec!["/u/apache/site-a/bin/httpd", "/u/apache/site-b/bin/httpd"]
        );
        assert_eq!(found[0].launch_path, "/u/apache/site-a/bin/httpd -k start");
    }

    #[tokio::test]
    async fn remote_inventory_surfaces_unreachable_host() {
        let executor = Arc::new(FakeExecutor::default());
        executor.fail_connect();
        let inventory = RemoteInventory::new(executor, crate::testing::target());

        let err = inventory.discover(&application("apache", "httpd")).await.unwrap_err();
        assert!(matches!(err, PatchError::Connectivity { .. }));
    }

    #[tokio::test]
    async fn local_inventory_builds_contexts() {
        let source = FakeSource::new(vec![vec![
            record(20, 1, "/opt/app/bin/httpd", &["/opt/app/bin/httpd", "-DFOREGROUND"]),
            record(21, 20, "/opt/app/bin/httpd", &["/opt/app/bin/httpd", "-DFOREGROUND"]),
        ]]);
        let inventory = LocalInventory::new(Box::new(source));

        let found = inventory.discover(&application("httpd", "httpd")).await.unwrap();
        assert_eq!(
            found,
            vec![ProcessContext {
                pid: 20,
                name: "httpd".into(),
                executable: "/opt/app/bin/httpd".into(),
                launch_path: "/opt/app/bin/httpd -DFOREGROUND".into(),
                owner: "root".into(),
            }]
        );
    }
}
