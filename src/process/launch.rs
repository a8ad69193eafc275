use super::ProcessRecord;
use crate::configs::Application;
use crate::error::PatchError;
use crate::template;
use std::collections::HashMap;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, instrument};

/// Renders `launch-path-command` for one process. Values are shell-quoted.
pub fn render_launch_command(
    command: &str,
    process_filter: &str,
    pid: u32,
) -> Result<String, PatchError> {
    let values = HashMap::from([
        ("process_filter", shell_words::quote(process_filter).into_owned()),
        ("pid", pid.to_string()),
    ]);
    template::render(command, &values)
        .map_err(|err| PatchError::Config(format!("launch-path-command: {err}")))
}

/// Returns the command line that relaunches `record`.
///
/// Without a discovery command this is the live command line, which is only
/// accurate while the process is still running.
#[instrument(skip_all, fields(pid = record.pid, application = %application.name))]
pub async fn resolve_launch_path(
    application: &Application,
    record: &ProcessRecord,
) -> Result<String, PatchError> {
    let Some(command) = &application.launch_path_command else {
        return Ok(record.cmdline.as_deref().unwrap_or_default().join(" "));
    };
    let command = render_launch_command(command, &application.process_filter, record.pid)?;
    run_discovery_command(&command).await
}

async fn run_discovery_command(command: &str) -> Result<String, PatchError> {
    debug!(command, "Running launch path discovery");
    let output = Command::new("bash")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|err| PatchError::Config(format!("failed to spawn `{command}`: {err}")))?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    if !output.status.success() {
        return Err(PatchError::Config(format!(
            "`{command}` exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    if !stderr.is_empty() {
        return Err(PatchError::Config(format!(
            "`{command}` wrote to stderr: {}",
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
