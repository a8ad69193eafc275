use crate::error::PatchError;
use crate::process::ApplicationProcesses;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

/// The yes/no decision taken before anything is stopped.
#[async_trait]
pub trait Confirmation: Send + Sync {
    async fn confirm(
        &self,
        host: &str,
        discovered: &[ApplicationProcesses],
    ) -> Result<bool, PatchError>;
}

/// Always proceeds. Used with `--yes`.
pub struct AssumeYes;

#[async_trait]
impl Confirmation for AssumeYes {
    async fn confirm(
        &self,
        _host: &str,
        _discovered: &[ApplicationProcesses],
    ) -> Result<bool, PatchError> {
        Ok(true)
    }
}

/// Lists the processes on stdout and waits for `yes` on stdin.
pub struct TerminalPrompt;

#[async_trait]
impl Confirmation for TerminalPrompt {
    async fn confirm(
        &self,
        host: &str,
        discovered: &[ApplicationProcesses],
    ) -> Result<bool, PatchError> {
        let mut stdout = tokio::io::stdout();
        stdout
            .write_all(describe(host, discovered).as_bytes())
            .await
            .map_err(PatchError::Prompt)?;
        stdout.flush().await.map_err(PatchError::Prompt)?;

        let mut answer = String::new();
        BufReader::new(tokio::io::stdin())
            .read_line(&mut answer)
            .await
            .map_err(PatchError::Prompt)?;
        Ok(is_yes(&answer))
    }
}

pub fn is_yes(answer: &str) -> bool {
    answer.trim().eq_ignore_ascii_case("yes")
}

fn describe(host: &str, discovered: &[ApplicationProcesses]) -> String {
    let mut text = format!("Processes on {host}:\n");
    for app in discovered {
        for process in &app.processes {
            text.push_str(&format!(
                "  [{}] pid {} {} ({}) owner {}\n    launch: {}\n",
                app.name,
                process.pid,
                process.name,
                process.executable,
                process.owner,
                process.launch_path
            ));
        }
    }
    text.push_str("Do you want to stop these processes? (yes/no) ");
    text
}
