mod types;
#[cfg(test)]
mod tests;

pub use types::*;

use crate::configs::{Application, HealthCheck, PatcherConfig};
use crate::confirm::Confirmation;
use crate::control::{ControlAction, ServerControl};
use crate::error::{PatchError, SnapshotError};
use crate::process::{ApplicationProcesses, ProcessInventory};
use crate::remote::{RemoteExecutor, Target};
use crate::snapshot::{Snapshot, SnapshotStore};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

/// Stops and restarts the managed processes of one host.
pub struct Orchestrator {
    config: Arc<PatcherConfig>,
    target: Target,
    control: Box<dyn ServerControl>,
    executor: Arc<dyn RemoteExecutor>,
    inventory: Box<dyn ProcessInventory>,
    snapshots: Box<dyn SnapshotStore>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        config: Arc<PatcherConfig>,
        target: Target,
        control: Box<dyn ServerControl>,
        executor: Arc<dyn RemoteExecutor>,
        inventory: Box<dyn ProcessInventory>,
        snapshots: Box<dyn SnapshotStore>,
    ) -> Self {
        Self {
            config,
            target,
            control,
            executor,
            inventory,
            snapshots,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[instrument(skip_all, fields(host = %self.target.host))]
    pub async fn stop(&self, gate: &dyn Confirmation) -> Result<Outcome, PatchError> {
        let mut discovered = self
            .discover_all()
            .instrument(info_span!("discover"))
            .await?;
        discovered.retain(|app| !app.processes.is_empty());
        let total: usize = discovered.iter().map(|app| app.processes.len()).sum();
        if total == 0 {
            info!("No managed processes running, nothing to stop");
            return Ok(Outcome::NothingToDo);
        }
        info!("Found {total} processes to stop");

        if !gate.confirm(&self.target.host, &discovered).await? {
            info!("Stop declined");
            return Ok(Outcome::Declined);
        }
        if self.cancel.is_cancelled() {
            warn!("Cancelled before the snapshot was taken");
            return Ok(Outcome::Cancelled(Shortfall::default()));
        }

        let snapshot = Snapshot::new(&self.target.host, discovered);
        let location = self.snapshots.save(&snapshot).await?;
        info!(
            "Snapshot of {} processes persisted at {:?}",
            snapshot.process_count(),
            location
        );

        let mut shortfall = Shortfall::default();
        let finished = self
            .run_action(ControlAction::Stop, &snapshot, &mut shortfall)
            .instrument(info_span!("stopping"))
            .await?;
        if !finished {
            return Ok(Outcome::Cancelled(shortfall));
        }

        let remaining = self
            .discover_all()
            .instrument(info_span!("validate"))
            .await?;
        for process in remaining.iter().flat_map(|app| &app.processes) {
            error!("ALERT: {} is still running", process.label());
            shortfall.unaccounted.push(process.label());
        }

        if shortfall.is_empty() {
            info!("All processes stopped");
            Ok(Outcome::Stopped)
        } else {
            Ok(Outcome::PartiallyStopped(shortfall))
        }
    }

    #[instrument(skip_all, fields(host = %self.target.host))]
    pub async fn start(&self) -> Result<Outcome, PatchError> {
        let snapshot = self.snapshots.load(&self.target.host).await?;
        if snapshot.process_count() == 0 {
            return Err(SnapshotError::Empty(self.target.host.clone()).into());
        }
        for app in &snapshot.applications {
            self.application(&app.name)?;
        }
        info!(
            "Loaded snapshot taken at {} with {} processes",
            snapshot.taken_at,
            snapshot.process_count()
        );

        let mut shortfall = Shortfall::default();
        let finished = self
            .run_action(ControlAction::Start, &snapshot, &mut shortfall)
            .instrument(info_span!("starting"))
            .await?;
        if !finished {
            return Ok(Outcome::Cancelled(shortfall));
        }

        async {
            for recorded in &snapshot.applications {
                let application = self.application(&recorded.name)?;
                // Each live process accounts for at most one recorded one.
                let mut live = self.inventory.discover(application).await?;
                for process in &recorded.processes {
                    let matched = live.iter().position(|found| found.same_process_as(process));
                    if let Some(index) = matched {
                        let found = live.swap_remove(index);
                        info!("{} is running as pid {}", process.label(), found.pid);
                    } else {
                        error!("ALERT: {} is not running", process.label());
                        shortfall.unaccounted.push(process.label());
                    }
                }
            }
            Ok::<_, PatchError>(())
        }
        .instrument(info_span!("validate"))
        .await?;

        if shortfall.is_empty() {
            info!("All processes started");
            Ok(Outcome::Started)
        } else {
            Ok(Outcome::PartiallyStarted(shortfall))
        }
    }

    fn application(&self, name: &str) -> Result<&Application, PatchError> {
        self.config.application(name).ok_or_else(|| {
            PatchError::Config(format!(
                "snapshot names application `{name}` which is no longer configured"
            ))
        })
    }

    /// Runs discovery for every application, in manifest order. A pid claimed
    /// by an earlier application is not handed to a later one.
    async fn discover_all(&self) -> Result<Vec<ApplicationProcesses>, PatchError> {
        let mut seen = HashSet::new();
        let mut discovered = Vec::with_capacity(self.config.applications.len());
        for application in &self.config.applications {
            let processes = self
                .inventory
                .discover(application)
                .await?
                .into_iter()
                .filter(|process| {
                    let fresh = seen.insert(process.pid);
                    if !fresh {
                        debug!(
                            pid = process.pid,
                            application = %application.name,
                            "Process already claimed by an earlier application"
                        );
                    }
                    fresh
                })
                .collect();
            discovered.push(ApplicationProcesses {
                name: application.name.clone(),
                processes,
            });
        }
        Ok(discovered)
    }

    /// Returns `false` when cancelled before every process was handled.
    async fn run_action(
        &self,
        action: ControlAction,
        snapshot: &Snapshot,
        shortfall: &mut Shortfall,
    ) -> Result<bool, PatchError> {
        for recorded in &snapshot.applications {
            let application = self.application(&recorded.name)?;
            let mut issued = HashSet::new();
            for process in &recorded.processes {
                if self.cancel.is_cancelled() {
                    warn!("Cancelled before {action} of {}", process.label());
                    return Ok(false);
                }
                let commands = match self.control.commands(action, application, process) {
                    Ok(commands) => commands,
                    Err(err) => {
                        error!(%err, "Cannot {action} {}", process.label());
                        shortfall.failed.push(CommandFailure {
                            command: format!("{action} {}", process.label()),
                            reason: err.to_string(),
                        });
                        continue;
                    }
                };
                // Instances sharing a binary share their control script.
                if !issued.insert(commands.clone()) {
                    debug!("{action} of {} already issued", process.label());
                    continue;
                }
                // Later steps of a process depend on the earlier ones.
                for command in &commands {
                    if !self.execute(command, shortfall).await? {
                        break;
                    }
                }
            }

            if action == ControlAction::Start {
                if let Some(check) = &application.health_check {
                    let health = self
                        .health_check(check)
                        .instrument(info_span!("health_check", application = %application.name))
                        .await?;
                    match health {
                        Health::Passed => {}
                        Health::Failed => {
                            error!("ALERT: {} failed its health check", application.name);
                            shortfall.unhealthy.push(application.name.clone());
                        }
                        Health::Cancelled => {
                            warn!("Cancelled during the health check of {}", application.name);
                            return Ok(false);
                        }
                    }
                }
            }
        }
        Ok(true)
    }

    /// Runs one command. Failures are recorded, only connectivity loss is fatal.
    async fn execute(&self, command: &str, shortfall: &mut Shortfall) -> Result<bool, PatchError> {
        info!(command, "Executing");
        match self.executor.run(&self.target, command).await {
            Ok(result) => {
                if !result.stdout.trim().is_empty() {
                    debug!(stdout = result.stdout.trim(), "Command output");
                }
                Ok(true)
            }
            Err(source) if source.is_connectivity() => Err(PatchError::Connectivity {
                host: self.target.host.clone(),
                source,
            }),
            Err(err) => {
                error!(command, %err, "Command failed");
                shortfall.failed.push(CommandFailure {
                    command: command.to_string(),
                    reason: err.to_string(),
                });
                Ok(false)
            }
        }
    }

    async fn health_check(&self, check: &HealthCheck) -> Result<Health, PatchError> {
        for attempt in 1..=check.num_retries {
            let run = self.executor.run(&self.target, &check.command);
            match tokio::time::timeout(check.timeout, run).await {
                Ok(Ok(_)) => {
                    info!(attempt, "Health check passed");
                    return Ok(Health::Passed);
                }
                Ok(Err(source)) if source.is_connectivity() => {
                    return Err(PatchError::Connectivity {
                        host: self.target.host.clone(),
                        source,
                    })
                }
                Ok(Err(err)) => warn!(attempt, %err, "Health check failed"),
                Err(_) => warn!(
                    attempt,
                    timeout = %humantime::format_duration(check.timeout),
                    "Health check timed out"
                ),
            }
            if attempt < check.num_retries {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Ok(Health::Cancelled),
                    _ = tokio::time::sleep(check.interval) => {}
                }
            }
        }
        Ok(Health::Failed)
    }
}

enum Health {
    Passed,
    Failed,
    Cancelled,
}
