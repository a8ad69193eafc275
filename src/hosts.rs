//! Runs stop or start across the hosts given on the command line.

use crate::classifier::HostClassifier;
use crate::configs::{DiscoveryMode, PatcherConfig, SnapshotLocation};
use crate::confirm::{AssumeYes, Confirmation, TerminalPrompt};
use crate::control::{self, ControlAction};
use crate::error::PatchError;
use crate::notify::{self, Notifier};
use crate::orchestrator::{Orchestrator, Outcome, Shortfall};
use crate::process::{LocalInventory, ProcessInventory, RemoteInventory, SystemProcesses};
use crate::remote::{RemoteExecutor, Target};
use crate::snapshot::{LocalSnapshotStore, RemoteSnapshotStore, SnapshotStore};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

pub struct HostReport {
    pub host: String,
    pub result: Result<Outcome, PatchError>,
}

pub struct HostRunner {
    config: Arc<PatcherConfig>,
    classifier: HostClassifier,
    executor: Arc<dyn RemoteExecutor>,
    notifier: Box<dyn Notifier>,
    cancel: CancellationToken,
    assume_yes: bool,
}

impl HostRunner {
    pub fn new(
        config: Arc<PatcherConfig>,
        executor: Arc<dyn RemoteExecutor>,
        cancel: CancellationToken,
        assume_yes: bool,
    ) -> Result<Self, PatchError> {
        Ok(Self {
            classifier: HostClassifier::new(&config.server_types)?,
            notifier: notify::for_config(&config.notifications),
            config,
            executor,
            cancel,
            assume_yes,
        })
    }

    pub fn with_notifier(mut self, notifier: Box<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Reports come back in the order the targets were given.
    pub async fn run_all(
        self: Arc<Self>,
        action: ControlAction,
        targets: Vec<Target>,
        parallel: bool,
    ) -> Vec<HostReport> {
        if parallel {
            let handles: Vec<_> = targets
                .into_iter()
                .map(|target| {
                    let host = target.host.clone();
                    let runner = self.clone();
                    let handle = tokio::spawn(
                        async move { runner.run_host(action, target).await }
                            .instrument(info_span!("host", host = %host)),
                    );
                    (host, handle)
                })
                .collect();

            let mut reports = Vec::with_capacity(handles.len());
            for (host, handle) in handles {
                let result = handle.await.unwrap_or_else(|err| Err(err.into()));
                reports.push(HostReport { host, result });
            }
            reports
        } else {
            let mut reports = Vec::with_capacity(targets.len());
            for target in targets {
                let host = target.host.clone();
                let result = if self.cancel.is_cancelled() {
                    warn!(host = %host, "Cancelled, host skipped");
                    Ok(Outcome::Cancelled(Shortfall::default()))
                } else {
                    self.run_host(action, target)
                        .instrument(info_span!("host", host = %host))
                        .await
                };
                reports.push(HostReport { host, result });
            }
            reports
        }
    }

    async fn run_host(&self, action: ControlAction, target: Target) -> Result<Outcome, PatchError> {
        info!("Running {action}");
        let result = self.orchestrate(action, &target).await;

        let (status, lines) = match &result {
            Ok(outcome) => {
                let lines = outcome.report();
                if outcome.is_complete() {
                    info!(%outcome, "Host finished");
                } else {
                    warn!(%outcome, "Host finished with shortfall");
                }
                (outcome.to_string(), lines)
            }
            Err(err) => {
                error!(%err, "Host failed");
                ("failed".to_string(), vec![format!("Error: {err}")])
            }
        };
        let subject = format!("Server patching {action} on {}: {status}", target.host);
        self.notifier.notify(&target.host, &subject, &lines).await;
        result
    }

    async fn orchestrate(
        &self,
        action: ControlAction,
        target: &Target,
    ) -> Result<Outcome, PatchError> {
        let orchestrator = self.orchestrator(target)?;
        match action {
            ControlAction::Stop => {
                let gate: &dyn Confirmation = if self.assume_yes {
                    &AssumeYes
                } else {
                    &TerminalPrompt
                };
                orchestrator.stop(gate).await
            }
            ControlAction::Start => orchestrator.start().await,
        }
    }

    fn orchestrator(&self, target: &Target) -> Result<Orchestrator, PatchError> {
        let server_type = self.classifier.classify(&target.host);
        info!(%server_type, "Classified host");
        let control = control::for_server_type(server_type)?;

        let inventory: Box<dyn ProcessInventory> = match self.config.discovery {
            DiscoveryMode::Local => Box::new(LocalInventory::new(Box::new(SystemProcesses))),
            DiscoveryMode::Remote => Box::new(RemoteInventory::new(
                self.executor.clone(),
                target.clone(),
            )),
        };
        let snapshots: Box<dyn SnapshotStore> = match self.config.snapshot.location {
            SnapshotLocation::Local => {
                Box::new(LocalSnapshotStore::new(self.config.snapshot.clone()))
            }
            SnapshotLocation::Remote => Box::new(RemoteSnapshotStore::new(
                self.config.snapshot.clone(),
                self.executor.clone(),
                target.clone(),
            )),
        };

        Ok(Orchestrator::new(
            self.config.clone(),
            target.clone(),
            control,
            self.executor.clone(),
            inventory,
            snapshots,
        )
        .with_cancellation(self.cancel.clone()))
    }
}

/// 0 when every host fully succeeded, 2 when some host fell short, 1 on any fatal error.
pub fn exit_status(reports: &[HostReport]) -> u8 {
    if reports.iter().any(|report| report.result.is_err()) {
        1
    } else if reports
        .iter()
        .any(|report| matches!(&report.result, Ok(outcome) if !outcome.is_complete()))
    {
        2
    } else {
        0
    }
}
