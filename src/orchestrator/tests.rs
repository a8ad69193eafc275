use super::*;
use crate::configs::{CommandStep, HealthCheck};
use crate::confirm::AssumeYes;
use crate::control::ApacheControl;
use crate::process::{LocalInventory, ProcessContext, ProcessRecord};
use crate::testing::{
    application, context, record, target, FakeExecutor, FakeSource, Journal, MemoryStore,
};
use async_trait::async_trait;
use std::time::Duration;

const SITE_A: &str = "/u/apache/site-a/bin/httpd";
const SITE_B: &str = "/u/apache/site-b/bin/httpd";

struct Decline;

#[async_trait]
impl Confirmation for Decline {
    async fn confirm(
        &self,
        _host: &str,
        _discovered: &[ApplicationProcesses],
    ) -> Result<bool, PatchError> {
        Ok(false)
    }
}

/// Cancels the run once the first process has been handled.
struct CancelAfterFirst {
    cancel: CancellationToken,
}

impl ServerControl for CancelAfterFirst {
    fn commands(
        &self,
        action: ControlAction,
        application: &Application,
        process: &ProcessContext,
    ) -> Result<Vec<String>, PatchError> {
        self.cancel.cancel();
        ApacheControl.commands(action, application, process)
    }
}

fn config(applications: Vec<Application>) -> Arc<PatcherConfig> {
    let mut config: PatcherConfig = serde_yaml::from_str("applications: []").unwrap();
    config.applications = applications;
    Arc::new(config)
}

fn httpd(pid: u32, executable: &str) -> ProcessRecord {
    record(pid, 1, executable, &[executable, "-k", "start"])
}

struct Harness {
    journal: Journal,
    executor: Arc<FakeExecutor>,
}

impl Harness {
    fn new() -> Self {
        let journal = Journal::default();
        Self {
            executor: Arc::new(FakeExecutor::with_journal(journal.clone())),
            journal,
        }
    }

    fn orchestrator(
        &self,
        applications: Vec<Application>,
        tables: Vec<Vec<ProcessRecord>>,
        store: MemoryStore,
    ) -> Orchestrator {
        Orchestrator::new(
            config(applications),
            target(),
            Box::new(ApacheControl),
            self.executor.clone(),
            Box::new(LocalInventory::new(Box::new(FakeSource::new(tables)))),
            Box::new(store),
        )
    }

    fn store(&self) -> MemoryStore {
        MemoryStore::with_journal(self.journal.clone())
    }

    fn saves(&self) -> usize {
        self.journal
            .lock()
            .iter()
            .filter(|entry| entry.starts_with("save: "))
            .count()
    }
}

fn snapshot_of(processes: Vec<ProcessContext>) -> Snapshot {
    Snapshot::new(
        "10.3.0.4",
        vec![ApplicationProcesses {
            name: "httpd".into(),
            processes,
        }],
    )
}

#[tokio::test]
async fn stop_with_nothing_running_has_no_side_effects() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator(
        vec![application("httpd", "httpd")],
        vec![vec![record(40, 1, "/usr/sbin/sshd", &["/usr/sbin/sshd", "-D"])]],
        harness.store(),
    );

    let outcome = orchestrator.stop(&AssumeYes).await.unwrap();
    assert_eq!(outcome, Outcome::NothingToDo);
    assert!(harness.journal.lock().is_empty());
}

#[tokio::test]
async fn declined_stop_has_no_side_effects() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator(
        vec![application("httpd", "httpd")],
        vec![vec![httpd(812, SITE_A)]],
        harness.store(),
    );

    let outcome = orchestrator.stop(&Decline).await.unwrap();
    assert_eq!(outcome, Outcome::Declined);
    assert!(harness.journal.lock().is_empty());
}

#[tokio::test]
async fn stop_persists_snapshot_before_first_command() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator(
        vec![application("httpd", "httpd")],
        vec![vec![httpd(812, SITE_A), httpd(901, SITE_B)], vec![]],
        harness.store(),
    );

    let outcome = orchestrator.stop(&AssumeYes).await.unwrap();
    assert_eq!(outcome, Outcome::Stopped);
    assert_eq!(
        harness.journal.lock().clone(),
        vec![
            "save: 10.3.0.4",
            "run: /u/apache/site-a/bin/apachectl stop",
            "run: /u/apache/site-b/bin/apachectl stop",
        ]
    );
}

#[tokio::test]
async fn failed_stop_command_leaves_partial_outcome_naming_survivor() {
    let harness = Harness::new();
    harness.executor.fail_transport("site-b/bin/apachectl stop");
    let orchestrator = harness.orchestrator(
        vec![application("httpd", "httpd")],
        vec![
            vec![httpd(812, SITE_A), httpd(901, SITE_B)],
            vec![httpd(901, SITE_B)],
        ],
        harness.store(),
    );

    let outcome = orchestrator.stop(&AssumeYes).await.unwrap();
    let Outcome::PartiallyStopped(shortfall) = outcome else {
        panic!("expected a partial stop, got {outcome}");
    };
    assert_eq!(shortfall.unaccounted, vec![format!("httpd ({SITE_B})")]);
    assert_eq!(shortfall.failed.len(), 1);
    assert_eq!(shortfall.failed[0].command, "/u/apache/site-b/bin/apachectl stop");
    assert_eq!(harness.executor.commands().len(), 2);
}

#[tokio::test]
async fn snapshot_failure_aborts_before_any_command() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator(
        vec![application("httpd", "httpd")],
        vec![vec![httpd(812, SITE_A)]],
        MemoryStore::failing(harness.journal.clone()),
    );

    let err = orchestrator.stop(&AssumeYes).await.unwrap_err();
    assert!(matches!(err, PatchError::Snapshot(_)));
    assert!(harness.executor.commands().is_empty());
}

#[tokio::test]
async fn lost_connection_aborts_the_host() {
    let harness = Harness::new();
    harness.executor.fail_connect_on("site-a/bin/apachectl stop");
    let orchestrator = harness.orchestrator(
        vec![application("httpd", "httpd")],
        vec![vec![httpd(812, SITE_A), httpd(901, SITE_B)]],
        harness.store(),
    );

    let err = orchestrator.stop(&AssumeYes).await.unwrap_err();
    assert!(matches!(err, PatchError::Connectivity { ref host, .. } if host == "10.3.0.4"));
    assert_eq!(harness.saves(), 1);
    assert_eq!(
        harness.executor.commands(),
        vec!["/u/apache/site-a/bin/apachectl stop"]
    );
}

#[tokio::test]
async fn process_is_only_claimed_by_first_matching_application() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator(
        vec![application("apache", "httpd"), application("site-a", "site-a")],
        vec![vec![httpd(812, SITE_A)], vec![httpd(812, SITE_A)], vec![]],
        harness.store(),
    );

    orchestrator.stop(&AssumeYes).await.unwrap();
    assert_eq!(
        harness.executor.commands(),
        vec!["/u/apache/site-a/bin/apachectl stop"]
    );
}

#[tokio::test]
async fn later_steps_are_skipped_after_a_failed_step() {
    let harness = Harness::new();
    let mut app = application("httpd", "httpd");
    app.stop_steps = vec![
        CommandStep {
            command: "{{dir}}/{{control_script}} graceful-stop".into(),
        },
        CommandStep {
            command: "rm -f {{dir}}/../logs/httpd.pid".into(),
        },
    ];
    harness.executor.fail_exit("graceful-stop", 1);
    let orchestrator = harness.orchestrator(
        vec![app],
        vec![vec![httpd(812, SITE_A)], vec![]],
        harness.store(),
    );

    let outcome = orchestrator.stop(&AssumeYes).await.unwrap();
    assert!(matches!(outcome, Outcome::PartiallyStopped(_)));
    assert_eq!(
        harness.executor.commands(),
        vec!["/u/apache/site-a/bin/apachectl graceful-stop"]
    );
}

#[tokio::test]
async fn cancellation_is_honoured_between_processes() {
    let harness = Harness::new();
    let cancel = CancellationToken::new();
    let orchestrator = Orchestrator::new(
        config(vec![application("httpd", "httpd")]),
        target(),
        Box::new(CancelAfterFirst {
            cancel: cancel.clone(),
        }),
        harness.executor.clone(),
        Box::new(LocalInventory::new(Box::new(FakeSource::new(vec![vec![
            httpd(812, SITE_A),
            httpd(901, SITE_B),
        ]])))),
        Box::new(harness.store()),
    )
    .with_cancellation(cancel);

    let outcome = orchestrator.stop(&AssumeYes).await.unwrap();
    assert!(matches!(outcome, Outcome::Cancelled(_)));
    assert_eq!(
        harness.executor.commands(),
        vec!["/u/apache/site-a/bin/apachectl stop"]
    );
}

#[tokio::test]
async fn start_runs_control_script_next_to_recorded_binary() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator(
        vec![application("httpd", "httpd")],
        vec![vec![record(30, 1, "/opt/app/bin/httpd", &["/opt/app/bin/httpd"])]],
        MemoryStore::holding(snapshot_of(vec![context(12, "/opt/app/bin/httpd")])),
    );

    let outcome = orchestrator.start().await.unwrap();
    assert_eq!(outcome, Outcome::Started);
    assert_eq!(
        harness.executor.commands(),
        vec!["/opt/app/bin/apachectl start"]
    );
}

#[tokio::test]
async fn start_reports_processes_that_did_not_come_back() {
    let harness = Harness::new();
    harness.executor.fail_exit("site-b/bin/apachectl start", 1);
    let orchestrator = harness.orchestrator(
        vec![application("httpd", "httpd")],
        vec![vec![httpd(1200, SITE_A)]],
        MemoryStore::holding(snapshot_of(vec![context(812, SITE_A), context(901, SITE_B)])),
    );

    let outcome = orchestrator.start().await.unwrap();
    let Outcome::PartiallyStarted(shortfall) = outcome else {
        panic!("expected a partial start, got {outcome}");
    };
    assert_eq!(shortfall.unaccounted, vec![format!("httpd ({SITE_B})")]);
    assert_eq!(shortfall.failed.len(), 1);
    // Both starts were attempted.
    assert_eq!(harness.executor.commands().len(), 2);
}

#[tokio::test]
async fn start_without_snapshot_is_fatal() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator(
        vec![application("httpd", "httpd")],
        vec![vec![]],
        harness.store(),
    );

    let err = orchestrator.start().await.unwrap_err();
    assert!(matches!(err, PatchError::Snapshot(SnapshotError::NotFound(_))));
    assert!(harness.executor.commands().is_empty());
}

#[tokio::test]
async fn start_rejects_snapshot_of_unconfigured_application() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator(
        vec![application("tomcat", "catalina")],
        vec![vec![]],
        MemoryStore::holding(snapshot_of(vec![context(812, SITE_A)])),
    );

    let err = orchestrator.start().await.unwrap_err();
    assert!(matches!(err, PatchError::Config(_)));
    assert!(harness.executor.commands().is_empty());
}

#[tokio::test]
async fn health_check_is_retried_then_reported() {
    let harness = Harness::new();
    let mut app = application("httpd", "httpd");
    app.health_check = Some(HealthCheck {
        command: "curl -sf http://localhost/".into(),
        num_retries: 3,
        timeout: Duration::from_secs(1),
        interval: Duration::ZERO,
    });
    harness.executor.fail_exit("curl", 7);
    let orchestrator = harness.orchestrator(
        vec![app],
        vec![vec![httpd(1200, SITE_A)]],
        MemoryStore::holding(snapshot_of(vec![context(812, SITE_A)])),
    );

    let outcome = orchestrator.start().await.unwrap();
    let Outcome::PartiallyStarted(shortfall) = outcome else {
        panic!("expected a partial start, got {outcome}");
    };
    assert_eq!(shortfall.unhealthy, vec!["httpd"]);
    let checks = harness
        .executor
        .commands()
        .into_iter()
        .filter(|command| command.starts_with("curl"))
        .count();
    assert_eq!(checks, 3);
}

#[tokio::test]
async fn passing_health_check_keeps_start_complete() {
    let harness = Harness::new();
    let mut app = application("httpd", "httpd");
    app.health_check = Some(HealthCheck {
        command: "curl -sf http://localhost/".into(),
        num_retries: 3,
        timeout: Duration::from_secs(1),
        interval: Duration::ZERO,
    });
    let orchestrator = harness.orchestrator(
        vec![app],
        vec![vec![httpd(1200, SITE_A)]],
        MemoryStore::holding(snapshot_of(vec![context(812, SITE_A)])),
    );

    assert_eq!(orchestrator.start().await.unwrap(), Outcome::Started);
    assert_eq!(
        harness.executor.commands(),
        vec!["/u/apache/site-a/bin/apachectl start", "curl -sf http://localhost/"]
    );
}

#[test]
fn report_lists_every_shortfall() {
    let outcome = Outcome::PartiallyStopped(Shortfall {
        failed: vec![CommandFailure {
            command: "/u/apache/site-b/bin/apachectl stop".into(),
            reason: "broken pipe".into(),
        }],
        unaccounted: vec![format!("httpd ({SITE_B})")],
        unhealthy: vec![],
    });
    assert!(!outcome.is_complete());
    assert_eq!(
        outcome.report(),
        vec![
            "Result: partially stopped".to_string(),
            format!("Still running: httpd ({SITE_B})"),
            "Failed: /u/apache/site-b/bin/apachectl stop (broken pipe)".to_string(),
        ]
    );
    assert!(Outcome::NothingToDo.is_complete());
}

#[tokio::test]
async fn one_survivor_accounts_for_only_one_recorded_instance() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator(
        vec![application("httpd", "httpd")],
        vec![vec![httpd(1200, SITE_A)]],
        MemoryStore::holding(snapshot_of(vec![context(812, SITE_A), context(813, SITE_A)])),
    );

    let outcome = orchestrator.start().await.unwrap();
    let Outcome::PartiallyStarted(shortfall) = outcome else {
        panic!("expected a partial start, got {outcome}");
    };
    assert_eq!(shortfall.unaccounted, vec![format!("httpd ({SITE_A})")]);
    assert!(shortfall.failed.is_empty());
    assert_eq!(
        harness.executor.commands(),
        vec!["/u/apache/site-a/bin/apachectl start"]
    );
}

#[tokio::test]
async fn instances_of_one_binary_are_stopped_once() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator(
        vec![application("httpd", "httpd")],
        vec![vec![httpd(812, SITE_A), httpd(813, SITE_A), httpd(901, SITE_B)], vec![]],
        harness.store(),
    );

    let outcome = orchestrator.stop(&AssumeYes).await.unwrap();
    assert_eq!(outcome, Outcome::Stopped);
    assert_eq!(
        harness.executor.commands(),
        vec![
            "/u/apache/site-a/bin/apachectl stop",
            "/u/apache/site-b/bin/apachectl stop",
        ]
    );
}

#[tokio::test]
async fn cancellation_during_health_check_ends_cancelled() {
    let harness = Harness::new();
    let cancel = CancellationToken::new();
    let mut app = application("httpd", "httpd");
    app.health_check = Some(HealthCheck {
        command: "curl -sf http://localhost/".into(),
        num_retries: 3,
        timeout: Duration::from_secs(1),
        interval: Duration::from_secs(60),
    });
    harness.executor.fail_exit("curl", 7);
    let orchestrator = Orchestrator::new(
        config(vec![app]),
        target(),
        Box::new(CancelAfterFirst {
            cancel: cancel.clone(),
        }),
        harness.executor.clone(),
        Box::new(LocalInventory::new(Box::new(FakeSource::new(vec![vec![
            httpd(1200, SITE_A),
        ]])))),
        Box::new(MemoryStore::holding(snapshot_of(vec![context(812, SITE_A)]))),
    )
    .with_cancellation(cancel);

    let outcome = orchestrator.start().await.unwrap();
    let Outcome::Cancelled(shortfall) = outcome else {
        panic!("expected a cancelled start, got {outcome}");
    };
    assert!(shortfall.unhealthy.is_empty());
    assert_eq!(
        harness.executor.commands(),
        vec!["/u/apache/site-a/bin/apachectl start", "curl -sf http://localhost/"]
    );
}
