//! Post-phase teardown.
//!
//! Teardown is a fixed list of steps. Each step decides from the recorded
//! state whether it applies, and its errors are logged and swallowed so that
//! later steps still run. Only [`TeardownStep::CleanupGate`] can end the
//! sequence early, and only because setup recorded `cleanup = false`.

use std::fmt::{Display, Formatter};
use std::path::Path;

use anyhow::{Context, Result, anyhow};

use crate::backend::ProvisioningBackend;
use crate::builder::BuilderControl;
use crate::config::{DEFAULT_DRIVER, POLL_REQUEST_TIMEOUT};
use crate::state::StateRecord;
use crate::sticky_disk::{DiskHost, StickyDiskManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStep {
    CaptureDebugLogs,
    ReportCompletion,
    CleanupGate,
    RemoveBuilder,
    RemoveCertsDir,
}

pub const TEARDOWN_SEQUENCE: [TeardownStep; 5] = [
    TeardownStep::CaptureDebugLogs,
    TeardownStep::ReportCompletion,
    TeardownStep::CleanupGate,
    TeardownStep::RemoveBuilder,
    TeardownStep::RemoveCertsDir,
];

impl Display for TeardownStep {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TeardownStep::CaptureDebugLogs => "capture debug logs",
            TeardownStep::ReportCompletion => "report completion",
            TeardownStep::CleanupGate => "cleanup gate",
            TeardownStep::RemoveBuilder => "remove builder",
            TeardownStep::RemoveCertsDir => "remove certs dir",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Completed,
    /// The step's own precondition was not met.
    Skipped,
    Failed(String),
    /// The step ended the sequence.
    Halted,
    /// An earlier step ended the sequence.
    NotRun,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub outcomes: Vec<(TeardownStep, StepOutcome)>,
}

impl TeardownReport {
    pub fn outcome(&self, step: TeardownStep) -> Option<&StepOutcome> {
        self.outcomes
            .iter()
            .find(|(s, _)| *s == step)
            .map(|(_, outcome)| outcome)
    }

    pub fn failures(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, StepOutcome::Failed(_)))
            .count()
    }
}

enum Flow {
    Done,
    Skip,
    Halt,
}

pub struct TeardownCoordinator<'a, H> {
    record: &'a StateRecord,
    backend: Option<&'a dyn ProvisioningBackend>,
    builder: &'a dyn BuilderControl,
    sticky_disk: StickyDiskManager<H>,
}

impl<'a, H: DiskHost> TeardownCoordinator<'a, H> {
    pub fn new(
        record: &'a StateRecord,
        backend: Option<&'a dyn ProvisioningBackend>,
        builder: &'a dyn BuilderControl,
        sticky_disk: StickyDiskManager<H>,
    ) -> Self {
        Self {
            record,
            backend,
            builder,
            sticky_disk,
        }
    }

    pub fn sticky_disk(&self) -> &StickyDiskManager<H> {
        &self.sticky_disk
    }

    pub async fn run(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        let mut halted = false;

        for step in TEARDOWN_SEQUENCE {
            if halted {
                report.outcomes.push((step, StepOutcome::NotRun));
                continue;
            }

            let outcome = match self.run_step(step).await {
                Ok(Flow::Done) => StepOutcome::Completed,
                Ok(Flow::Skip) => StepOutcome::Skipped,
                Ok(Flow::Halt) => {
                    halted = true;
                    StepOutcome::Halted
                }
                Err(e) => {
                    tracing::warn!("Teardown step `{step}` failed: {e:#}");
                    StepOutcome::Failed(format!("{e:#}"))
                }
            };
            tracing::debug!("Teardown step `{step}`: {outcome:?}");
            report.outcomes.push((step, outcome));
        }

        report
    }

    async fn run_step(&mut self, step: TeardownStep) -> Result<Flow> {
        match step {
            TeardownStep::CaptureDebugLogs => self.capture_debug_logs().await,
            TeardownStep::ReportCompletion => self.report_completion().await,
            TeardownStep::CleanupGate => Ok(self.cleanup_gate()),
            TeardownStep::RemoveBuilder => self.remove_builder().await,
            TeardownStep::RemoveCertsDir => self.remove_certs_dir().await,
        }
    }

    async fn capture_debug_logs(&self) -> Result<Flow> {
        if !self.record.is_debug || self.record.container_name.is_empty() {
            return Ok(Flow::Skip);
        }
        let container = &self.record.container_name;
        let logs = self.builder.daemon_logs(container).await?;
        tracing::info!("Build daemon logs from {container}:");
        for line in logs.lines() {
            tracing::info!(target: "remote_builder::daemon", "{line}");
        }
        Ok(Flow::Done)
    }

    async fn report_completion(&self) -> Result<Flow> {
        let task_id = &self.record.build_task_id;
        if task_id.is_empty() {
            return Ok(Flow::Skip);
        }
        let backend = self
            .backend
            .ok_or_else(|| anyhow!("no provisioning backend configured to report task {task_id}"))?;
        tokio::time::timeout(POLL_REQUEST_TIMEOUT, backend.complete_task(task_id))
            .await
            .map_err(|_| anyhow!("completion report timed out after {POLL_REQUEST_TIMEOUT:?}"))
            .and_then(|res| res.map_err(anyhow::Error::from))
            .with_context(|| format!("Failed to report completion of build task {task_id}"))?;
        tracing::info!("Reported completion of build task {task_id}");
        Ok(Flow::Done)
    }

    fn cleanup_gate(&self) -> Flow {
        if self.record.cleanup {
            Flow::Done
        } else {
            tracing::info!("Cleanup disabled, leaving builder and certificates in place");
            Flow::Halt
        }
    }

    async fn remove_builder(&mut self) -> Result<Flow> {
        let name = &self.record.builder_name;
        if name.is_empty() || self.record.builder_driver == DEFAULT_DRIVER {
            return Ok(Flow::Skip);
        }

        if self.record.is_sticky_disks_enabled {
            let outcome = self.sticky_disk.unmount().await;
            tracing::debug!("Sticky disk release: {outcome:?}");
        }

        self.builder
            .remove_builder(name)
            .await
            .with_context(|| format!("Failed to remove builder {name}"))?;
        tracing::info!("Removed builder {name}");
        Ok(Flow::Done)
    }

    async fn remove_certs_dir(&self) -> Result<Flow> {
        let certs_dir = Path::new(&self.record.certs_dir);
        if self.record.certs_dir.is_empty() || !certs_dir.exists() {
            return Ok(Flow::Skip);
        }
        tokio::fs::remove_dir_all(certs_dir)
            .await
            .with_context(|| format!("Failed to remove {}", certs_dir.display()))?;
        tracing::info!("Removed certificates at {}", certs_dir.display());
        Ok(Flow::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CreateTaskRequest, CreateTaskResponse, TaskStatusResponse};
    use crate::builder::tests::RecordingBuilder;
    use crate::error::{Error, Result as ProvisionResult};
    use crate::sticky_disk::tests::RecordingHost;
    use std::sync::{Arc, Mutex};

    struct RecordingBackend {
        calls: Arc<Mutex<Vec<String>>>,
        fail: bool,
        hang: bool,
    }

    #[async_trait::async_trait]
    impl ProvisioningBackend for RecordingBackend {
        async fn create_task(&self, _: &CreateTaskRequest) -> ProvisionResult<CreateTaskResponse> {
            unreachable!("teardown never creates tasks")
        }

        async fn task_status(&self, _: &str) -> ProvisionResult<TaskStatusResponse> {
            unreachable!("teardown never polls")
        }

        async fn abandon_task(&self, _: &str) -> ProvisionResult<()> {
            unreachable!("teardown never abandons")
        }

        async fn complete_task(&self, task_id: &str) -> ProvisionResult<()> {
            self.calls.lock().unwrap().push(format!("complete {task_id}"));
            if self.hang {
                std::future::pending::<()>().await;
            }
            if self.fail {
                return Err(Error::State(anyhow!("backend unavailable")));
            }
            Ok(())
        }
    }

    struct Harness {
        log: Arc<Mutex<Vec<String>>>,
        backend: RecordingBackend,
        builder: RecordingBuilder,
        host: RecordingHost,
    }

    impl Harness {
        fn new() -> Self {
            let log: Arc<Mutex<Vec<String>>> = Default::default();
            Self {
                backend: RecordingBackend {
                    calls: log.clone(),
                    fail: false,
                    hang: false,
                },
                builder: RecordingBuilder::with_log(log.clone()),
                host: RecordingHost::with_log(log.clone()),
                log,
            }
        }

        async fn run(&self, record: &StateRecord) -> TeardownReport {
            let disk = StickyDiskManager::restore(self.host.clone(), record.is_sticky_disks_enabled);
            let mut coordinator =
                TeardownCoordinator::new(record, Some(&self.backend), &self.builder, disk);
            coordinator.run().await
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    fn full_record(certs_dir: &Path) -> StateRecord {
        StateRecord {
            builder_name: "rb-42".to_string(),
            builder_driver: "remote".to_string(),
            container_name: "buildx_buildkit_rb-420".to_string(),
            certs_dir: certs_dir.display().to_string(),
            cleanup: true,
            is_debug: true,
            build_task_id: "42".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_full_sequence_runs_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let certs = dir.path().join("certs");
        std::fs::create_dir_all(&certs).unwrap();
        std::fs::write(certs.join("key.pem"), "key").unwrap();
        let harness = Harness::new();

        let report = harness.run(&full_record(&certs)).await;

        assert_eq!(
            report.outcomes,
            TEARDOWN_SEQUENCE
                .iter()
                .map(|step| (*step, StepOutcome::Completed))
                .collect::<Vec<_>>()
        );
        assert_eq!(
            harness.log(),
            vec!["logs buildx_buildkit_rb-420", "complete 42", "remove rb-42"]
        );
        assert!(!certs.exists());
    }

    #[tokio::test]
    async fn test_cleanup_disabled_stops_before_removal() {
        let dir = tempfile::tempdir().unwrap();
        let certs = dir.path().join("certs");
        std::fs::create_dir_all(&certs).unwrap();
        let harness = Harness::new();
        let record = StateRecord {
            cleanup: false,
            is_sticky_disks_enabled: true,
            ..full_record(&certs)
        };

        let report = harness.run(&record).await;

        assert_eq!(report.outcome(TeardownStep::CaptureDebugLogs), Some(&StepOutcome::Completed));
        assert_eq!(report.outcome(TeardownStep::ReportCompletion), Some(&StepOutcome::Completed));
        assert_eq!(report.outcome(TeardownStep::CleanupGate), Some(&StepOutcome::Halted));
        assert_eq!(report.outcome(TeardownStep::RemoveBuilder), Some(&StepOutcome::NotRun));
        assert_eq!(report.outcome(TeardownStep::RemoveCertsDir), Some(&StepOutcome::NotRun));
        assert_eq!(harness.log(), vec!["logs buildx_buildkit_rb-420", "complete 42"]);
        assert!(certs.exists());
    }

    #[tokio::test]
    async fn test_cleanup_disabled_without_debug_or_task() {
        let harness = Harness::new();
        let record = StateRecord {
            builder_name: "rb-42".to_string(),
            builder_driver: "remote".to_string(),
            container_name: "buildx_buildkit_rb-420".to_string(),
            ..Default::default()
        };

        let report = harness.run(&record).await;

        assert_eq!(report.outcome(TeardownStep::CaptureDebugLogs), Some(&StepOutcome::Skipped));
        assert_eq!(report.outcome(TeardownStep::ReportCompletion), Some(&StepOutcome::Skipped));
        assert_eq!(report.outcome(TeardownStep::CleanupGate), Some(&StepOutcome::Halted));
        assert!(harness.log().is_empty());
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_later_steps() {
        let dir = tempfile::tempdir().unwrap();
        let certs = dir.path().join("certs");
        std::fs::create_dir_all(&certs).unwrap();
        let mut harness = Harness::new();
        harness.backend.fail = true;
        harness.builder.fail_logs = true;
        harness.builder.fail_remove = true;

        let report = harness.run(&full_record(&certs)).await;

        assert_eq!(report.failures(), 3);
        assert!(matches!(
            report.outcome(TeardownStep::RemoveBuilder),
            Some(StepOutcome::Failed(msg)) if msg.contains("rb-42")
        ));
        assert_eq!(report.outcome(TeardownStep::RemoveCertsDir), Some(&StepOutcome::Completed));
        assert!(!certs.exists());
    }

    #[tokio::test]
    async fn test_default_driver_or_missing_name_keeps_builder() {
        let harness = Harness::new();
        for (name, driver) in [("rb-42", "docker"), ("", "remote")] {
            let record = StateRecord {
                builder_name: name.to_string(),
                builder_driver: driver.to_string(),
                cleanup: true,
                is_sticky_disks_enabled: true,
                ..Default::default()
            };
            let report = harness.run(&record).await;
            assert_eq!(report.outcome(TeardownStep::RemoveBuilder), Some(&StepOutcome::Skipped));
            assert_eq!(report.outcome(TeardownStep::RemoveCertsDir), Some(&StepOutcome::Skipped));
        }
        assert!(harness.log().is_empty());
    }

    #[tokio::test]
    async fn test_sticky_disk_is_committed_before_builder_removal() {
        let harness = Harness::new();
        let record = StateRecord {
            builder_name: "rb-42".to_string(),
            builder_driver: "remote".to_string(),
            cleanup: true,
            is_sticky_disks_enabled: true,
            ..Default::default()
        };

        let report = harness.run(&record).await;

        assert_eq!(report.outcome(TeardownStep::RemoveBuilder), Some(&StepOutcome::Completed));
        assert_eq!(
            harness.log(),
            vec![
                "stop_daemon",
                "unmount /var/lib/buildkit",
                "marker /var/run/remote-builder/stickydisk.commit",
                "remove rb-42",
            ]
        );
    }

    #[tokio::test]
    async fn test_sticky_disk_failure_still_removes_builder() {
        let mut harness = Harness::new();
        harness.host.fail_unmount = true;
        let record = StateRecord {
            builder_name: "rb-42".to_string(),
            builder_driver: "remote".to_string(),
            cleanup: true,
            is_sticky_disks_enabled: true,
            ..Default::default()
        };

        let report = harness.run(&record).await;

        assert_eq!(report.outcome(TeardownStep::RemoveBuilder), Some(&StepOutcome::Completed));
        assert_eq!(
            harness.log(),
            vec!["stop_daemon", "unmount /var/lib/buildkit", "remove rb-42"]
        );
    }

    #[tokio::test]
    async fn test_missing_backend_fails_only_completion() {
        let harness = Harness::new();
        let record = StateRecord {
            build_task_id: "42".to_string(),
            cleanup: true,
            ..Default::default()
        };
        let disk = StickyDiskManager::restore(harness.host.clone(), false);
        let mut coordinator = TeardownCoordinator::new(&record, None, &harness.builder, disk);

        let report = coordinator.run().await;

        assert!(matches!(
            report.outcome(TeardownStep::ReportCompletion),
            Some(StepOutcome::Failed(_))
        ));
        assert_eq!(report.outcome(TeardownStep::CleanupGate), Some(&StepOutcome::Completed));
        assert!(!coordinator.sticky_disk().disk().mounted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_completion_report_is_cut_off() {
        let dir = tempfile::tempdir().unwrap();
        let certs = dir.path().join("certs");
        std::fs::create_dir_all(&certs).unwrap();
        let mut harness = Harness::new();
        harness.backend.hang = true;
        let start = tokio::time::Instant::now();

        let report = harness.run(&full_record(&certs)).await;

        assert_eq!(start.elapsed(), POLL_REQUEST_TIMEOUT);
        assert!(matches!(
            report.outcome(TeardownStep::ReportCompletion),
            Some(StepOutcome::Failed(msg)) if msg.contains("timed out")
        ));
        assert_eq!(report.outcome(TeardownStep::RemoveBuilder), Some(&StepOutcome::Completed));
        assert_eq!(report.outcome(TeardownStep::RemoveCertsDir), Some(&StepOutcome::Completed));
        assert!(!certs.exists());
    }
}
