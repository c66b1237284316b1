//! Acquires a remote build instance for the job.
//!
//! A task moves through `Created -> Polling -> {Assigned | Abandoned | TimedOut}`.
//! Polling borrows the task mutably for the whole loop, so a task can never
//! have two poll loops in flight.

use std::time::Duration;

use tokio::time::{Instant, sleep, timeout};

use crate::backend::{CreateTaskRequest, ProvisioningBackend};
use crate::config::{CONTROL_PORT, DAEMON_SCHEME, POLL_DEADLINE, POLL_INTERVAL, POLL_REQUEST_TIMEOUT};
use crate::error::{Error, Result};
use crate::state::{StateKey, StateStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Created,
    Polling,
    Assigned,
    Abandoned,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildTask {
    pub id: String,
    pub client_key: String,
    pub client_ca_certificate: String,
    pub root_ca_certificate: String,
    pub sticky_disks_enabled: bool,
    assigned_endpoint: Option<String>,
    status: TaskStatus,
}

impl BuildTask {
    pub fn status(&self) -> TaskStatus {
        self.status
    }

    /// Set only once the task reached [`TaskStatus::Assigned`].
    pub fn assigned_endpoint(&self) -> Option<&str> {
        self.assigned_endpoint.as_deref()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOptions {
    /// Overall budget for the poll loop.
    pub deadline: Duration,
    pub interval: Duration,
    /// Upper bound for a single status request; clamped to what is left of
    /// `deadline`.
    pub request_timeout: Duration,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            deadline: POLL_DEADLINE,
            interval: POLL_INTERVAL,
            request_timeout: POLL_REQUEST_TIMEOUT,
        }
    }
}

pub struct TaskProvisioner<B> {
    backend: B,
    options: PollOptions,
    control_port: u16,
}

impl<B: ProvisioningBackend> TaskProvisioner<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            options: PollOptions::default(),
            control_port: CONTROL_PORT,
        }
    }

    pub fn with_options(mut self, options: PollOptions) -> Self {
        self.options = options;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Creates the task and records its handles before any polling starts, so
    /// the post phase can still report and clean up if this process dies.
    pub async fn create_task(
        &self,
        store: &mut dyn StateStore,
        request: &CreateTaskRequest,
    ) -> Result<BuildTask> {
        let res = self.backend.create_task(request).await?;
        if res.id.is_empty() {
            return Err(Error::Protocol(
                "build task created without an id".to_string(),
            ));
        }
        tracing::info!("Created build task {}", res.id);

        store.set(StateKey::BuildTaskId, res.id.as_str().into())?;
        store.set(StateKey::ClientKey, res.client_key.as_str().into())?;
        store.set(
            StateKey::ClientCaCertificate,
            res.client_ca_certificate.as_str().into(),
        )?;
        store.set(
            StateKey::RootCaCertificate,
            res.root_ca_certificate.as_str().into(),
        )?;

        Ok(BuildTask {
            id: res.id,
            client_key: res.client_key,
            client_ca_certificate: res.client_ca_certificate,
            root_ca_certificate: res.root_ca_certificate,
            sticky_disks_enabled: res.sticky_disks_enabled,
            assigned_endpoint: None,
            status: TaskStatus::Created,
        })
    }

    /// Polls until an instance is assigned and returns its daemon address.
    ///
    /// On deadline expiry the task is abandoned once, best effort, and
    /// [`Error::ProvisionTimeout`] is returned.
    pub async fn poll_for_assignment(&self, task: &mut BuildTask) -> Result<String> {
        task.status = TaskStatus::Polling;
        let started = Instant::now();
        let deadline = started + self.options.deadline;
        let mut polls = 0u32;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            polls += 1;
            let budget = remaining.min(self.options.request_timeout);
            match timeout(budget, self.backend.task_status(&task.id)).await {
                Ok(Ok(status)) => {
                    if let Some(instance) = status.ec2_instance {
                        let address =
                            format!("{DAEMON_SCHEME}://{}:{}", instance.instance_ip, self.control_port);
                        tracing::info!(polls, "Build task {} assigned to {address}", task.id);
                        task.assigned_endpoint = Some(address.clone());
                        task.status = TaskStatus::Assigned;
                        return Ok(address);
                    }
                    tracing::debug!(polls, "Build task {} has no instance yet", task.id);
                }
                Ok(Err(e)) => tracing::warn!(polls, "Failed to query build task {}: {e}", task.id),
                Err(_) => tracing::warn!(
                    polls,
                    "Status request for build task {} timed out after {budget:?}",
                    task.id
                ),
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            sleep(self.options.interval.min(remaining)).await;
        }

        let waited = started.elapsed();
        tracing::error!(polls, "No instance assigned to build task {} within {waited:?}", task.id);
        self.abandon(task).await;
        task.status = TaskStatus::TimedOut;
        Err(Error::ProvisionTimeout {
            task_id: task.id.clone(),
            waited,
        })
    }

    /// Releases the backend reservation. Failure is only logged, and the
    /// request is given at most one `request_timeout`.
    pub async fn abandon(&self, task: &mut BuildTask) {
        let limit = self.options.request_timeout;
        match timeout(limit, self.backend.abandon_task(&task.id)).await {
            Ok(Ok(())) => tracing::info!("Abandoned build task {}", task.id),
            Ok(Err(e)) => tracing::warn!("Failed to abandon build task {}: {e}", task.id),
            Err(_) => tracing::warn!(
                "Abandon request for build task {} timed out after {limit:?}",
                task.id
            ),
        }
        task.status = TaskStatus::Abandoned;
    }
}
