use std::path::Path;

use anyhow::{Context, Result, bail};
use tokio::process::Command;

/// The build tool's view of builders. Only the operations the setup and post
/// phases need.
#[async_trait::async_trait]
pub trait BuilderControl: Send + Sync {
    /// Registers a builder that talks to the daemon at `endpoint` over mTLS
    /// using the certificates in `certs_dir`.
    async fn create_remote_builder(
        &self,
        name: &str,
        endpoint: &str,
        certs_dir: &Path,
    ) -> Result<()>;

    async fn daemon_logs(&self, container: &str) -> Result<String>;

    /// Stops the builder and deletes it.
    async fn remove_builder(&self, name: &str) -> Result<()>;
}

/// Name buildx gives the daemon container of a builder's first node.
pub fn container_name(builder: &str) -> String {
    format!("buildx_buildkit_{builder}0")
}

/// Drives `docker buildx`, or the standalone `buildx` binary.
#[derive(Debug, Clone, Default)]
pub struct BuildxCli {
    standalone: bool,
}

impl BuildxCli {
    pub fn new(standalone: bool) -> Self {
        Self { standalone }
    }

    fn buildx(&self) -> Command {
        if self.standalone {
            Command::new("buildx")
        } else {
            let mut cmd = Command::new("docker");
            cmd.arg("buildx");
            cmd
        }
    }

    async fn run(mut cmd: Command, what: &str) -> Result<String> {
        tracing::debug!("Running {cmd:?}");
        let output = cmd
            .output()
            .await
            .with_context(|| format!("Failed to spawn {what}"))?;
        if !output.status.success() {
            bail!(
                "{what} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait::async_trait]
impl BuilderControl for BuildxCli {
    async fn create_remote_builder(
        &self,
        name: &str,
        endpoint: &str,
        certs_dir: &Path,
    ) -> Result<()> {
        let driver_opts = format!(
            "cacert={},cert={},key={}",
            certs_dir.join("ca.pem").display(),
            certs_dir.join("cert.pem").display(),
            certs_dir.join("key.pem").display(),
        );
        let mut cmd = self.buildx();
        cmd.args(["create", "--name", name, "--driver", "remote", "--driver-opt"])
            .arg(driver_opts)
            .arg("--use")
            .arg(endpoint);
        Self::run(cmd, "buildx create").await?;
        Ok(())
    }

    async fn daemon_logs(&self, container: &str) -> Result<String> {
        let mut cmd = Command::new("docker");
        cmd.args(["logs", "--timestamps", container]);
        Self::run(cmd, "docker logs").await
    }

    async fn remove_builder(&self, name: &str) -> Result<()> {
        let mut stop = self.buildx();
        stop.args(["stop", name]);
        if let Err(e) = Self::run(stop, "buildx stop").await {
            tracing::debug!("Stopping builder {name} failed, removing anyway: {e:#}");
        }

        let mut rm = self.buildx();
        rm.args(["rm", "--force", name]);
        Self::run(rm, "buildx rm").await?;
        Ok(())
    }
}
