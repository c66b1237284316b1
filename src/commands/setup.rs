use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;

use crate::backend::{CreateTaskRequest, HttpBackend, ProvisioningBackend};
use crate::builder::{BuildxCli, BuilderControl, container_name};
use crate::commands::resolve_api_token;
use crate::config::{Config, REMOTE_DRIVER};
use crate::provisioner::TaskProvisioner;
use crate::rt::block_on;
use crate::state::{FileStateStore, StateKey, StateStore};
use crate::sticky_disk::{DiskHost, LinuxDiskHost, StickyDiskManager};

#[derive(Parser, Debug, Clone, Default)]
pub struct SetupArgs {
    /// Name of the builder to register (defaults to one derived from the task id)
    #[arg(long, value_name = "NAME")]
    pub builder_name: Option<String>,

    /// Leave the builder and certificates in place when the job ends
    #[arg(long)]
    pub no_cleanup: bool,

    /// Dump the build daemon logs when the job ends
    #[arg(long)]
    pub debug: bool,

    /// Use the standalone `buildx` binary instead of `docker buildx`
    #[arg(long)]
    pub standalone: bool,
}

/// Everything setup acquired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupOutcome {
    pub task_id: String,
    pub address: String,
    pub builder_name: String,
    pub certs_dir: PathBuf,
    pub sticky_disk_mounted: bool,
}

pub fn setup(args: SetupArgs) -> Result<()> {
    let config = Config::from_env()?;
    let api_url = config.require_api_url()?.to_string();
    let mut store = FileStateStore::new(&config.state_file);
    tracing::debug!("Recording state in {}", store.path().display());

    block_on(async move {
        let token = resolve_api_token(&config).await?;
        let provisioner = TaskProvisioner::new(HttpBackend::new(api_url, token)?);
        let mut sticky_disk = StickyDiskManager::new(LinuxDiskHost::default());
        let builder = BuildxCli::new(args.standalone);

        let outcome = initialize(
            &args,
            &config,
            &mut store,
            &provisioner,
            &mut sticky_disk,
            &builder,
        )
        .await?;
        println!("{}", outcome.address);
        Ok(())
    })?
}

/// The setup phase: provision, record, mount, register.
///
/// Provisioning failures are returned; sticky disk problems only degrade the
/// job to running without a cache volume.
pub async fn initialize<B, H>(
    args: &SetupArgs,
    config: &Config,
    store: &mut dyn StateStore,
    provisioner: &TaskProvisioner<B>,
    sticky_disk: &mut StickyDiskManager<H>,
    builder: &dyn BuilderControl,
) -> Result<SetupOutcome>
where
    B: ProvisioningBackend,
    H: DiskHost,
{
    // recorded first so an interrupted setup still gets a sensible post phase
    store.set(StateKey::Cleanup, (!args.no_cleanup).into())?;
    store.set(StateKey::Standalone, args.standalone.into())?;
    store.set(StateKey::IsDebug, args.debug.into())?;

    let request = CreateTaskRequest::for_host(config.repository.clone());
    let mut task = provisioner
        .create_task(store, &request)
        .await
        .context("Failed to create build task")?;
    let address = provisioner.poll_for_assignment(&mut task).await?;

    let builder_name = args
        .builder_name
        .clone()
        .unwrap_or_else(|| format!("remote-builder-{}", task.id));
    let certs_dir = config.certs_root.join(&builder_name);
    write_certs(
        &certs_dir,
        &task.client_key,
        &task.client_ca_certificate,
        &task.root_ca_certificate,
    )?;
    store.set(StateKey::CertsDir, certs_dir.display().to_string().into())?;

    let sticky_disk_mounted = sticky_disk.mount_if_enabled(task.sticky_disks_enabled).await;
    store.set(StateKey::IsStickyDisksEnabled, sticky_disk_mounted.into())?;

    builder
        .create_remote_builder(&builder_name, &address, &certs_dir)
        .await
        .with_context(|| format!("Failed to register builder {builder_name}"))?;
    store.set(StateKey::BuilderName, builder_name.as_str().into())?;
    store.set(StateKey::BuilderDriver, REMOTE_DRIVER.into())?;
    store.set(
        StateKey::ContainerName,
        container_name(&builder_name).into(),
    )?;

    tracing::info!("Builder {builder_name} is ready at {address}");
    Ok(SetupOutcome {
        task_id: task.id,
        address,
        builder_name,
        certs_dir,
        sticky_disk_mounted,
    })
}

/// Writes the mTLS material in the layout the buildx remote driver expects.
fn write_certs(dir: &Path, client_key: &str, client_cert: &str, root_ca: &str) -> Result<()> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create certs directory {}", dir.display()))?;

    for (name, content, mode) in [
        ("ca.pem", root_ca, 0o644),
        ("cert.pem", client_cert, 0o644),
        ("key.pem", client_key, 0o600),
    ] {
        let path = dir.join(name);
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        // `mode` only applies on creation; tighten a file left by an earlier run
        file.set_permissions(fs::Permissions::from_mode(mode))
            .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
        file.write_all(content.as_bytes())
            .with_context(|| format!("Failed to write {}", path.display()))?;
    }
    Ok(())
}
