use anyhow::Result;
use clap::Parser;

use crate::backend::{HttpBackend, ProvisioningBackend};
use crate::builder::{BuildxCli, BuilderControl};
use crate::commands::resolve_api_token;
use crate::config::Config;
use crate::rt::block_on;
use crate::state::{FileStateStore, StateRecord, StateStore};
use crate::sticky_disk::{DiskHost, LinuxDiskHost, StickyDiskManager};
use crate::teardown::{TeardownCoordinator, TeardownReport};

#[derive(Parser, Debug, Clone, Default)]
pub struct PostArgs {}

/// Runs at the end of the job. Never fails the job because of a cleanup
/// problem: only an unreadable configuration is reported as an error.
pub fn post(_args: PostArgs) -> Result<()> {
    let config = Config::from_env()?;
    let store = FileStateStore::new(&config.state_file);

    block_on(async move {
        let record = match StateRecord::load(&store) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("Failed to read recorded state, nothing to tear down: {e:#}");
                return;
            }
        };

        let backend = if record.build_task_id.is_empty() {
            None
        } else {
            connect_backend(&config).await
        };
        let builder = BuildxCli::new(record.standalone);

        let report = finalize(
            &record,
            backend.as_ref().map(|b| b as &dyn ProvisioningBackend),
            &builder,
            LinuxDiskHost::default(),
        )
        .await;
        if report.failures() > 0 {
            tracing::warn!("Teardown finished with {} failed step(s)", report.failures());
        }
    })
}

async fn connect_backend(config: &Config) -> Option<HttpBackend> {
    let api_url = match config.require_api_url() {
        Ok(url) => url.to_string(),
        Err(e) => {
            tracing::warn!("{e}");
            return None;
        }
    };
    let token = match resolve_api_token(config).await {
        Ok(token) => token,
        Err(e) => {
            tracing::warn!("Cannot authenticate to the provisioning backend: {e}");
            return None;
        }
    };
    match HttpBackend::new(api_url, token) {
        Ok(backend) => Some(backend),
        Err(e) => {
            tracing::warn!("Cannot reach the provisioning backend: {e}");
            None
        }
    }
}

/// The post phase over already loaded state.
pub async fn finalize<H: DiskHost>(
    record: &StateRecord,
    backend: Option<&dyn ProvisioningBackend>,
    builder: &dyn BuilderControl,
    host: H,
) -> TeardownReport {
    let sticky_disk = StickyDiskManager::restore(host, record.is_sticky_disks_enabled);
    TeardownCoordinator::new(record, backend, builder, sticky_disk)
        .run()
        .await
}

/// Loads the record from `store` and tears down.
pub async fn finalize_from_store<H: DiskHost>(
    store: &dyn StateStore,
    backend: Option<&dyn ProvisioningBackend>,
    builder: &dyn BuilderControl,
    host: H,
) -> Result<TeardownReport> {
    let record = StateRecord::load(store)?;
    Ok(finalize(&record, backend, builder, host).await)
}
