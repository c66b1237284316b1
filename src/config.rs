use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

pub static STICKY_DISK_DEVICE: &str = "/dev/vdb";
pub static STICKY_DISK_MOUNT_POINT: &str = "/var/lib/buildkit";
pub static STICKY_DISK_FS_TYPE: &str = "ext4";
pub static STICKY_DISK_COMMIT_MARKER: &str = "/var/run/remote-builder/stickydisk.commit";

/// Daemon whose writes land on the sticky disk.
pub static BUILD_DAEMON_NAME: &str = "buildkitd";
pub static DEFAULT_DRIVER: &str = "docker";
pub static REMOTE_DRIVER: &str = "remote";

pub static DAEMON_SCHEME: &str = "tcp";
pub const CONTROL_PORT: u16 = 4242;

pub const POLL_DEADLINE: Duration = Duration::from_millis(60_000);
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);
pub const POLL_REQUEST_TIMEOUT: Duration = Duration::from_millis(30_000);

pub const METADATA_MAX_ATTEMPTS: u32 = 11;
pub const METADATA_TOKEN_TTL_SECS: u64 = 21_600;
pub const METADATA_RETRY_SLEEP: Duration = Duration::from_secs(1);
pub static METADATA_API_TOKEN_KEY: &str = "builder-api-token";

static API_URL_ENV: &str = "BUILDER_API_URL";
static API_TOKEN_ENV: &str = "BUILDER_API_TOKEN";
static METADATA_URL_ENV: &str = "BUILDER_METADATA_URL";
static STATE_FILE_ENV: &str = "BUILDER_STATE_FILE";
static DEFAULT_METADATA_URL: &str = "http://192.168.127.1";

#[derive(Debug, Clone)]
pub struct Config {
    pub api_url: Option<String>,
    pub api_token: Option<String>,
    pub metadata_url: String,
    pub state_file: PathBuf,
    /// Parent of the per-builder certificate directories.
    pub certs_root: PathBuf,
    pub repository: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let state_file = match non_empty_env(STATE_FILE_ENV) {
            Some(path) => PathBuf::from(path),
            None => default_state_file()?,
        };

        Ok(Self {
            api_url: non_empty_env(API_URL_ENV),
            api_token: non_empty_env(API_TOKEN_ENV),
            metadata_url: non_empty_env(METADATA_URL_ENV)
                .unwrap_or_else(|| DEFAULT_METADATA_URL.to_string()),
            state_file,
            certs_root: non_empty_env("RUNNER_TEMP")
                .map(PathBuf::from)
                .unwrap_or_else(std::env::temp_dir)
                .join("remote-builder")
                .join("certs"),
            repository: non_empty_env("GITHUB_REPOSITORY"),
        })
    }

    pub fn require_api_url(&self) -> Result<&str> {
        self.api_url.as_deref().ok_or(Error::Config(API_URL_ENV))
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.trim().is_empty())
}

/// Both phases of a run must resolve the same file, so the name is derived
/// from the run identity only.
fn default_state_file() -> Result<PathBuf> {
    let run = match (
        non_empty_env("GITHUB_RUN_ID"),
        non_empty_env("GITHUB_RUN_ATTEMPT"),
    ) {
        (Some(id), Some(attempt)) => format!("{id}-{attempt}"),
        (Some(id), None) => id,
        _ => "local".to_string(),
    };
    let data_dir = dirs::data_dir().ok_or(Error::Config("XDG_DATA_HOME"))?;
    Ok(data_dir
        .join("remote-builder")
        .join(format!("state-{run}.toml")))
}
