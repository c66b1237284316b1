//! Durable hand-off between the setup and post phases of one job run.
//!
//! The two phases usually run as separate processes, so every write goes
//! straight to a TOML file through `confy` and every read loads it again.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StateKey {
    BuilderName,
    BuilderDriver,
    ContainerName,
    CertsDir,
    Cleanup,
    Standalone,
    IsDebug,
    IsStickyDisksEnabled,
    BuildTaskId,
    ClientKey,
    ClientCaCertificate,
    RootCaCertificate,
}

impl StateKey {
    pub const ALL: [StateKey; 12] = [
        StateKey::BuilderName,
        StateKey::BuilderDriver,
        StateKey::ContainerName,
        StateKey::CertsDir,
        StateKey::Cleanup,
        StateKey::Standalone,
        StateKey::IsDebug,
        StateKey::IsStickyDisksEnabled,
        StateKey::BuildTaskId,
        StateKey::ClientKey,
        StateKey::ClientCaCertificate,
        StateKey::RootCaCertificate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StateKey::BuilderName => "builderName",
            StateKey::BuilderDriver => "builderDriver",
            StateKey::ContainerName => "containerName",
            StateKey::CertsDir => "certsDir",
            StateKey::Cleanup => "cleanup",
            StateKey::Standalone => "standalone",
            StateKey::IsDebug => "isDebug",
            StateKey::IsStickyDisksEnabled => "isStickyDisksEnabled",
            StateKey::BuildTaskId => "buildTaskId",
            StateKey::ClientKey => "clientKey",
            StateKey::ClientCaCertificate => "clientCaCertificate",
            StateKey::RootCaCertificate => "rootCaCertificate",
        }
    }
}

impl Display for StateKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum StateValue {
    Bool(bool),
    Text(String),
}

impl StateValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            StateValue::Text(text) => Some(text),
            StateValue::Bool(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            StateValue::Bool(flag) => Some(*flag),
            StateValue::Text(text) => text.parse().ok(),
        }
    }
}

impl From<bool> for StateValue {
    fn from(flag: bool) -> Self {
        StateValue::Bool(flag)
    }
}

impl From<String> for StateValue {
    fn from(text: String) -> Self {
        StateValue::Text(text)
    }
}

impl From<&str> for StateValue {
    fn from(text: &str) -> Self {
        StateValue::Text(text.to_string())
    }
}

pub trait StateStore {
    fn set(&mut self, key: StateKey, value: StateValue) -> anyhow::Result<()>;

    fn get(&self, key: StateKey) -> anyhow::Result<Option<StateValue>>;
}

#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
struct StateFile {
    entries: BTreeMap<String, StateValue>,
}

/// File-backed store. Each `set` is a load-modify-store of the whole file,
/// which is fine with a single writer per phase.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> anyhow::Result<StateFile> {
        if !self.path.exists() {
            return Ok(StateFile::default());
        }
        confy::load_path::<StateFile>(&self.path)
            .with_context(|| format!("failed to load state file `{}`", self.path.display()))
    }

    fn store(&self, file: &StateFile) -> anyhow::Result<()> {
        confy::store_path(&self.path, file)
            .with_context(|| format!("failed to store state file `{}`", self.path.display()))
    }
}

impl StateStore for FileStateStore {
    fn set(&mut self, key: StateKey, value: StateValue) -> anyhow::Result<()> {
        let mut file = self.load()?;
        tracing::debug!("saving state `{key}`");
        file.entries.insert(key.as_str().to_string(), value);
        self.store(&file)
    }

    fn get(&self, key: StateKey) -> anyhow::Result<Option<StateValue>> {
        Ok(self.load()?.entries.remove(key.as_str()))
    }
}

/// Typed view of everything the setup phase recorded. Keys that were never
/// written read as an empty string or `false`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateRecord {
    pub builder_name: String,
    pub builder_driver: String,
    pub container_name: String,
    pub certs_dir: String,
    pub cleanup: bool,
    pub standalone: bool,
    pub is_debug: bool,
    pub is_sticky_disks_enabled: bool,
    pub build_task_id: String,
    pub client_key: String,
    pub client_ca_certificate: String,
    pub root_ca_certificate: String,
}

impl StateRecord {
    pub fn load(store: &dyn StateStore) -> anyhow::Result<Self> {
        let text = |key| -> anyhow::Result<String> {
            Ok(store
                .get(key)?
                .and_then(|value| value.as_text().map(str::to_string))
                .unwrap_or_default())
        };
        let flag = |key| -> anyhow::Result<bool> {
            Ok(store
                .get(key)?
                .and_then(|value| value.as_bool())
                .unwrap_or_default())
        };

        Ok(Self {
            builder_name: text(StateKey::BuilderName)?,
            builder_driver: text(StateKey::BuilderDriver)?,
            container_name: text(StateKey::ContainerName)?,
            certs_dir: text(StateKey::CertsDir)?,
            cleanup: flag(StateKey::Cleanup)?,
            standalone: flag(StateKey::Standalone)?,
            is_debug: flag(StateKey::IsDebug)?,
            is_sticky_disks_enabled: flag(StateKey::IsStickyDisksEnabled)?,
            build_task_id: text(StateKey::BuildTaskId)?,
            client_key: text(StateKey::ClientKey)?,
            client_ca_certificate: text(StateKey::ClientCaCertificate)?,
            root_ca_certificate: text(StateKey::RootCaCertificate)?,
        })
    }

    pub fn save(&self, store: &mut dyn StateStore) -> anyhow::Result<()> {
        for key in StateKey::ALL {
            store.set(key, self.value_of(key))?;
        }
        Ok(())
    }

    fn value_of(&self, key: StateKey) -> StateValue {
        match key {
            StateKey::BuilderName => self.builder_name.as_str().into(),
            StateKey::BuilderDriver => self.builder_driver.as_str().into(),
            StateKey::ContainerName => self.container_name.as_str().into(),
            StateKey::CertsDir => self.certs_dir.as_str().into(),
            StateKey::Cleanup => self.cleanup.into(),
            StateKey::Standalone => self.standalone.into(),
            StateKey::IsDebug => self.is_debug.into(),
            StateKey::IsStickyDisksEnabled => self.is_sticky_disks_enabled.into(),
            StateKey::BuildTaskId => self.build_task_id.as_str().into(),
            StateKey::ClientKey => self.client_key.as_str().into(),
            StateKey::ClientCaCertificate => self.client_ca_certificate.as_str().into(),
            StateKey::RootCaCertificate => self.root_ca_certificate.as_str().into(),
        }
    }
}
