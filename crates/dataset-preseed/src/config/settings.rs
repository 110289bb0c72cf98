use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ConfigDoc;
use crate::dataset::StoragePath;
use crate::error::{Error, Result};
use crate::replication::{self, ReplicationDefaults, ReplicationRegistry, ResolvedReplicationTarget};
use crate::restore::RestoreMethod;

pub const DEFAULT_TIMEOUT_SECS: u64 = 30 * 60;

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_methods() -> Vec<RestoreMethod> {
    vec![
        RestoreMethod::Replica,
        RestoreMethod::Local,
        RestoreMethod::Remote,
    ]
}

fn default_zfs() -> String {
    "zfs".into()
}

fn default_ssh() -> String {
    "ssh".into()
}

fn default_restic() -> String {
    "restic".into()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RestoreSettings {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_methods")]
    pub methods: Vec<RestoreMethod>,
}

impl Default for RestoreSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            methods: default_methods(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ReplicationSettings {
    pub defaults: ReplicationDefaults,
    pub datasets: ReplicationRegistry,
}

/// Backup repository driven through the restic CLI.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RepositoryConfig {
    pub url: Option<String>,
    pub url_env: Option<String>,
    pub password_file: Option<String>,
    pub password_file_env: Option<String>,
    /// Literal environment for the restic process (e.g. `AWS_DEFAULT_REGION`).
    pub env: BTreeMap<String, String>,
    /// `VAR = "SOURCE_VAR"`: copy `SOURCE_VAR` from our environment into `VAR`.
    pub env_from: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct NotifySettings {
    pub on_success: bool,
    pub webhook_url: Option<String>,
    pub webhook_url_env: Option<String>,
    pub token_env: Option<String>,
    pub command: Vec<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ToolSettings {
    #[serde(default = "default_zfs")]
    pub zfs: String,
    #[serde(default = "default_ssh")]
    pub ssh: String,
    #[serde(default = "default_restic")]
    pub restic: String,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            zfs: default_zfs(),
            ssh: default_ssh(),
            restic: default_restic(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    pub dataset: StoragePath,
    pub mountpoint: PathBuf,
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub methods: Option<Vec<RestoreMethod>>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub local_snapshot_prefix: Option<String>,
    /// Path recorded in the backup repository; defaults to the mountpoint.
    #[serde(default)]
    pub backup_path: Option<String>,
}

impl ServiceConfig {
    pub fn backup_path(&self) -> String {
        self.backup_path
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToOwned::to_owned)
            .unwrap_or_else(|| self.mountpoint.display().to_string())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct PreseedConfig {
    pub restore: RestoreSettings,
    pub replication: ReplicationSettings,
    pub repositories: BTreeMap<String, RepositoryConfig>,
    pub notify: NotifySettings,
    pub tools: ToolSettings,
    pub services: BTreeMap<String, ServiceConfig>,
}

impl PreseedConfig {
    pub fn from_doc(doc: &ConfigDoc) -> Result<Self> {
        let cfg: PreseedConfig = doc.deserialize_path("")?.unwrap_or_default();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_doc(&super::load(path)?)
    }

    pub fn validate(&self) -> Result<()> {
        validate_methods("restore.methods", &self.restore.methods)?;
        if self.restore.timeout_secs == 0 {
            return Err(Error::config("restore.timeout_secs must be greater than zero"));
        }

        for (name, svc) in &self.services {
            safe_service_name(name)?;
            if !svc.mountpoint.is_absolute() {
                return Err(Error::config(format!(
                    "services.{name}.mountpoint must be absolute, got '{}'",
                    svc.mountpoint.display()
                )));
            }
            if let Some(methods) = &svc.methods {
                validate_methods(&format!("services.{name}.methods"), methods)?;
            }
            if svc.timeout_secs == Some(0) {
                return Err(Error::config(format!(
                    "services.{name}.timeout_secs must be greater than zero"
                )));
            }
            if let Some(repo) = svc.repository.as_deref().map(str::trim)
                && !repo.is_empty()
                && !self.repositories.contains_key(repo)
            {
                return Err(Error::config(format!(
                    "services.{name}.repository references unknown repository '{repo}'"
                )));
            }
        }
        Ok(())
    }

    pub fn service(&self, name: &str) -> Result<&ServiceConfig> {
        self.services
            .get(name)
            .ok_or_else(|| Error::config(format!("unknown service '{name}'")))
    }

    pub fn methods_for(&self, svc: &ServiceConfig) -> Vec<RestoreMethod> {
        svc.methods
            .clone()
            .unwrap_or_else(|| self.restore.methods.clone())
    }

    pub fn timeout_for(&self, svc: &ServiceConfig) -> Duration {
        Duration::from_secs(svc.timeout_secs.unwrap_or(self.restore.timeout_secs))
    }

    pub fn repository_for(&self, svc: &ServiceConfig) -> Option<(&str, &RepositoryConfig)> {
        let name = svc.repository.as_deref().map(str::trim)?;
        self.repositories
            .get_key_value(name)
            .map(|(k, v)| (k.as_str(), v))
    }

    pub fn replication_target(&self, dataset: &StoragePath) -> Result<Option<ResolvedReplicationTarget>> {
        replication::resolve(
            dataset,
            &self.replication.datasets,
            &self.replication.defaults,
        )
    }
}

fn validate_methods(cfg_path: &str, methods: &[RestoreMethod]) -> Result<()> {
    if methods.is_empty() {
        return Err(Error::config(format!("{cfg_path} must not be empty")));
    }
    let mut seen = BTreeSet::new();
    for m in methods {
        if !seen.insert(*m) {
            return Err(Error::config(format!(
                "{cfg_path} lists '{}' more than once",
                m.as_str()
            )));
        }
    }
    Ok(())
}

pub(crate) fn safe_service_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::config("service name is empty"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
    {
        return Err(Error::config(format!(
            "service name '{name}' contains invalid characters"
        )));
    }
    Ok(())
}
