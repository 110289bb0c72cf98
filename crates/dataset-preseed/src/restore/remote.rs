use std::collections::BTreeMap;
use std::process::Command;

use chrono::{DateTime, FixedOffset};
use serde::Deserialize;

use super::{RestoreMethod, RestoreOutcome, RestoreRequest, RestoreStrategy};
use crate::config::{
    RepositoryConfig, ToolSettings, resolve_env_ref, resolve_required_string_field,
    resolve_string_field,
};
use crate::error::{Error, ErrorKind, Result};
use crate::exec::RunCtx;

/// Repository settings with all `*_env` indirections applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRepository {
    pub name: String,
    pub url: String,
    pub password_file: Option<String>,
    pub env: BTreeMap<String, String>,
}

impl RemoteRepository {
    pub fn resolve(name: &str, cfg: &RepositoryConfig) -> Result<Self> {
        let url = resolve_required_string_field(
            &format!("repositories.{name}.url"),
            cfg.url.as_deref(),
            cfg.url_env.as_deref(),
        )?;
        let password_file = resolve_string_field(
            cfg.password_file.as_deref(),
            cfg.password_file_env.as_deref(),
        );

        let mut env = cfg.env.clone();
        for (var, source) in &cfg.env_from {
            let value = resolve_env_ref(Some(source)).ok_or_else(|| {
                Error::config(format!(
                    "repositories.{name}.env_from.{var}: env var '{source}' is not set"
                ))
            })?;
            env.insert(var.clone(), value);
        }

        Ok(Self {
            name: name.to_string(),
            url,
            password_file,
            env,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResticSnapshot {
    pub id: String,
    #[serde(default)]
    pub short_id: Option<String>,
    pub time: String,
    #[serde(default)]
    pub paths: Vec<String>,
}

/// Newest snapshot that contains `path`.
pub fn latest_snapshot_for(snaps: &[ResticSnapshot], path: &str) -> Result<Option<ResticSnapshot>> {
    let mut best: Option<(DateTime<FixedOffset>, &ResticSnapshot)> = None;
    for s in snaps.iter().filter(|s| s.paths.iter().any(|p| p == path)) {
        let t = DateTime::parse_from_rfc3339(&s.time)
            .map_err(|e| Error::msg(format!("snapshot {}: bad time '{}': {e}", s.id, s.time)))?;
        if best.as_ref().is_none_or(|(bt, _)| t > *bt) {
            best = Some((t, s));
        }
    }
    Ok(best.map(|(_, s)| s.clone()))
}

/// Restores the newest backup of `backup_path` into the staging directory.
#[derive(Debug, Clone)]
pub struct RemoteStrategy {
    restic: String,
    repository: Option<(String, RepositoryConfig)>,
    backup_path: String,
}

impl RemoteStrategy {
    pub fn new(
        tools: &ToolSettings,
        repository: Option<(String, RepositoryConfig)>,
        backup_path: String,
    ) -> Self {
        Self {
            restic: tools.restic.clone(),
            repository,
            backup_path,
        }
    }

    fn restic_cmd(&self, repo: &RemoteRepository) -> Command {
        let mut cmd = Command::new(&self.restic);
        cmd.envs(&repo.env);
        cmd.arg("-r").arg(&repo.url);
        if let Some(pf) = &repo.password_file {
            cmd.arg("--password-file").arg(pf);
        }
        cmd.arg("--no-lock");
        cmd
    }
}

impl RestoreStrategy for RemoteStrategy {
    fn method(&self) -> RestoreMethod {
        RestoreMethod::Remote
    }

    fn unavailable(&self, req: &RestoreRequest<'_>) -> Option<String> {
        match self.repository {
            Some(_) => None,
            None => Some(format!("service '{}' has no backup repository", req.service)),
        }
    }

    fn needs_staging(&self) -> bool {
        true
    }

    fn attempt(&self, req: &RestoreRequest<'_>, ctx: &RunCtx) -> Result<RestoreOutcome> {
        let (name, cfg) = self.repository.as_ref().ok_or_else(|| {
            Error::new(
                ErrorKind::RestoreMethodFailed,
                format!("service '{}' has no backup repository", req.service),
            )
        })?;
        let staging = req
            .staging
            .ok_or_else(|| Error::msg("remote restore requires a staging directory"))?;
        let repo = RemoteRepository::resolve(name, cfg)?;

        let mut list = self.restic_cmd(&repo);
        list.args(["snapshots", "--json", "--path", self.backup_path.as_str()]);
        let raw = ctx.output(list)?;
        let snaps: Vec<ResticSnapshot> = serde_json::from_str(raw.trim())
            .map_err(|e| Error::msg(format!("parse restic snapshots from '{name}': {e}")))?;
        let latest = latest_snapshot_for(&snaps, &self.backup_path)?.ok_or_else(|| {
            Error::new(
                ErrorKind::RestoreMethodFailed,
                format!("repository '{name}' has no snapshot of {}", self.backup_path),
            )
        })?;
        tracing::info!(
            service = req.service,
            repository = %name,
            snapshot = latest.short_id.as_deref().unwrap_or(&latest.id),
            time = %latest.time,
            "restoring from backup"
        );

        // `<id>:<subpath>` restores the directory's contents straight into the target.
        let mut restore = self.restic_cmd(&repo);
        restore
            .arg("restore")
            .arg(format!("{}:{}", latest.id, self.backup_path))
            .arg("--target")
            .arg(staging);
        ctx.run(restore)?;
        Ok(RestoreOutcome::Staged(staging.to_path_buf()))
    }
}
