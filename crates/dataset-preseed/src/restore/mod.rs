use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::{PreseedConfig, ServiceConfig};
use crate::dataset::StoragePath;
use crate::error::Result;
use crate::exec::RunCtx;
use crate::replication::ResolvedReplicationTarget;

pub mod local;
pub mod remote;
pub mod replica;
pub mod zfs;

pub use local::LocalStrategy;
pub use remote::{RemoteRepository, RemoteStrategy};
pub use replica::ReplicaStrategy;

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RestoreMethod {
    Replica,
    Local,
    Remote,
}

impl RestoreMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            RestoreMethod::Replica => "replica",
            RestoreMethod::Local => "local",
            RestoreMethod::Remote => "remote",
        }
    }
}

impl fmt::Display for RestoreMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What populated the mountpoint, as recorded in the completion marker.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MethodUsed {
    NoneNeeded,
    Replica,
    Local,
    Remote,
}

impl MethodUsed {
    pub fn as_str(self) -> &'static str {
        match self {
            MethodUsed::NoneNeeded => "none_needed",
            MethodUsed::Replica => "replica",
            MethodUsed::Local => "local",
            MethodUsed::Remote => "remote",
        }
    }
}

impl From<RestoreMethod> for MethodUsed {
    fn from(m: RestoreMethod) -> Self {
        match m {
            RestoreMethod::Replica => MethodUsed::Replica,
            RestoreMethod::Local => MethodUsed::Local,
            RestoreMethod::Remote => MethodUsed::Remote,
        }
    }
}

impl fmt::Display for MethodUsed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RestoreRequest<'a> {
    pub service: &'a str,
    pub mountpoint: &'a Path,
    pub dataset: &'a StoragePath,
    pub replication: Option<&'a ResolvedReplicationTarget>,
    /// Empty scratch directory on the mountpoint's filesystem, present only
    /// for strategies that report `needs_staging`.
    pub staging: Option<&'a Path>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// The dataset was replaced atomically (receive / rollback).
    InPlace,
    /// Data sits under this directory and still has to be promoted.
    Staged(PathBuf),
}

pub trait RestoreStrategy {
    fn method(&self) -> RestoreMethod;

    /// Reason this strategy cannot run for `req`; such methods are skipped
    /// rather than counted as failures.
    fn unavailable(&self, _req: &RestoreRequest<'_>) -> Option<String> {
        None
    }

    fn needs_staging(&self) -> bool {
        false
    }

    fn attempt(&self, req: &RestoreRequest<'_>, ctx: &RunCtx) -> Result<RestoreOutcome>;
}

/// Strategies for `methods`, in that order.
pub fn strategies_for(
    cfg: &PreseedConfig,
    svc: &ServiceConfig,
    methods: &[RestoreMethod],
) -> Vec<Box<dyn RestoreStrategy>> {
    let mut out: Vec<Box<dyn RestoreStrategy>> = Vec::with_capacity(methods.len());
    for m in methods {
        match m {
            RestoreMethod::Replica => out.push(Box::new(ReplicaStrategy::new(&cfg.tools))),
            RestoreMethod::Local => out.push(Box::new(LocalStrategy::new(
                &cfg.tools,
                svc.local_snapshot_prefix.clone(),
            ))),
            RestoreMethod::Remote => {
                let repo = cfg
                    .repository_for(svc)
                    .map(|(name, repo)| (name.to_string(), repo.clone()));
                out.push(Box::new(RemoteStrategy::new(
                    &cfg.tools,
                    repo,
                    svc.backup_path(),
                )));
            }
        }
    }
    out
}
