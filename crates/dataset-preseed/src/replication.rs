use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::dataset::{SEPARATOR, StoragePath, find_policy};
use crate::error::{Error, ErrorKind, Result};

pub const DEFAULT_SSH_USER: &str = "zfs-replication";
pub const DEFAULT_SEND_OPTIONS: &str = "w";
pub const DEFAULT_RECV_OPTIONS: &str = "u";

pub type ReplicationRegistry = BTreeMap<StoragePath, ReplicationPolicy>;

/// Replication rule declared on one node of the dataset tree. Unset optional
/// fields are filled from [`ReplicationDefaults`] at resolve time.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ReplicationPolicy {
    pub target_host: String,
    pub target_dataset_root: StoragePath,
    #[serde(default)]
    pub ssh_user: Option<String>,
    #[serde(default)]
    pub ssh_key_path: Option<String>,
    #[serde(default)]
    pub ssh_port: Option<u16>,
    #[serde(default)]
    pub send_options: Option<String>,
    #[serde(default)]
    pub recv_options: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReplicationDefaults {
    pub ssh_user: String,
    pub ssh_key_path: Option<String>,
    pub ssh_port: Option<u16>,
    pub send_options: String,
    pub recv_options: String,
}

impl Default for ReplicationDefaults {
    fn default() -> Self {
        Self {
            ssh_user: DEFAULT_SSH_USER.into(),
            ssh_key_path: None,
            ssh_port: None,
            send_options: DEFAULT_SEND_OPTIONS.into(),
            recv_options: DEFAULT_RECV_OPTIONS.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ResolvedReplicationTarget {
    pub source_path: StoragePath,
    pub target_host: String,
    pub target_dataset: StoragePath,
    pub ssh_user: String,
    pub ssh_key_path: Option<String>,
    pub ssh_port: Option<u16>,
    pub send_options: String,
    pub recv_options: String,
}

impl ResolvedReplicationTarget {
    /// `user@host` as passed to ssh.
    pub fn ssh_destination(&self) -> String {
        if self.ssh_user.is_empty() {
            return self.target_host.clone();
        }
        format!("{}@{}", self.ssh_user, self.target_host)
    }
}

fn non_empty(v: Option<&str>) -> Option<String> {
    v.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
}

/// Resolves the replication target for `path` from the nearest ancestor that
/// declares a policy. `Ok(None)` means nothing in the ancestry replicates.
pub fn resolve(
    path: &StoragePath,
    registry: &ReplicationRegistry,
    defaults: &ReplicationDefaults,
) -> Result<Option<ResolvedReplicationTarget>> {
    let Some((source_path, policy)) = find_policy(registry, path) else {
        return Ok(None);
    };

    let suffix = path.strip_ancestor(source_path).ok_or_else(|| {
        Error::new(
            ErrorKind::InvalidPathSuffix,
            format!(
                "replication source '{}' is not an ancestor of '{}'",
                source_path, path
            ),
        )
    })?;
    if suffix.starts_with(SEPARATOR) || suffix.ends_with(SEPARATOR) {
        return Err(Error::new(
            ErrorKind::InvalidPathSuffix,
            format!(
                "suffix '{}' of '{}' below '{}' is malformed",
                suffix, path, source_path
            ),
        ));
    }

    let target_dataset = policy.target_dataset_root.join(suffix).map_err(|e| {
        Error::new(
            ErrorKind::InvalidPathSuffix,
            format!(
                "target dataset for '{}' under '{}' is invalid: {e}",
                path, policy.target_dataset_root
            ),
        )
    })?;

    let target_host = policy.target_host.trim();
    if target_host.is_empty() {
        return Err(Error::config(format!(
            "replication policy for '{}' has an empty target_host",
            source_path
        )));
    }

    Ok(Some(ResolvedReplicationTarget {
        source_path: source_path.clone(),
        target_host: target_host.to_string(),
        target_dataset,
        ssh_user: non_empty(policy.ssh_user.as_deref())
            .unwrap_or_else(|| defaults.ssh_user.trim().to_string()),
        ssh_key_path: non_empty(policy.ssh_key_path.as_deref())
            .or_else(|| non_empty(defaults.ssh_key_path.as_deref())),
        ssh_port: policy.ssh_port.or(defaults.ssh_port),
        send_options: non_empty(policy.send_options.as_deref())
            .unwrap_or_else(|| defaults.send_options.trim().to_string()),
        recv_options: non_empty(policy.recv_options.as_deref())
            .unwrap_or_else(|| defaults.recv_options.trim().to_string()),
    }))
}

/// Turns syncoid-style option strings (`"w"`, `"Lc"`, `"-o compression=on"`)
/// into argv flags: bare tokens get a leading `-`.
pub fn option_flags(raw: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut tokens = raw.split_whitespace().peekable();
    while let Some(tok) = tokens.next() {
        if tok.starts_with('-') {
            out.push(tok.to_string());
            // `-o prop=value` / `-x prop` keep their argument.
            if matches!(tok, "-o" | "-x")
                && let Some(arg) = tokens.next()
            {
                out.push(arg.to_string());
            }
        } else {
            out.push(format!("-{tok}"));
        }
    }
    out
}
