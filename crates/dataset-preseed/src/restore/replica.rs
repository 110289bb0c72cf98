use std::process::Command;

use super::zfs::{self, Snapshot};
use super::{RestoreMethod, RestoreOutcome, RestoreRequest, RestoreStrategy};
use crate::config::ToolSettings;
use crate::dataset::StoragePath;
use crate::error::{Error, ErrorKind, Result};
use crate::exec::RunCtx;
use crate::replication::{ResolvedReplicationTarget, option_flags};

/// Pulls the newest snapshot of the replica back with
/// `ssh <target> zfs send | zfs receive -F`.
#[derive(Debug, Clone)]
pub struct ReplicaStrategy {
    zfs: String,
    ssh: String,
}

impl ReplicaStrategy {
    pub fn new(tools: &ToolSettings) -> Self {
        Self {
            zfs: tools.zfs.clone(),
            ssh: tools.ssh.clone(),
        }
    }

    fn ssh_cmd(&self, target: &ResolvedReplicationTarget) -> Command {
        let mut cmd = Command::new(&self.ssh);
        cmd.args(ssh_args(target));
        cmd
    }

    fn list_remote(&self, target: &ResolvedReplicationTarget, ctx: &RunCtx) -> Result<Vec<Snapshot>> {
        let mut cmd = self.ssh_cmd(target);
        cmd.arg("--").arg("zfs");
        cmd.args(zfs::list_snapshots_args(&target.target_dataset));
        let raw = ctx.output(cmd)?;
        zfs::parse_snapshot_list(&target.target_dataset, &raw)
    }

    fn send_cmd(&self, target: &ResolvedReplicationTarget, snapshot: &str) -> Command {
        let mut cmd = self.ssh_cmd(target);
        cmd.arg("--").args(send_args(target, snapshot));
        cmd
    }

    fn receive_cmd(&self, target: &ResolvedReplicationTarget, dataset: &StoragePath) -> Command {
        let mut cmd = Command::new(&self.zfs);
        cmd.args(receive_args(target, dataset));
        cmd
    }

    /// `zfs receive -u` leaves the dataset unmounted.
    fn ensure_mounted(&self, dataset: &StoragePath, ctx: &RunCtx) -> Result<()> {
        let mut probe = Command::new(&self.zfs);
        probe.args(["get", "-H", "-o", "value", "mounted", dataset.as_str()]);
        if ctx.output(probe)?.trim() == "yes" {
            return Ok(());
        }
        let mut mount = Command::new(&self.zfs);
        mount.args(["mount", dataset.as_str()]);
        ctx.run(mount)
    }
}

impl RestoreStrategy for ReplicaStrategy {
    fn method(&self) -> RestoreMethod {
        RestoreMethod::Replica
    }

    fn unavailable(&self, req: &RestoreRequest<'_>) -> Option<String> {
        match req.replication {
            Some(_) => None,
            None => Some(format!("no replication policy covers '{}'", req.dataset)),
        }
    }

    fn attempt(&self, req: &RestoreRequest<'_>, ctx: &RunCtx) -> Result<RestoreOutcome> {
        let target = req.replication.ok_or_else(|| {
            Error::new(
                ErrorKind::RestoreMethodFailed,
                format!("no replication policy covers '{}'", req.dataset),
            )
        })?;

        let snaps = self.list_remote(target, ctx)?;
        let latest = zfs::latest_snapshot(&snaps, None).ok_or_else(|| {
            Error::new(
                ErrorKind::RestoreMethodFailed,
                format!(
                    "no snapshots of {} on {}",
                    target.target_dataset, target.target_host
                ),
            )
        })?;
        tracing::info!(
            service = req.service,
            host = %target.target_host,
            snapshot = %latest.name,
            "receiving from replica"
        );

        ctx.pipe(
            self.send_cmd(target, &latest.name),
            self.receive_cmd(target, req.dataset),
        )?;
        self.ensure_mounted(req.dataset, ctx)?;
        Ok(RestoreOutcome::InPlace)
    }
}

pub fn ssh_args(target: &ResolvedReplicationTarget) -> Vec<String> {
    let mut args = vec!["-o".to_string(), "BatchMode=yes".to_string()];
    if let Some(port) = target.ssh_port {
        args.push("-p".into());
        args.push(port.to_string());
    }
    if let Some(id) = target
        .ssh_key_path
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        args.push("-i".into());
        args.push(id.to_string());
    }
    args.push(target.ssh_destination());
    args
}

/// Remote half of the pipeline, run through ssh.
pub fn send_args(target: &ResolvedReplicationTarget, snapshot: &str) -> Vec<String> {
    let mut args = vec!["zfs".to_string(), "send".to_string()];
    args.extend(option_flags(&target.send_options));
    args.push(snapshot.to_string());
    args
}

pub fn receive_args(target: &ResolvedReplicationTarget, dataset: &StoragePath) -> Vec<String> {
    let mut args = vec!["receive".to_string(), "-F".to_string()];
    args.extend(
        option_flags(&target.recv_options)
            .into_iter()
            .filter(|f| f != "-F"),
    );
    args.push(dataset.to_string());
    args
}
