use std::process::Command;

use super::zfs;
use super::{RestoreMethod, RestoreOutcome, RestoreRequest, RestoreStrategy};
use crate::config::ToolSettings;
use crate::error::{Error, ErrorKind, Result};
use crate::exec::RunCtx;

/// Rolls the dataset back to its newest local snapshot.
#[derive(Debug, Clone)]
pub struct LocalStrategy {
    zfs: String,
    prefix: Option<String>,
}

impl LocalStrategy {
    pub fn new(tools: &ToolSettings, prefix: Option<String>) -> Self {
        Self {
            zfs: tools.zfs.clone(),
            prefix,
        }
    }
}

impl RestoreStrategy for LocalStrategy {
    fn method(&self) -> RestoreMethod {
        RestoreMethod::Local
    }

    fn attempt(&self, req: &RestoreRequest<'_>, ctx: &RunCtx) -> Result<RestoreOutcome> {
        let raw = ctx.output(zfs::list_snapshots_cmd(&self.zfs, req.dataset))?;
        let snaps = zfs::parse_snapshot_list(req.dataset, &raw)?;
        let latest = zfs::latest_snapshot(&snaps, self.prefix.as_deref()).ok_or_else(|| {
            let filter = self
                .prefix
                .as_deref()
                .map(|p| format!(" matching '{p}'"))
                .unwrap_or_default();
            Error::new(
                ErrorKind::RestoreMethodFailed,
                format!("no local snapshots of {}{filter}", req.dataset),
            )
        })?;
        tracing::info!(service = req.service, snapshot = %latest.name, "rolling back");

        let mut cmd = Command::new(&self.zfs);
        // -r destroys snapshots newer than the target.
        cmd.args(["rollback", "-r", latest.name.as_str()]);
        ctx.run(cmd)?;
        Ok(RestoreOutcome::InPlace)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    use super::*;
    use crate::dataset::StoragePath;

    fn fake_zfs(dir: &Path, listing: &str) -> ToolSettings {
        let script = dir.join("zfs");
        let log = dir.join("calls.log");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\necho \"$@\" >> '{}'\nif [ \"$1\" = list ]; then printf '{}'; fi\n",
                log.display(),
                listing
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        ToolSettings {
            zfs: script.display().to_string(),
            ..ToolSettings::default()
        }
    }

    fn request<'a>(ds: &'a StoragePath, mp: &'a Path) -> RestoreRequest<'a> {
        RestoreRequest {
            service: "grafana",
            mountpoint: mp,
            dataset: ds,
            replication: None,
            staging: None,
        }
    }

    #[test]
    fn rolls_back_to_newest_matching_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let tools = fake_zfs(
            dir.path(),
            "tank/grafana@daily-1\\t100\\ntank/grafana@manual\\t300\\ntank/grafana@daily-2\\t200\\n",
        );
        let ds = StoragePath::new("tank/grafana").unwrap();
        let s = LocalStrategy::new(&tools, Some("daily".into()));
        let out = s.attempt(&request(&ds, dir.path()), &RunCtx::default()).unwrap();
        assert_eq!(out, RestoreOutcome::InPlace);

        let calls = std::fs::read_to_string(dir.path().join("calls.log")).unwrap();
        assert!(calls.lines().any(|l| l == "rollback -r tank/grafana@daily-2"), "{calls}");
    }

    #[test]
    fn fails_without_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let tools = fake_zfs(dir.path(), "");
        let ds = StoragePath::new("tank/grafana").unwrap();
        let err = LocalStrategy::new(&tools, None)
            .attempt(&request(&ds, dir.path()), &RunCtx::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RestoreMethodFailed);
        assert!(err.to_string().contains("no local snapshots"), "{err}");
    }
}
