#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use dataset_preseed::ErrorKind;
use dataset_preseed::config::{ConfigDoc, PreseedConfig};
use dataset_preseed::engine::{self, AttemptResult, GateState, PlanDecision};
use dataset_preseed::exec::RunCtx;
use dataset_preseed::marker::CompletionMarker;
use dataset_preseed::notify::NotificationSink;
use dataset_preseed::restore::{MethodUsed, RestoreMethod};

struct Host {
    dir: tempfile::TempDir,
}

impl Host {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("var/lib/radarr")).unwrap();
        fs::create_dir_all(dir.path().join("bin")).unwrap();
        Self { dir }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn mountpoint(&self) -> PathBuf {
        self.root().join("var/lib/radarr")
    }

    fn script(&self, name: &str, body: &str) -> PathBuf {
        let p = self.root().join("bin").join(name);
        fs::write(&p, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&p, fs::Permissions::from_mode(0o755)).unwrap();
        p
    }

    fn config(&self, extra: &str) -> PreseedConfig {
        let raw = format!(
            r#"
[tools]
zfs = "{bin}/zfs"
ssh = "{bin}/ssh"
restic = "{bin}/restic"

[repositories.nas]
url = "/mnt/nas-backup/restic"
password_file = "/run/secrets/restic-password"

[services.radarr]
dataset = "tank/services/radarr"
mountpoint = "{mp}"
repository = "nas"
backup_path = "/var/lib/radarr"

{extra}
"#,
            bin = self.root().join("bin").display(),
            mp = self.mountpoint().display(),
        );
        PreseedConfig::from_doc(&ConfigDoc::parse("<mem>", &raw).unwrap()).unwrap()
    }

    fn failing_zfs(&self) {
        self.script("zfs", "echo \"cannot open '$*': dataset does not exist\" >&2\nexit 1");
    }

    fn good_restic(&self) {
        self.script(
            "restic",
            r#"
for a in "$@"; do
  if [ "$a" = snapshots ]; then
    echo '[{"id":"0a1b2c3d","short_id":"0a1b2c3d","time":"2025-10-13T03:00:00Z","paths":["/var/lib/radarr"],"hostname":"forge"}]'
    exit 0
  fi
done
while [ $# -gt 0 ]; do
  if [ "$1" = "--target" ]; then
    mkdir -p "$2/MediaCover"
    echo sqlite > "$2/radarr.db"
    echo '<Config/>' > "$2/config.xml"
  fi
  shift
done
"#,
        );
    }
}

#[test]
fn falls_back_to_backup_and_is_idempotent() {
    let host = Host::new();
    host.failing_zfs();
    host.good_restic();
    let log = host.root().join("notify.log");
    let cfg = host.config(&format!(
        r#"
[notify]
on_success = true
command = ["sh", "-c", "echo \"$PRESEED_EVENT $PRESEED_METHOD\" >> '{}'"]
"#,
        log.display()
    ));

    let plan = engine::plan_preseed_gate(&cfg, "radarr").unwrap();
    assert_eq!(plan.decision, PlanDecision::Restore);
    assert!(plan.methods[0].skip_reason.is_some());

    let sink = NotificationSink::from_settings(&cfg.notify).unwrap();
    let out = engine::run_preseed_gate(&cfg, "radarr", &sink, &RunCtx::default()).unwrap();

    assert!(matches!(out.attempts[0].result, AttemptResult::Skipped(_)));
    assert_eq!(out.attempts[0].method, RestoreMethod::Replica);
    assert!(matches!(out.attempts[1].result, AttemptResult::Failed(ref r) if r.contains("dataset does not exist")));
    assert_eq!(out.attempts[2].result, AttemptResult::Succeeded);
    assert_eq!(out.final_state(), GateState::Completed(MethodUsed::Remote));

    let mp = host.mountpoint();
    assert_eq!(fs::read_to_string(mp.join("radarr.db")).unwrap(), "sqlite\n");
    assert!(mp.join("MediaCover").is_dir());
    let names: Vec<String> = fs::read_dir(&mp)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert!(!names.iter().any(|n| n.starts_with(".preseed-staging")), "{names:?}");

    let marker = CompletionMarker::new("radarr", &mp).read().unwrap().unwrap();
    assert_eq!(marker.method_used, MethodUsed::Remote);
    assert_eq!(marker.dataset.as_deref(), Some("tank/services/radarr"));
    assert_eq!(fs::read_to_string(&log).unwrap(), "restored remote\n");

    // Second boot, even with the data gone: nothing is attempted.
    fs::remove_file(mp.join("radarr.db")).unwrap();
    let again = engine::run_preseed_gate(&cfg, "radarr", &sink, &RunCtx::default()).unwrap();
    assert!(again.already_complete);
    assert!(again.attempts.is_empty());
    assert!(!mp.join("radarr.db").exists());
    assert_eq!(
        engine::plan_preseed_gate(&cfg, "radarr").unwrap().decision,
        PlanDecision::AlreadyComplete
    );
}

#[test]
fn populated_mountpoint_needs_no_restore() {
    let host = Host::new();
    host.failing_zfs();
    fs::write(host.mountpoint().join("config.xml"), "<Config/>").unwrap();
    fs::create_dir(host.mountpoint().join("lost+found")).unwrap();
    let cfg = host.config("");

    let out = engine::run_preseed_gate(&cfg, "radarr", &NotificationSink::default(), &RunCtx::default())
        .unwrap();
    assert!(out.attempts.is_empty());
    assert_eq!(out.method_used, Some(MethodUsed::NoneNeeded));
}

#[test]
fn timeout_counts_as_failure_and_exhaustion_notifies() {
    let host = Host::new();
    host.script("zfs", "sleep 30");
    let log = host.root().join("notify.log");
    let cfg = host.config(&format!(
        r#"
[restore]
timeout_secs = 1
methods = ["local", "remote"]

[notify]
command = ["sh", "-c", "echo \"$PRESEED_EVENT $PRESEED_ATTEMPTED\" >> '{}'"]
"#,
        log.display()
    ));
    // No restic script: the remote attempt fails to spawn.
    let sink = NotificationSink::from_settings(&cfg.notify).unwrap();
    let started = std::time::Instant::now();
    let err = engine::run_preseed_gate(&cfg, "radarr", &sink, &RunCtx::default()).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::AllMethodsExhausted);
    assert_eq!(err.kind().exit_code(), 2);
    assert!(started.elapsed() < std::time::Duration::from_secs(20));
    assert!(!CompletionMarker::new("radarr", &host.mountpoint()).exists());
    assert_eq!(fs::read_dir(host.mountpoint()).unwrap().count(), 0);
    assert_eq!(fs::read_to_string(&log).unwrap(), "failed local,remote\n");
}

#[test]
fn replica_only_without_policy_is_fatal() {
    let host = Host::new();
    let cfg = host.config(
        r#"
[restore]
methods = ["replica"]
"#,
    );
    let err = engine::run_preseed_gate(&cfg, "radarr", &NotificationSink::default(), &RunCtx::default())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AllMethodsExhausted);
}

#[test]
fn replica_receives_newest_remote_snapshot() {
    let host = Host::new();
    let calls = host.root().join("calls.log");
    host.script(
        "ssh",
        &format!(
            r#"echo "ssh $*" >> '{calls}'
for a in "$@"; do
  if [ "$a" = list ]; then
    printf 'backup/forge/services/radarr@autosnap_a\t100\nbackup/forge/services/radarr@autosnap_b\t200\n'
    exit 0
  fi
done
echo stream"#,
            calls = calls.display()
        ),
    );
    host.script(
        "zfs",
        &format!(
            r#"echo "zfs $*" >> '{calls}'
case "$1" in
  receive) cat > /dev/null ;;
  get) echo no ;;
esac"#,
            calls = calls.display()
        ),
    );
    let cfg = host.config(
        r#"
[restore]
methods = ["replica"]

[replication.datasets."tank/services"]
target_host = "nas-1"
target_dataset_root = "backup/forge/services"
"#,
    );

    let out = engine::run_preseed_gate(&cfg, "radarr", &NotificationSink::default(), &RunCtx::default())
        .unwrap();
    assert_eq!(out.method_used, Some(MethodUsed::Replica));

    let log = fs::read_to_string(&calls).unwrap();
    assert!(
        log.contains("ssh -o BatchMode=yes zfs-replication@nas-1 -- zfs send -w backup/forge/services/radarr@autosnap_b"),
        "{log}"
    );
    assert!(log.contains("zfs receive -F -u tank/services/radarr"), "{log}");
    assert!(log.contains("zfs mount tank/services/radarr"), "{log}");
}
