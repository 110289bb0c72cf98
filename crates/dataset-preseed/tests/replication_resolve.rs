use std::fs;

use dataset_preseed::ErrorKind;
use dataset_preseed::config::{self, PreseedConfig};
use dataset_preseed::dataset::StoragePath;

fn cfg(raw: &str) -> PreseedConfig {
    let doc = config::ConfigDoc::parse("<mem>", raw).unwrap();
    PreseedConfig::from_doc(&doc).unwrap()
}

fn p(s: &str) -> StoragePath {
    StoragePath::new(s).unwrap()
}

const FLEET: &str = r#"
[replication.defaults]
ssh_user = "zfs-replication"
ssh_key_path = "/var/lib/zfs-replication/.ssh/id_ed25519"

[replication.datasets."tank/services"]
target_host = "nas-1"
target_dataset_root = "backup/forge/services"
send_options = "w"
recv_options = "u"

[replication.datasets."tank/services/plex"]
target_host = "nas-2"
target_dataset_root = "backup/plex"
ssh_port = 2222
"#;

#[test]
fn radarr_inherits_services_policy() {
    let cfg = cfg(FLEET);
    let t = cfg
        .replication_target(&p("tank/services/radarr"))
        .unwrap()
        .expect("replicated");
    assert_eq!(t.source_path.as_str(), "tank/services");
    assert_eq!(t.target_host, "nas-1");
    assert_eq!(t.target_dataset.as_str(), "backup/forge/services/radarr");
    assert_eq!(t.ssh_user, "zfs-replication");
    assert_eq!(t.send_options, "w");
    assert_eq!(t.recv_options, "u");
}

#[test]
fn nearer_policy_overrides_ancestor() {
    let cfg = cfg(FLEET);
    let t = cfg
        .replication_target(&p("tank/services/plex/transcode"))
        .unwrap()
        .expect("replicated");
    assert_eq!(t.target_host, "nas-2");
    assert_eq!(t.target_dataset.as_str(), "backup/plex/transcode");
    assert_eq!(t.ssh_port, Some(2222));
    // Unset on the nearer policy, so the global default applies.
    assert_eq!(
        t.ssh_key_path.as_deref(),
        Some("/var/lib/zfs-replication/.ssh/id_ed25519")
    );
}

#[test]
fn exact_policy_node_maps_to_root() {
    let cfg = cfg(FLEET);
    let t = cfg
        .replication_target(&p("tank/services"))
        .unwrap()
        .expect("replicated");
    assert_eq!(t.target_dataset.as_str(), "backup/forge/services");
}

#[test]
fn unrelated_and_lookalike_paths_are_not_replicated() {
    let cfg = cfg(FLEET);
    assert!(cfg.replication_target(&p("tank/local/scratch")).unwrap().is_none());
    assert!(cfg.replication_target(&p("tank/services2/radarr")).unwrap().is_none());
    assert!(cfg.replication_target(&p("tank")).unwrap().is_none());
}

#[test]
fn deep_nesting_keeps_full_suffix() {
    let cfg = cfg(FLEET);
    let t = cfg
        .replication_target(&p("tank/services/radarr/cache/thumbs"))
        .unwrap()
        .expect("replicated");
    assert_eq!(t.target_dataset.as_str(), "backup/forge/services/radarr/cache/thumbs");
}

#[test]
fn malformed_registry_key_is_rejected_at_load() {
    let doc = config::ConfigDoc::parse(
        "<mem>",
        r#"
[replication.datasets."tank/services/"]
target_host = "nas-1"
target_dataset_root = "backup/forge/services"
"#,
    )
    .unwrap();
    let err = PreseedConfig::from_doc(&doc).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
    assert!(err.to_string().contains("trailing separator"), "{err}");
}

#[test]
fn config_files_merge_through_imports() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("replication.toml"), FLEET).unwrap();
    fs::write(
        dir.path().join("host.toml"),
        r#"
imports = ["replication.toml"]

[services.radarr]
dataset = "tank/services/radarr"
mountpoint = "/var/lib/radarr"
"#,
    )
    .unwrap();

    let cfg = PreseedConfig::load(&dir.path().join("host.toml")).unwrap();
    let radarr = cfg.service("radarr").unwrap();
    let t = cfg.replication_target(&radarr.dataset).unwrap().expect("replicated");
    assert_eq!(t.target_dataset.as_str(), "backup/forge/services/radarr");
}
