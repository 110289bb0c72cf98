use std::process::Command;

use crate::dataset::StoragePath;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Full name, `dataset@snap`.
    pub name: String,
    /// Creation time, seconds since the epoch.
    pub creation: i64,
}

impl Snapshot {
    pub fn short_name(&self) -> &str {
        self.name
            .split_once('@')
            .map(|(_, s)| s)
            .unwrap_or(&self.name)
    }
}

/// Arguments for listing the direct snapshots of `dataset`, oldest first.
pub fn list_snapshots_args(dataset: &StoragePath) -> Vec<String> {
    [
        "list",
        "-H",
        "-p",
        "-t",
        "snapshot",
        "-o",
        "name,creation",
        "-s",
        "creation",
        "-d",
        "1",
    ]
    .iter()
    .map(|s| s.to_string())
    .chain(std::iter::once(dataset.to_string()))
    .collect()
}

pub fn list_snapshots_cmd(zfs: &str, dataset: &StoragePath) -> Command {
    let mut cmd = Command::new(zfs);
    cmd.args(list_snapshots_args(dataset));
    cmd
}

/// Parses `zfs list -H -p -o name,creation` output. Snapshots belonging to
/// other datasets are ignored.
pub fn parse_snapshot_list(dataset: &StoragePath, raw: &str) -> Result<Vec<Snapshot>> {
    let prefix = format!("{dataset}@");
    let mut out = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (name, creation) = line
            .split_once('\t')
            .or_else(|| line.split_once(char::is_whitespace))
            .ok_or_else(|| Error::msg(format!("unexpected zfs list line: '{line}'")))?;
        if !name.starts_with(&prefix) {
            continue;
        }
        let creation = creation
            .trim()
            .parse::<i64>()
            .map_err(|e| Error::msg(format!("bad creation time in '{line}': {e}")))?;
        out.push(Snapshot {
            name: name.to_string(),
            creation,
        });
    }
    Ok(out)
}

/// Newest snapshot whose short name starts with `prefix` (any when unset).
pub fn latest_snapshot<'a>(snaps: &'a [Snapshot], prefix: Option<&str>) -> Option<&'a Snapshot> {
    let prefix = prefix.map(str::trim).filter(|p| !p.is_empty());
    snaps
        .iter()
        .filter(|s| prefix.is_none_or(|p| s.short_name().starts_with(p)))
        .max_by_key(|s| s.creation)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ds(s: &str) -> StoragePath {
        StoragePath::new(s).unwrap()
    }

    const LISTING: &str = "tank/services/radarr@autosnap_2025-10-12_00:00:00_daily\t1760227200\n\
tank/services/radarr@preseed-1\t1760300000\n\
tank/services/radarr@autosnap_2025-10-13_00:00:00_daily\t1760313600\n";

    #[test]
    fn parses_and_picks_latest() {
        let snaps = parse_snapshot_list(&ds("tank/services/radarr"), LISTING).unwrap();
        assert_eq!(snaps.len(), 3);
        let latest = latest_snapshot(&snaps, None).unwrap();
        assert_eq!(latest.short_name(), "autosnap_2025-10-13_00:00:00_daily");
    }

    #[test]
    fn prefix_filters_candidates() {
        let snaps = parse_snapshot_list(&ds("tank/services/radarr"), LISTING).unwrap();
        let latest = latest_snapshot(&snaps, Some("preseed")).unwrap();
        assert_eq!(latest.name, "tank/services/radarr@preseed-1");
        assert!(latest_snapshot(&snaps, Some("manual")).is_none());
    }

    #[test]
    fn ignores_other_datasets_and_blank_lines() {
        let raw = "tank/services/radarr2@x\t1\n\ntank/services/radarr@y\t2\n";
        let snaps = parse_snapshot_list(&ds("tank/services/radarr"), raw).unwrap();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].short_name(), "y");
    }

    #[test]
    fn malformed_creation_is_an_error() {
        let err = parse_snapshot_list(&ds("tank/a"), "tank/a@x\tyesterday\n").unwrap_err();
        assert!(err.to_string().contains("bad creation time"));
    }

    #[test]
    fn list_args_end_with_dataset() {
        let args = list_snapshots_args(&ds("tank/a"));
        assert_eq!(args.last().map(String::as_str), Some("tank/a"));
        assert!(args.contains(&"snapshot".to_string()));
    }
}
