use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dataset::StoragePath;
use crate::error::{Error, ErrorKind, Result};
use crate::restore::MethodUsed;

pub const MARKER_VERSION: u32 = 1;
/// Every file the gate itself places in a mountpoint starts with this.
pub const BOOKKEEPING_PREFIX: &str = ".preseed-";
/// Leftovers of a previous run that died mid-attempt; swept on the next run.
pub const STAGING_PREFIX: &str = ".preseed-staging-";
pub const TEMP_PREFIX: &str = ".preseed-tmp-";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PreseedState {
    pub version: u32,
    pub service: String,
    pub restored: bool,
    pub restored_at: DateTime<Utc>,
    pub method_used: MethodUsed,
    #[serde(default)]
    pub dataset: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
}

/// Durable completion record kept inside the restored mountpoint, so it is
/// destroyed together with the data it describes.
#[derive(Debug, Clone)]
pub struct CompletionMarker {
    service: String,
    path: PathBuf,
}

impl CompletionMarker {
    pub fn new(service: &str, mountpoint: &Path) -> Self {
        Self {
            service: service.to_string(),
            path: mountpoint.join(file_name(service)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn read(&self) -> Result<Option<PreseedState>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::msg(format!(
                    "failed to read marker {}: {e}",
                    self.path.display()
                )));
            }
        };
        let state = serde_json::from_str(&raw).map_err(|e| {
            Error::msg(format!("failed to parse marker {}: {e}", self.path.display()))
        })?;
        Ok(Some(state))
    }

    pub fn write(
        &self,
        method_used: MethodUsed,
        at: DateTime<Utc>,
        dataset: &StoragePath,
        host: &str,
    ) -> Result<PreseedState> {
        let state = PreseedState {
            version: MARKER_VERSION,
            service: self.service.clone(),
            restored: true,
            restored_at: at,
            method_used,
            dataset: Some(dataset.to_string()),
            host: Some(host.to_string()).filter(|h| !h.is_empty()),
        };
        let body = serde_json::to_string_pretty(&state).map_err(|e| {
            Error::new(
                ErrorKind::MarkerWriteFailed,
                format!("failed to encode marker: {e}"),
            )
        })?;
        atomic_write_text(&self.path, &body).map_err(|e| {
            Error::new(
                ErrorKind::MarkerWriteFailed,
                format!("failed to write marker {}: {e}", self.path.display()),
            )
        })?;
        Ok(state)
    }
}

pub fn file_name(service: &str) -> String {
    format!("{BOOKKEEPING_PREFIX}{service}.json")
}

/// Entries that do not count as user data when deciding whether a
/// mountpoint is empty.
pub fn is_bookkeeping(name: &str) -> bool {
    name.starts_with(BOOKKEEPING_PREFIX) || name == "lost+found" || name == ".zfs"
}

/// Staging dirs and temp files no live run owns once the gate starts.
pub fn is_stale_leftover(name: &str) -> bool {
    name.starts_with(STAGING_PREFIX) || name.starts_with(TEMP_PREFIX)
}

/// Write to a sibling temp file, fsync, then rename over `path`.
pub fn atomic_write_text(path: &Path, body: &str) -> Result<()> {
    let file_name = path.file_name().and_then(|s| s.to_str()).ok_or_else(|| {
        Error::msg(format!(
            "invalid file path for atomic write: {}",
            path.display()
        ))
    })?;
    let tmp = path.with_file_name(format!(
        "{TEMP_PREFIX}{}-{}-{}",
        file_name,
        std::process::id(),
        Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));
    let written = fs::write(&tmp, body).and_then(|_| fs::File::open(&tmp)?.sync_all());
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(Error::msg(format!(
            "failed to write temp file {}: {e}",
            tmp.display()
        )));
    }
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        Error::msg(format!(
            "failed to rename {} -> {}: {e}",
            tmp.display(),
            path.display()
        ))
    })?;
    if let Some(parent) = path.parent()
        && let Ok(dir) = fs::File::open(parent)
    {
        let _ = dir.sync_all();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ds() -> StoragePath {
        StoragePath::new("tank/services/radarr").unwrap()
    }

    #[test]
    fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let m = CompletionMarker::new("radarr", dir.path());
        assert!(!m.exists());
        assert!(m.read().unwrap().is_none());

        let at = Utc::now();
        let written = m.write(MethodUsed::Replica, at, &ds(), "forge").unwrap();
        assert!(m.exists());
        assert_eq!(m.path(), dir.path().join(".preseed-radarr.json"));

        let read = m.read().unwrap().expect("marker");
        assert_eq!(read, written);
        assert!(read.restored);
        assert_eq!(read.method_used, MethodUsed::Replica);
        assert_eq!(read.host.as_deref(), Some("forge"));
    }

    #[test]
    fn record_uses_snake_case_method() {
        let dir = tempfile::tempdir().unwrap();
        let m = CompletionMarker::new("sonarr", dir.path());
        m.write(MethodUsed::NoneNeeded, Utc::now(), &ds(), "forge")
            .unwrap();
        let raw = fs::read_to_string(m.path()).unwrap();
        let v: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(v["method_used"], "none_needed");
        assert_eq!(v["service"], "sonarr");
        assert_eq!(v["version"], MARKER_VERSION);
    }

    #[test]
    fn no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let m = CompletionMarker::new("radarr", dir.path());
        m.write(MethodUsed::Local, Utc::now(), &ds(), "forge").unwrap();
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![".preseed-radarr.json".to_string()]);
    }

    #[test]
    fn write_failure_is_marker_write_failed() {
        let dir = tempfile::tempdir().unwrap();
        let m = CompletionMarker::new("radarr", &dir.path().join("missing"));
        let err = m
            .write(MethodUsed::Remote, Utc::now(), &ds(), "forge")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MarkerWriteFailed);
    }

    #[test]
    fn bookkeeping_names() {
        assert!(is_bookkeeping(".preseed-radarr.json"));
        assert!(is_bookkeeping(".preseed-staging-abc"));
        assert!(is_bookkeeping("lost+found"));
        assert!(is_bookkeeping(".zfs"));
        assert!(!is_bookkeeping("radarr.db"));
        assert!(!is_bookkeeping(".config"));
    }

    #[test]
    fn temp_names_are_bookkeeping_and_stale() {
        let tmp = format!("{TEMP_PREFIX}.preseed-radarr.promoting-1234-5678");
        assert!(is_bookkeeping(&tmp));
        assert!(is_stale_leftover(&tmp));
        assert!(is_stale_leftover(".preseed-staging-abc"));
        assert!(!is_stale_leftover(".preseed-radarr.json"));
        assert!(!is_stale_leftover(".preseed-radarr.promoting"));
    }
}
