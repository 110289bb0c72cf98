use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};

pub const SEPARATOR: char = '/';

// At least one non-whitespace character, no snapshot suffix.
static SEGMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^@]*\S[^@]*$").expect("segment pattern is valid"));

/// A validated, slash-delimited dataset path (`tank/services/radarr`).
///
/// Never empty, never starts or ends with a separator and never contains an
/// empty or whitespace-only segment. Snapshot suffixes (`@name`) are rejected.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StoragePath(String);

impl StoragePath {
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        validate(&raw)?;
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split(SEPARATOR)
    }

    pub fn depth(&self) -> usize {
        self.segments().count()
    }

    /// The pool (first segment).
    pub fn root(&self) -> &str {
        self.0.split(SEPARATOR).next().unwrap_or(&self.0)
    }

    /// Parent path, or `None` for a single-segment path.
    pub fn parent(&self) -> Option<StoragePath> {
        let (head, _) = self.0.rsplit_once(SEPARATOR)?;
        if head.is_empty() {
            return None;
        }
        Some(StoragePath(head.to_string()))
    }

    /// Returns the part of `self` below `ancestor`.
    ///
    /// `Some("")` when both are equal, `None` when `ancestor` is not a
    /// separator-aligned prefix (`tank/services/radar` is not an ancestor of
    /// `tank/services/radarr`).
    pub fn strip_ancestor<'a>(&'a self, ancestor: &StoragePath) -> Option<&'a str> {
        if self.0 == ancestor.0 {
            return Some("");
        }
        let rest = self.0.strip_prefix(ancestor.0.as_str())?;
        rest.strip_prefix(SEPARATOR)
    }

    /// Appends a relative suffix. An empty suffix returns `self` unchanged.
    pub fn join(&self, suffix: &str) -> Result<StoragePath> {
        if suffix.is_empty() {
            return Ok(self.clone());
        }
        StoragePath::new(format!("{}{SEPARATOR}{suffix}", self.0))
    }
}

fn validate(raw: &str) -> Result<()> {
    if raw.is_empty() {
        return Err(Error::new(ErrorKind::InvalidPath, "dataset path is empty"));
    }
    if raw.starts_with(SEPARATOR) || raw.ends_with(SEPARATOR) {
        return Err(Error::new(
            ErrorKind::InvalidPath,
            format!("dataset path '{raw}' has a leading or trailing separator"),
        ));
    }
    for seg in raw.split(SEPARATOR) {
        if seg.is_empty() {
            return Err(Error::new(
                ErrorKind::InvalidPath,
                format!("dataset path '{raw}' contains an empty segment"),
            ));
        }
        if !SEGMENT_RE.is_match(seg) {
            return Err(Error::new(
                ErrorKind::InvalidPath,
                format!("dataset path '{raw}' has invalid segment '{seg}'"),
            ));
        }
    }
    Ok(())
}

impl fmt::Display for StoragePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for StoragePath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        StoragePath::new(s)
    }
}

impl TryFrom<String> for StoragePath {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        StoragePath::new(value)
    }
}

impl From<StoragePath> for String {
    fn from(value: StoragePath) -> Self {
        value.0
    }
}

impl Borrow<str> for StoragePath {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for StoragePath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Walks from `path` up to the pool root and returns the first node that has
/// an entry in `registry`. Lookups are exact; the walk does the hierarchy.
pub fn find_policy<'a, V>(
    registry: &'a BTreeMap<StoragePath, V>,
    path: &StoragePath,
) -> Option<(&'a StoragePath, &'a V)> {
    let mut cur: &str = path.as_str();
    loop {
        if let Some(hit) = registry.get_key_value(cur) {
            return Some(hit);
        }
        match cur.rsplit_once(SEPARATOR) {
            Some((parent, _)) if !parent.is_empty() => cur = parent,
            _ => return None,
        }
    }
}
