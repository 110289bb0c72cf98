use std::fs;
use std::path::Path;

use crate::error::{Error, Result};
use crate::marker::{is_bookkeeping, is_stale_leftover};

/// Whether `dir` holds anything besides gate bookkeeping.
pub fn has_user_data(dir: &Path) -> Result<bool> {
    Ok(!user_entries(dir)?.is_empty())
}

pub fn user_entries(dir: &Path) -> Result<Vec<String>> {
    let rd = fs::read_dir(dir)
        .map_err(|e| Error::msg(format!("failed to list {}: {e}", dir.display())))?;
    let mut names = Vec::new();
    for entry in rd {
        let entry = entry.map_err(|e| Error::msg(format!("failed to list {}: {e}", dir.display())))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !is_bookkeeping(&name) {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

/// Removes every non-bookkeeping entry of `dir`.
pub fn clear_user_data(dir: &Path) -> Result<usize> {
    let names = user_entries(dir)?;
    for name in &names {
        clear_dir_or_file(&dir.join(name))?;
    }
    Ok(names.len())
}

/// Removes staging dirs and temp files left by a run that died mid-attempt.
pub fn sweep_leftovers(dir: &Path) -> Result<Vec<String>> {
    let rd = fs::read_dir(dir)
        .map_err(|e| Error::msg(format!("failed to list {}: {e}", dir.display())))?;
    let mut swept = Vec::new();
    for entry in rd {
        let entry = entry.map_err(|e| Error::msg(format!("failed to list {}: {e}", dir.display())))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_stale_leftover(&name) {
            clear_dir_or_file(&entry.path())?;
            swept.push(name);
        }
    }
    swept.sort();
    Ok(swept)
}

/// Moves the contents of `staged` into `dest`. Bookkeeping entries carried in
/// the staged data are dropped.
pub fn promote(staged: &Path, dest: &Path) -> Result<usize> {
    let rd = fs::read_dir(staged)
        .map_err(|e| Error::msg(format!("failed to list {}: {e}", staged.display())))?;
    let mut moved = 0;
    for entry in rd {
        let entry =
            entry.map_err(|e| Error::msg(format!("failed to list {}: {e}", staged.display())))?;
        let name = entry.file_name();
        if is_bookkeeping(&name.to_string_lossy()) {
            continue;
        }
        let src = entry.path();
        let dst = dest.join(&name);
        clear_dir_or_file(&dst)?;
        match fs::rename(&src, &dst) {
            Ok(()) => {}
            Err(e) if is_cross_device(&e) => {
                tracing::debug!(src = %src.display(), "rename crosses devices; copying");
                copy_path(&src, &dst)?;
                clear_dir_or_file(&src)?;
            }
            Err(e) => {
                return Err(Error::msg(format!(
                    "failed to move {} -> {}: {e}",
                    src.display(),
                    dst.display()
                )));
            }
        }
        moved += 1;
    }
    Ok(moved)
}

fn is_cross_device(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(libc::EXDEV)
}

pub fn clear_dir_or_file(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_dir() => fs::remove_dir_all(path).map_err(|e| {
            Error::msg(format!(
                "failed to remove directory {}: {e}",
                path.display()
            ))
        }),
        Ok(_) => fs::remove_file(path)
            .map_err(|e| Error::msg(format!("failed to remove {}: {e}", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::msg(format!(
            "failed to inspect {} before cleanup: {e}",
            path.display()
        ))),
    }
}

pub fn copy_path(src: &Path, dst: &Path) -> Result<()> {
    for entry in walkdir::WalkDir::new(src) {
        let entry = entry.map_err(|e| Error::msg(format!("walkdir error: {e}")))?;
        let p = entry.path();
        let rel = p
            .strip_prefix(src)
            .map_err(|e| Error::msg(format!("strip_prefix failed: {e}")))?;
        let out = if rel.as_os_str().is_empty() {
            dst.to_path_buf()
        } else {
            dst.join(rel)
        };
        let ft = entry.file_type();
        if ft.is_dir() {
            fs::create_dir_all(&out)
                .map_err(|e| Error::msg(format!("failed to create {}: {e}", out.display())))?;
            let perms = entry
                .metadata()
                .map_err(|e| Error::msg(format!("failed to stat {}: {e}", p.display())))?
                .permissions();
            fs::set_permissions(&out, perms).map_err(|e| {
                Error::msg(format!("failed to set permissions on {}: {e}", out.display()))
            })?;
        } else if ft.is_symlink() {
            copy_symlink(p, &out)?;
        } else {
            fs::copy(p, &out).map_err(|e| {
                Error::msg(format!(
                    "failed to copy {} -> {}: {e}",
                    p.display(),
                    out.display()
                ))
            })?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    let target = fs::read_link(src)
        .map_err(|e| Error::msg(format!("failed to read symlink {}: {e}", src.display())))?;
    clear_dir_or_file(dst)?;
    std::os::unix::fs::symlink(&target, dst).map_err(|e| {
        Error::msg(format!(
            "failed to create symlink {} -> {}: {e}",
            dst.display(),
            target.display()
        ))
    })
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    fs::copy(src, dst)
        .map(|_| ())
        .map_err(|e| Error::msg(format!("failed to copy {}: {e}", src.display())))
}

pub fn hostname() -> String {
    #[cfg(unix)]
    {
        let mut buf = [0u8; 256];
        // Safety: buf is valid for buf.len() bytes and gethostname NUL-terminates on success.
        let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
        if rc == 0 {
            let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
            let name = String::from_utf8_lossy(&buf[..end]).trim().to_string();
            if !name.is_empty() {
                return name;
            }
        }
    }
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".into())
}
