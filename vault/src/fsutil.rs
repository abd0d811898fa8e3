//! Filesystem helpers shared by the log, cursor, index and key writers.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

/// Write `target` atomically: stage a sibling temp file, fsync it, rename it
/// over the target, then fsync the parent directory.
///
/// A crash at any point leaves either the old or the new content in place.
pub fn write_atomic<F>(target: &Path, write_fn: F) -> io::Result<()>
where
    F: FnOnce(&mut File) -> io::Result<()>,
{
    let parent = target.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "target path has no parent directory")
    })?;
    fs::create_dir_all(parent)?;

    let tmp_path = staging_path(parent, target);
    let mut tmp_file = File::create(&tmp_path)?;

    let written = write_fn(&mut tmp_file).and_then(|_| tmp_file.sync_all());
    if let Err(err) = written {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    drop(tmp_file);

    if let Err(err) = fs::rename(&tmp_path, target) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }

    sync_dir(parent)
}

/// Serialize `value` as pretty JSON and write it atomically.
pub fn write_json_atomic<T: serde::Serialize>(target: &Path, value: &T) -> io::Result<()> {
    let body = serde_json::to_vec_pretty(value)?;
    write_atomic(target, |file| io::Write::write_all(file, &body))
}

/// Flush directory metadata so a completed rename survives power loss.
#[cfg(unix)]
pub fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
pub fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

/// Remove a file, treating an already-missing file as success.
pub fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

fn staging_path(parent: &Path, target: &Path) -> PathBuf {
    let base_name = target
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("camvault");
    parent.join(format!(".{}.tmp-{}", base_name, uuid::Uuid::new_v4().simple()))
}
