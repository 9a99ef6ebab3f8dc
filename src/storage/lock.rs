//! Advisory cross-process locks on sidecar files.

use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;

/// Takes an exclusive lock on `path` without waiting, creating the file and
/// its directory if needed.
///
/// Returns `Ok(None)` when another handle holds the lock. The lock is
/// released when the returned file is dropped.
///
/// # Errors
/// Returns an error if the lock file cannot be created or locked for a
/// reason other than contention.
pub fn try_exclusive(path: &Path) -> io::Result<Option<File>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(Some(file)),
        Err(err) if err.kind() == fs2::lock_contended_error().kind() => Ok(None),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_holder_is_refused_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("pass.lock");

        let first = try_exclusive(&path).unwrap();
        assert!(first.is_some());
        assert!(try_exclusive(&path).unwrap().is_none());

        drop(first);
        assert!(try_exclusive(&path).unwrap().is_some());
    }
}
