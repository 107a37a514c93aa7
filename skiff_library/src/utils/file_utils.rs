use crate::transaction::TransactionId;
use anyhow::Result;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::{error, warn};

/// Tries to remove the specified file or empty directory
/// Swallows any failure
pub fn try_remove_pth<P: AsRef<Path>>(path: P, tid: &TransactionId) {
    let pth: &Path = path.as_ref();
    if pth.is_file() {
        match std::fs::remove_file(pth) {
            Ok(_) => {},
            Err(_) => warn!(tid=tid, path=%pth.display(), "Unable to remove file"),
        };
    } else if pth.is_dir() {
        match std::fs::remove_dir(pth) {
            Ok(_) => {},
            Err(_) => warn!(tid=tid, path=%pth.display(), "Unable to remove directory"),
        };
    } else {
        error!(tid=tid, path=%pth.display(), "Unknown path type to delete")
    }
}

/// Make sure the directory exists
pub fn ensure_dir<P: AsRef<Path>>(dir: P) -> Result<()> {
    match std::fs::create_dir_all(&dir) {
        Ok(_) => Ok(()),
        Err(e) => anyhow::bail!("Failed to create dir '{:?}' because '{}'", dir.as_ref().to_str(), e),
    }
}

/// Move `from` to `to`, `to` either appears whole or not at all.
/// A plain rename is tried first. Across filesystems the data is copied next to `to` and renamed into place.
pub fn move_file<P: AsRef<Path>, Q: AsRef<Path>>(from: P, to: Q, tid: &TransactionId) -> Result<()> {
    let (from, to) = (from.as_ref(), to.as_ref());
    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }
    copy_into_place(from, to, tid)?;
    try_remove_pth(from, tid);
    Ok(())
}

fn partial_path(to: &Path) -> PathBuf {
    let mut name = to.file_name().map(OsString::from).unwrap_or_default();
    name.push(".partial");
    to.with_file_name(name)
}

fn copy_into_place(from: &Path, to: &Path, tid: &TransactionId) -> Result<()> {
    let partial = partial_path(to);
    if let Err(e) = std::fs::copy(from, &partial) {
        if partial.exists() {
            try_remove_pth(&partial, tid);
        }
        crate::bail_error!(tid=tid, error=%e, from=%from.display(), to=%to.display(), "Failed to copy file");
    }
    if let Err(e) = std::fs::rename(&partial, to) {
        try_remove_pth(&partial, tid);
        crate::bail_error!(tid=tid, error=%e, to=%to.display(), "Failed to move copied file into place");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn move_file_relocates() {
        let tid = "test".to_string();
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a");
        let dst = dir.path().join("b");
        std::fs::write(&src, b"hello").unwrap();
        move_file(&src, &dst, &tid).unwrap();
        assert!(!src.exists());
        assert_eq!(std::fs::read(&dst).unwrap(), b"hello");
    }

    #[test]
    fn copy_lands_whole_without_leftovers() {
        let tid = "test".to_string();
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("plugin.tar");
        let dst = dir.path().join("staged");
        std::fs::write(&src, b"archive").unwrap();
        copy_into_place(&src, &dst, &tid).unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), b"archive");
        assert!(!partial_path(&dst).exists());
    }

    #[test]
    fn failed_copy_keeps_previous_destination() {
        let tid = "test".to_string();
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("staged");
        std::fs::write(&dst, b"previous").unwrap();
        // a directory cannot be copied as a file
        let src = dir.path().join("not-a-file");
        std::fs::create_dir(&src).unwrap();

        assert!(move_file(&src, &dst, &tid).is_err());

        assert_eq!(std::fs::read(&dst).unwrap(), b"previous");
        assert!(!partial_path(&dst).exists());
    }

    #[test]
    fn partial_sits_beside_destination() {
        assert_eq!(
            partial_path(Path::new("/staging/net_plugin")),
            PathBuf::from("/staging/net_plugin.partial")
        );
    }

    #[test]
    fn ensure_dir_nested() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("x").join("y");
        ensure_dir(&nested).unwrap();
        assert!(nested.is_dir());
    }
}
