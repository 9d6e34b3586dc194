use crate::error::{PkgError, Result};
use fs4::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Advisory exclusive lock serialising mutating operations on one database
/// and installation root. Released when dropped.
#[derive(Debug)]
pub struct InstallLock {
    file: File,
    path: PathBuf,
}

impl InstallLock {
    /// Take the lock without waiting. Contention yields [`PkgError::Locked`].
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                tracing::debug!("Acquired lock {:?}", path);
                Ok(Self {
                    file,
                    path: path.to_path_buf(),
                })
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => Err(PkgError::Locked(path.to_path_buf())),
            Err(err) => Err(err.into()),
        }
    }
}

impl Drop for InstallLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!("Failed to release lock {:?}: {}", self.path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_is_exclusive_until_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bap.db.lock");

        let held = InstallLock::acquire(&path).unwrap();
        assert!(matches!(InstallLock::acquire(&path), Err(PkgError::Locked(_))));

        drop(held);
        assert!(InstallLock::acquire(&path).is_ok());
    }
}
