// src/daemon/lock.rs

//! Per-instance exclusive lock
//!
//! One autobuild instance owns a base directory: its database, spool,
//! chroots and repository pools. The daemon and every mutating operator
//! command hold `<base_dir>/autobuild.lock` for as long as they run, so two
//! processes never drive the same rings or chroot sessions.

use crate::error::{Error, Result};
use fs2::FileExt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// `flock(LOCK_EX)` on the instance lock file, released on drop
pub struct InstanceLock {
    _file: File,
    path: PathBuf,
}

impl InstanceLock {
    fn open(path: &Path) -> Result<File> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(File::create(path)?)
    }

    /// Wait until the lock is ours
    pub fn acquire<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = Self::open(&path)?;
        file.lock_exclusive().map_err(|e| {
            Error::IoError(format!("cannot lock {}: {}", path.display(), e))
        })?;
        info!("[lock] holding {}", path.display());
        Ok(Self { _file: file, path })
    }

    /// `Ok(None)` when another process holds the lock
    pub fn try_acquire<P: AsRef<Path>>(path: P) -> Result<Option<Self>> {
        let path = path.as_ref().to_path_buf();
        let file = Self::open(&path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                info!("[lock] holding {}", path.display());
                Ok(Some(Self { _file: file, path }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                debug!("[lock] {} is held elsewhere", path.display());
                Ok(None)
            }
            Err(e) => Err(Error::IoError(format!(
                "cannot lock {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Like [`try_acquire`](Self::try_acquire), but a held lock is an error
    /// naming the holder
    pub fn require<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        match Self::try_acquire(path)? {
            Some(lock) => {
                lock.write_pid()?;
                Ok(lock)
            }
            None => Err(Error::ConcurrencyViolation(match Self::holder_pid(path) {
                Some(pid) => format!("instance locked by process {}", pid),
                None => format!("instance locked ({})", path.display()),
            })),
        }
    }

    pub fn is_held<P: AsRef<Path>>(path: P) -> bool {
        let Ok(file) = File::open(path.as_ref()) else {
            return false;
        };
        match file.try_lock_exclusive() {
            Ok(()) => {
                let _ = FileExt::unlock(&file);
                false
            }
            Err(_) => true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn holder_pid<P: AsRef<Path>>(path: P) -> Option<u32> {
        fs::read_to_string(path.as_ref().with_extension("pid"))
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    pub fn write_pid(&self) -> Result<()> {
        fs::write(self.path.with_extension("pid"), std::process::id().to_string())?;
        Ok(())
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(self.path.with_extension("pid"));
        info!("[lock] released {}", self.path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_holder_is_refused() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("autobuild.lock");

        let first = InstanceLock::require(&path).unwrap();
        assert!(InstanceLock::is_held(&path));
        assert!(InstanceLock::try_acquire(&path).unwrap().is_none());

        let err = InstanceLock::require(&path).err().unwrap();
        assert!(matches!(err, Error::ConcurrencyViolation(_)));
        assert!(err.to_string().contains(&std::process::id().to_string()));

        drop(first);
        assert!(!InstanceLock::is_held(&path));
        assert!(InstanceLock::holder_pid(&path).is_none());
    }

    #[test]
    fn test_missing_lock_file_is_not_held() {
        let temp = TempDir::new().unwrap();
        assert!(!InstanceLock::is_held(temp.path().join("none.lock")));
    }

    #[test]
    fn test_creates_base_dir() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("var/lib/autobuild/autobuild.lock");
        let lock = InstanceLock::acquire(&path).unwrap();
        assert_eq!(lock.path(), path.as_path());
        assert!(path.exists());
    }
}
