//! Path-addressed byte storage.
//!
//! Epistemic foundation:
//! - K_i: Writes go to a staging file first and become visible only on publish
//! - K_i: Publish is an atomic rename (write-then-rename)
//! - K_i: Overwritten data is kept as a backup until the writer commits or restores it
//! - I^B: Crash between stage and publish → stale staging files, removed by `recover`

use crate::models::{Result, StagepointError, WritePolicy};
use std::fmt;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const STAGING_SUFFIX: &str = "staging";
const BACKUP_SUFFIX: &str = "backup";

/// Storage collaborator used by the checkpoint store.
pub trait Storage: Send + Sync + fmt::Debug {
    /// Map a caller path to the location actually written.
    fn resolve(&self, path: &Path) -> PathBuf;

    /// Whether data exists at `path`.
    fn exists(&self, path: &Path) -> bool;

    /// Fail early if `path` cannot be written under `policy`.
    fn check_writable(&self, path: &Path, policy: WritePolicy) -> Result<()>;

    /// Open a staging writer for `path`. Nothing is visible at `path` until
    /// `publish` is called with the same `staging_id`.
    fn stage(&self, path: &Path, staging_id: &str) -> Result<Box<dyn Write + Send>>;

    /// Make staged data visible at `path`. Data previously at `path` is kept
    /// as a backup under `staging_id` until `restore` or `drop_backup`.
    fn publish(&self, path: &Path, staging_id: &str, policy: WritePolicy) -> Result<()>;

    /// Put the backup taken by `publish` back at `path`.
    ///
    /// Returns false if `publish` found nothing to back up.
    fn restore(&self, path: &Path, staging_id: &str) -> Result<bool>;

    /// Forget the backup taken by `publish`, if any.
    fn drop_backup(&self, path: &Path, staging_id: &str) -> Result<()>;

    /// Drop staged data for `path`, if any.
    fn discard(&self, path: &Path, staging_id: &str) -> Result<()>;

    /// Remove published data at `path`, if any.
    fn remove(&self, path: &Path) -> Result<()>;

    /// Open published data for sequential reading.
    fn open(&self, path: &Path) -> Result<Box<dyn Read + Send>>;
}

/// Local filesystem storage rooted at a directory.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    /// Create storage rooted at `root`, creating the directory if needed.
    pub fn new(root: &Path) -> Result<Self> {
        fs::create_dir_all(root).map_err(|e| StagepointError::io("creating storage root", e))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<path>.<id>.<suffix>`, next to the target.
    fn sibling_path(&self, path: &Path, staging_id: &str, suffix: &str) -> PathBuf {
        let target = self.resolve(path);
        let mut name = target
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(format!(".{staging_id}.{suffix}"));
        target.with_file_name(name)
    }

    fn staging_path(&self, path: &Path, staging_id: &str) -> PathBuf {
        self.sibling_path(path, staging_id, STAGING_SUFFIX)
    }

    fn backup_path(&self, path: &Path, staging_id: &str) -> PathBuf {
        self.sibling_path(path, staging_id, BACKUP_SUFFIX)
    }

    /// Remove staging files and backups left behind by interrupted writes.
    ///
    /// Backups of uncommitted checkpoint calls are still needed to undo them,
    /// so run this after `CheckpointStore::recover`.
    ///
    /// Returns the number of files removed.
    pub fn recover(&self) -> Result<usize> {
        let mut removed = 0;
        for suffix in [STAGING_SUFFIX, BACKUP_SUFFIX] {
            let pattern = self.root.join("**").join(format!("*.{suffix}"));
            let pattern_str = pattern.to_string_lossy();

            let stale: Vec<_> = glob::glob(&pattern_str)
                .map_err(|e| StagepointError::Internal(format!("Invalid glob pattern: {e}")))?
                .filter_map(|r| r.ok())
                .collect();

            for path in &stale {
                warn!(path = %path.display(), "Removing stale {suffix} file");
                fs::remove_file(path)
                    .map_err(|e| StagepointError::io(format!("removing {suffix} file"), e))?;
            }
            removed += stale.len();
        }
        Ok(removed)
    }
}

impl Storage for LocalStorage {
    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    fn exists(&self, path: &Path) -> bool {
        self.resolve(path).exists()
    }

    fn check_writable(&self, path: &Path, policy: WritePolicy) -> Result<()> {
        let target = self.resolve(path);
        if target.is_dir() {
            return Err(StagepointError::storage_write(&target, "path is a directory"));
        }
        if policy == WritePolicy::FailIfExists && target.exists() {
            return Err(StagepointError::storage_write(&target, "already exists"));
        }
        Ok(())
    }

    fn stage(&self, path: &Path, staging_id: &str) -> Result<Box<dyn Write + Send>> {
        let target = self.resolve(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| StagepointError::storage_write(&target, e))?;
        }
        let staging = self.staging_path(path, staging_id);
        let file = File::create(&staging).map_err(|e| StagepointError::storage_write(&target, e))?;
        debug!(path = %staging.display(), "Staging file created");
        Ok(Box::new(SyncOnFlush { file }))
    }

    fn publish(&self, path: &Path, staging_id: &str, policy: WritePolicy) -> Result<()> {
        let target = self.resolve(path);
        // The policy is re-checked here: another writer may have created the
        // path since `check_writable`.
        if policy == WritePolicy::FailIfExists && target.exists() {
            return Err(StagepointError::storage_write(&target, "already exists"));
        }
        let staging = self.staging_path(path, staging_id);
        let backup = self.backup_path(path, staging_id);
        let backed_up = target.is_file();
        if backed_up {
            fs::rename(&target, &backup).map_err(|e| StagepointError::storage_write(&target, e))?;
        }
        if let Err(e) = fs::rename(&staging, &target) {
            if backed_up {
                if let Err(undo) = fs::rename(&backup, &target) {
                    warn!(path = %target.display(), error = %undo, "Failed to restore backup");
                }
            }
            return Err(StagepointError::storage_write(&target, e));
        }
        debug!(path = %target.display(), backed_up, "Published");
        Ok(())
    }

    fn restore(&self, path: &Path, staging_id: &str) -> Result<bool> {
        let backup = self.backup_path(path, staging_id);
        if !backup.exists() {
            return Ok(false);
        }
        let target = self.resolve(path);
        fs::rename(&backup, &target).map_err(|e| StagepointError::io("restoring backup", e))?;
        debug!(path = %target.display(), "Backup restored");
        Ok(true)
    }

    fn drop_backup(&self, path: &Path, staging_id: &str) -> Result<()> {
        let backup = self.backup_path(path, staging_id);
        if backup.exists() {
            fs::remove_file(&backup).map_err(|e| StagepointError::io("removing backup", e))?;
        }
        Ok(())
    }

    fn discard(&self, path: &Path, staging_id: &str) -> Result<()> {
        let staging = self.staging_path(path, staging_id);
        if staging.exists() {
            fs::remove_file(&staging)
                .map_err(|e| StagepointError::io("removing staging file", e))?;
        }
        Ok(())
    }

    fn remove(&self, path: &Path) -> Result<()> {
        let target = self.resolve(path);
        if target.exists() {
            fs::remove_file(&target).map_err(|e| StagepointError::io("removing checkpoint", e))?;
        }
        Ok(())
    }

    fn open(&self, path: &Path) -> Result<Box<dyn Read + Send>> {
        let target = self.resolve(path);
        let file = File::open(&target).map_err(|e| {
            StagepointError::io(format!("opening checkpoint {}", target.display()), e)
        })?;
        Ok(Box::new(file))
    }
}

/// File writer whose `flush` also syncs to disk, so a flushed checkpoint is durable.
struct SyncOnFlush {
    file: File,
}

impl Write for SyncOnFlush {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()?;
        self.file.sync_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_staged(storage: &LocalStorage, path: &Path, id: &str, data: &[u8]) {
        let mut w = storage.stage(path, id).unwrap();
        w.write_all(data).unwrap();
        w.flush().unwrap();
    }

    fn read(storage: &LocalStorage, path: &Path) -> Vec<u8> {
        let mut buf = Vec::new();
        storage.open(path).unwrap().read_to_end(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_stage_invisible_until_publish() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path()).unwrap();
        let path = Path::new("nested/out.bin");

        write_staged(&storage, path, "job1", b"hello");
        assert!(!storage.exists(path));

        storage.publish(path, "job1", WritePolicy::Overwrite).unwrap();
        assert!(storage.exists(path));
        assert_eq!(read(&storage, path), b"hello");
    }

    #[test]
    fn test_overwrite_replaces_contents() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path()).unwrap();
        let path = Path::new("out.bin");

        write_staged(&storage, path, "a", b"first-long-contents");
        storage.publish(path, "a", WritePolicy::Overwrite).unwrap();
        write_staged(&storage, path, "b", b"second");
        storage.publish(path, "b", WritePolicy::Overwrite).unwrap();

        assert_eq!(read(&storage, path), b"second");
        storage.drop_backup(path, "b").unwrap();
        assert_eq!(storage.recover().unwrap(), 0);
    }

    #[test]
    fn test_restore_brings_back_overwritten_data() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path()).unwrap();
        let path = Path::new("out.bin");

        write_staged(&storage, path, "a", b"kept");
        storage.publish(path, "a", WritePolicy::Overwrite).unwrap();
        assert!(!storage.restore(path, "a").unwrap());

        write_staged(&storage, path, "b", b"replacement");
        storage.publish(path, "b", WritePolicy::Overwrite).unwrap();
        assert_eq!(read(&storage, path), b"replacement");

        assert!(storage.restore(path, "b").unwrap());
        assert_eq!(read(&storage, path), b"kept");
        assert!(!storage.restore(path, "b").unwrap());
    }

    #[test]
    fn test_failed_publish_keeps_existing_data() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path()).unwrap();
        let path = Path::new("out.bin");

        write_staged(&storage, path, "a", b"kept");
        storage.publish(path, "a", WritePolicy::Overwrite).unwrap();

        // Nothing staged under "b"
        let err = storage.publish(path, "b", WritePolicy::Overwrite).unwrap_err();
        assert!(matches!(err, StagepointError::StorageWrite { .. }));
        assert_eq!(read(&storage, path), b"kept");
        assert!(!storage.restore(path, "b").unwrap());
    }

    #[test]
    fn test_fail_if_exists() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path()).unwrap();
        let path = Path::new("out.bin");

        write_staged(&storage, path, "a", b"x");
        storage.publish(path, "a", WritePolicy::FailIfExists).unwrap();

        let err = storage
            .check_writable(path, WritePolicy::FailIfExists)
            .unwrap_err();
        assert!(matches!(err, StagepointError::StorageWrite { .. }));
        assert!(storage.check_writable(path, WritePolicy::Overwrite).is_ok());
    }

    #[test]
    fn test_unwritable_parent() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path()).unwrap();
        fs::write(dir.path().join("blocker"), b"file").unwrap();

        let err = storage
            .stage(Path::new("blocker/out.bin"), "a")
            .err()
            .unwrap();
        assert!(matches!(err, StagepointError::StorageWrite { .. }));
    }

    #[test]
    fn test_discard_and_recover() {
        let dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(dir.path()).unwrap();

        write_staged(&storage, Path::new("a.bin"), "j", b"1");
        storage.discard(Path::new("a.bin"), "j").unwrap();
        assert_eq!(storage.recover().unwrap(), 0);

        write_staged(&storage, Path::new("deep/b.bin"), "j", b"2");
        write_staged(&storage, Path::new("c.bin"), "j", b"3");
        assert_eq!(storage.recover().unwrap(), 2);
        assert_eq!(storage.recover().unwrap(), 0);

        // A backup whose commit never cleaned it up
        write_staged(&storage, Path::new("c.bin"), "k", b"4");
        storage.publish(Path::new("c.bin"), "k", WritePolicy::Overwrite).unwrap();
        write_staged(&storage, Path::new("c.bin"), "m", b"5");
        storage.publish(Path::new("c.bin"), "m", WritePolicy::Overwrite).unwrap();
        assert_eq!(storage.recover().unwrap(), 1);
        assert_eq!(read(&storage, Path::new("c.bin")), b"5");
    }
}
