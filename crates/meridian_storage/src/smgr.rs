use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use meridian_common::error::WalError;
use meridian_common::types::{DbDirSpec, Oid, RelFileNode};

/// File deletions scheduled by commit/abort and replayed by redo.
///
/// Deleting something that is already gone is not an error: redo may replay
/// a deletion that completed before the crash.
pub trait StorageManager: Send + Sync {
    fn unlink_relation(&self, rel: RelFileNode) -> Result<(), WalError>;
    fn drop_database_dir(&self, db: DbDirSpec) -> Result<(), WalError>;
    fn drop_tablespace_dir(&self, tablespace: Oid) -> Result<(), WalError>;
}

/// Maps relations onto `<root>/base/<spc>/<db>/<rel>`.
pub struct FsStorageManager {
    root: PathBuf,
}

impl FsStorageManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn tablespace_path(&self, spc: Oid) -> PathBuf {
        self.root.join("base").join(spc.0.to_string())
    }

    pub fn database_path(&self, db: DbDirSpec) -> PathBuf {
        self.tablespace_path(db.tablespace)
            .join(db.database.0.to_string())
    }

    pub fn relation_path(&self, rel: RelFileNode) -> PathBuf {
        self.tablespace_path(rel.spc_node)
            .join(rel.db_node.0.to_string())
            .join(rel.rel_node.0.to_string())
    }

    /// Create an empty relation file (used by callers that stage pending deletes).
    pub fn create_relation(&self, rel: RelFileNode) -> Result<PathBuf, WalError> {
        let path = self.relation_path(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::File::create(&path)?;
        Ok(path)
    }
}

fn ignore_missing(result: std::io::Result<()>, path: &Path) -> Result<(), WalError> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tracing::debug!("smgr: {} already removed", path.display());
            Ok(())
        }
        Err(e) => Err(WalError::Io(e)),
    }
}

impl StorageManager for FsStorageManager {
    fn unlink_relation(&self, rel: RelFileNode) -> Result<(), WalError> {
        let path = self.relation_path(rel);
        tracing::debug!("smgr: unlink relation {}", rel);
        ignore_missing(std::fs::remove_file(&path), &path)
    }

    fn drop_database_dir(&self, db: DbDirSpec) -> Result<(), WalError> {
        let path = self.database_path(db);
        tracing::debug!("smgr: drop database dir {}", path.display());
        ignore_missing(std::fs::remove_dir_all(&path), &path)
    }

    fn drop_tablespace_dir(&self, tablespace: Oid) -> Result<(), WalError> {
        let path = self.tablespace_path(tablespace);
        tracing::debug!("smgr: drop tablespace dir {}", path.display());
        ignore_missing(std::fs::remove_dir_all(&path), &path)
    }
}

/// Storage manager for nodes that own no relation files.
pub struct NullStorageManager;

impl StorageManager for NullStorageManager {
    fn unlink_relation(&self, _rel: RelFileNode) -> Result<(), WalError> {
        Ok(())
    }

    fn drop_database_dir(&self, _db: DbDirSpec) -> Result<(), WalError> {
        Ok(())
    }

    fn drop_tablespace_dir(&self, _tablespace: Oid) -> Result<(), WalError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rel(n: u32) -> RelFileNode {
        RelFileNode {
            spc_node: Oid(1663),
            db_node: Oid(5),
            rel_node: Oid(n),
        }
    }

    #[test]
    fn test_unlink_relation_and_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let smgr = FsStorageManager::new(dir.path());
        let path = smgr.create_relation(rel(16384)).unwrap();
        assert!(path.exists());
        smgr.unlink_relation(rel(16384)).unwrap();
        assert!(!path.exists());
        smgr.unlink_relation(rel(16384)).unwrap();
    }

    #[test]
    fn test_drop_database_dir() {
        let dir = tempfile::tempdir().unwrap();
        let smgr = FsStorageManager::new(dir.path());
        smgr.create_relation(rel(1)).unwrap();
        smgr.create_relation(rel(2)).unwrap();
        let db = DbDirSpec {
            database: Oid(5),
            tablespace: Oid(1663),
        };
        smgr.drop_database_dir(db).unwrap();
        assert!(!smgr.database_path(db).exists());
        assert!(smgr.tablespace_path(Oid(1663)).exists());
        smgr.drop_tablespace_dir(Oid(1663)).unwrap();
        assert!(!smgr.tablespace_path(Oid(1663)).exists());
    }
}
