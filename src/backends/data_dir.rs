//! On-disk directory owned by a backend instance.

use std::path::{Path, PathBuf};

use crate::error::{DbError, DbResult};

/// Wipes the directory on open and again on drop when `drop_data` is set.
///
/// Declare it after the store handle in the owning struct: fields drop in
/// declaration order, and the store must be closed before its files go.
pub(crate) struct DataDir {
    path: PathBuf,
    drop_data: bool,
}

impl DataDir {
    pub(crate) fn prepare(path: PathBuf, drop_data: bool) -> DbResult<Self> {
        // Clean up any existing database directory
        if drop_data && path.exists() {
            std::fs::remove_dir_all(&path).map_err(DbError::backend)?;
        }
        Ok(Self { path, drop_data })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DataDir {
    fn drop(&mut self) {
        if self.drop_data && self.path.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.path) {
                tracing::warn!(path = %self.path.display(), error = %e, "error cleaning up database directory");
            }
        }
    }
}
