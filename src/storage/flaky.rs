use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::storage::{FilesystemStorage, StorageBackend, StorageError, StorageResult};
use crate::sync::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StorageOp {
    Write,
    Copy,
    Move,
    Remove,
}

#[derive(Debug)]
struct Fault {
    op: StorageOp,
    under: PathBuf,
    remaining: usize,
}

/// Filesystem storage that fails chosen operations a set number of times,
/// for exercising the queue's recovery paths.
#[derive(Debug)]
pub(crate) struct FlakyStorage {
    inner: FilesystemStorage,
    faults: Mutex<Vec<Fault>>,
}

impl FlakyStorage {
    pub(crate) fn new(root: &Path) -> StorageResult<Self> {
        Ok(Self {
            inner: FilesystemStorage::new(root)?,
            faults: Mutex::new(Vec::new()),
        })
    }

    /// Fail the next `times` calls of `op` whose target lies under `under`
    pub(crate) fn fail(&self, op: StorageOp, under: impl AsRef<Path>, times: usize) {
        lock(&self.faults).push(Fault {
            op,
            under: self.inner.subpath(under.as_ref()),
            remaining: times,
        });
    }

    fn check(&self, op: StorageOp, target: &Path) -> StorageResult<()> {
        let target = self.inner.subpath(target);
        let mut faults = lock(&self.faults);
        let hit = faults
            .iter_mut()
            .find(|fault| fault.op == op && fault.remaining > 0 && target.starts_with(&fault.under));
        match hit {
            Some(fault) => {
                fault.remaining -= 1;
                Err(StorageError::Io(std::io::Error::other(format!(
                    "injected {op:?} failure for {}",
                    target.display()
                ))))
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl StorageBackend for FlakyStorage {
    fn base_path(&self) -> &Path {
        self.inner.base_path()
    }

    fn available_space(&self) -> StorageResult<u64> {
        self.inner.available_space()
    }

    async fn write_file(&self, path: &Path, contents: &[u8]) -> StorageResult<PathBuf> {
        self.check(StorageOp::Write, path)?;
        self.inner.write_file(path, contents).await
    }

    async fn move_file(&self, from: &Path, to: &Path) -> StorageResult<PathBuf> {
        self.check(StorageOp::Move, to)?;
        self.inner.move_file(from, to).await
    }

    async fn copy_file(&self, from: &Path, to: &Path) -> StorageResult<PathBuf> {
        self.check(StorageOp::Copy, to)?;
        self.inner.copy_file(from, to).await
    }

    async fn remove_file(&self, path: &Path) -> StorageResult<()> {
        self.check(StorageOp::Remove, path)?;
        self.inner.remove_file(path).await
    }
}
