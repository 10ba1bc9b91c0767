use std::collections::HashSet;
use std::fs::{self, File, OpenOptions, TryLockError};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Hands out named, non-blocking, single-holder locks.
pub trait LockProvider: Send + Sync {
    /// `Ok(None)` when another holder has the lock.
    fn try_acquire(&self, name: &str) -> Result<Option<LockGuard>, LockError>;
}

/// Held lock; released when dropped.
#[derive(Debug)]
pub struct LockGuard {
    name: String,
    held: Held,
}

#[derive(Debug)]
enum Held {
    File(File),
    Memory(Arc<Mutex<HashSet<String>>>),
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match &self.held {
            Held::File(file) => {
                let _ = file.unlock();
            }
            Held::Memory(held) => {
                held.lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .remove(&self.name);
            }
        }
        debug!(lock = %self.name, "lock released");
    }
}

/// Advisory file locks under one directory. The OS drops them if the process dies.
#[derive(Debug, Clone)]
pub struct FileLockProvider {
    dir: PathBuf,
}

impl FileLockProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.lock"))
    }
}

impl LockProvider for FileLockProvider {
    fn try_acquire(&self, name: &str) -> Result<Option<LockGuard>, LockError> {
        let path = self.path_for(name);
        let io_err = |source| LockError::Io {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(&self.dir).map_err(io_err)?;
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(io_err)?;

        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => return Ok(None),
            Err(TryLockError::Error(err)) => return Err(io_err(err)),
        }

        file.set_len(0).map_err(io_err)?;
        writeln!(file, "{}", std::process::id()).map_err(io_err)?;
        debug!(lock = name, path = %path.display(), "lock acquired");

        Ok(Some(LockGuard {
            name: name.to_string(),
            held: Held::File(file),
        }))
    }
}

/// In-process locks for tests and single-binary setups.
#[derive(Debug, Clone, Default)]
pub struct MemoryLockProvider {
    held: Arc<Mutex<HashSet<String>>>,
}

impl MemoryLockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, name: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(name)
    }
}

impl LockProvider for MemoryLockProvider {
    fn try_acquire(&self, name: &str) -> Result<Option<LockGuard>, LockError> {
        let mut held = self
            .held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !held.insert(name.to_string()) {
            return Ok(None);
        }
        Ok(Some(LockGuard {
            name: name.to_string(),
            held: Held::Memory(self.held.clone()),
        }))
    }
}
