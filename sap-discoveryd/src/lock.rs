use std::fs::{File, OpenOptions, TryLockError};
use std::path::Path;
use anyhow::{Context, Result};

pub const LOCK_FILE_NAME: &str = "discovery.lock";

/// Exclusive advisory lock held for the lifetime of the daemon. The kernel
/// releases it when the file is closed.
#[derive(Debug)]
pub struct InstanceLock {
    _file: File,
}

impl InstanceLock {
    pub fn acquire(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create working directory: {}", dir.display()))?;

        let path = dir.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("Failed to open lock file: {}", path.display()))?;

        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => {
                anyhow::bail!("another sap-discoveryd instance is already running");
            }
            Err(TryLockError::Error(e)) => {
                return Err(e).with_context(|| format!("Failed to lock {}", path.display()));
            }
        }

        tracing::debug!("Holding instance lock {}", path.display());
        Ok(Self { _file: file })
    }
}
