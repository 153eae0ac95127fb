//! Exclusive deploy lock in the runs directory.
//!
//! Only guards against a second deploy started from the same machine; the
//! host itself is not locked.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;

const LOCK_FILE: &str = "deploy.lock";

/// Held for the lifetime of a run. The lock is released when dropped.
#[derive(Debug)]
pub struct DeployLock {
    file: File,
    path: PathBuf,
}

impl DeployLock {
    /// Take the lock without waiting
    pub fn acquire(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;

        let path = dir.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open lock file: {}", path.display()))?;

        if file.try_lock_exclusive().is_err() {
            anyhow::bail!(
                "Another deployment is already running (lock held on {})",
                path.display()
            );
        }

        // Owner pid, for humans inspecting a stuck lock
        file.set_len(0).context("Failed to truncate lock file")?;
        writeln!(file, "{}", std::process::id()).context("Failed to write lock file")?;

        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock explicitly
    pub fn release(self) -> Result<()> {
        FileExt::unlock(&self.file)
            .with_context(|| format!("Failed to release lock: {}", self.path.display()))
    }
}
