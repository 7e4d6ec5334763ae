//! Cross-process exclusion for one data directory.
//!
//! A wake session, a sleep cycle and an index run all write the vector
//! store and the episodic log, so at most one of them may run against a
//! data directory at a time. Each holds an exclusive advisory lock on
//! `<data_dir>/mem.lock` for as long as it runs. A second writer fails
//! immediately and names the holder's pid. Read-only commands (`recall`,
//! `stats`) do not take the lock.
//!
//! The lock belongs to the open file, so the OS releases it if the
//! process dies.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use tracing::debug;

pub const LOCK_FILE: &str = "mem.lock";

#[derive(Debug)]
pub struct DataDirLock {
    file: File,
    path: PathBuf,
}

impl DataDirLock {
    /// Take the lock on `data_dir`, which must exist.
    pub fn acquire(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() {
                let mut holder = String::new();
                let _ = file.read_to_string(&mut holder);
                let holder = match holder.trim() {
                    "" => String::new(),
                    pid => format!(" (pid {})", pid),
                };
                bail!(
                    "{} is in use by another mem process{}; end that session before running this command",
                    data_dir.display(),
                    holder
                );
            }
            return Err(e).with_context(|| format!("Failed to lock {}", path.display()));
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        write!(file, "{}", std::process::id())?;
        file.sync_data()?;
        debug!(path = %path.display(), "data directory locked");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DataDirLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            debug!(path = %self.path.display(), error = %e, "failed to release data directory lock");
        }
    }
}
