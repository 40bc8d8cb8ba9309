use fs2::FileExt;
use std::{
    ffi::OsString,
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
    thread,
    time::Duration,
};
use tracing::{debug, trace};

#[cfg(not(test))]
const MAX_ATTEMPTS: u32 = 200; // ~10 seconds at 50ms
#[cfg(test)]
const MAX_ATTEMPTS: u32 = 4;
const BACKOFF: Duration = Duration::from_millis(50);

/// Exclusive advisory lock on `<target>.lock`, held for one read-modify-write
/// of the target spreadsheet. Released on drop; the lock file itself is kept
/// so every writer locks the same inode.
pub struct MergeLock {
    file: File,
    path: PathBuf,
}

/// Sidecar lock path for a spreadsheet: `out.xlsx` → `out.xlsx.lock`.
pub fn lock_path(target: &Path) -> PathBuf {
    let mut name: OsString = target.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

impl MergeLock {
    /// Block (with bounded retry) until the lock for `target` is ours.
    pub fn acquire(target: &Path) -> io::Result<Self> {
        let path = lock_path(target);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let mut attempts = 0;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if attempts >= MAX_ATTEMPTS {
                        return Err(io::Error::new(
                            io::ErrorKind::WouldBlock,
                            format!("{} is held by another writer", path.display()),
                        ));
                    }
                    attempts += 1;
                    trace!(attempts, lock = %path.display(), "waiting for merge lock");
                    thread::sleep(BACKOFF);
                }
                Err(err) => return Err(err),
            }
        }

        debug!(lock = %path.display(), "merge lock acquired");
        Ok(Self { file, path })
    }

    /// Non-blocking variant: `None` when another writer holds the lock.
    pub fn try_acquire(target: &Path) -> io::Result<Option<Self>> {
        let path = lock_path(target);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { file, path })),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err),
        }
    }
}

impl Drop for MergeLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        trace!(lock = %self.path.display(), "merge lock released");
    }
}
