//! Advisory lock files for cross-process read-modify-write coordination.
use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    thread,
    time::{Duration, SystemTime},
};

use anyhow::{anyhow, bail, Context, Result};

/// Removes the lock file when dropped.
#[derive(Debug)]
pub struct FileLockGuard {
    path: PathBuf,
}

impl FileLockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Attempts to take the lock once. Returns `Ok(None)` while another holder owns it.
///
/// Lock files older than `stale_after` are reclaimed (a crashed holder never
/// releases its lock). A zero `stale_after` disables reclamation.
pub fn try_acquire_file_lock(path: &Path, stale_after: Duration) -> Result<Option<FileLockGuard>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create lock directory {}", parent.display()))?;
        }
    }

    loop {
        match OpenOptions::new().create_new(true).write(true).open(path) {
            Ok(mut file) => {
                let _ = writeln!(file, "{}", std::process::id());
                return Ok(Some(FileLockGuard {
                    path: path.to_path_buf(),
                }));
            }
            Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => {
                if stale_after > Duration::ZERO && reclaim_stale_lock(path, stale_after) {
                    tracing::warn!(lock = %path.display(), "reclaimed stale lock file");
                    continue;
                }
                return Ok(None);
            }
            Err(error) => {
                return Err(anyhow!(
                    "failed to acquire lock {}: {error}",
                    path.display()
                ));
            }
        }
    }
}

/// Blocking acquisition with a wall-clock timeout.
pub fn acquire_file_lock(
    path: &Path,
    timeout: Duration,
    stale_after: Duration,
) -> Result<FileLockGuard> {
    let start = SystemTime::now();
    loop {
        if let Some(guard) = try_acquire_file_lock(path, stale_after)? {
            return Ok(guard);
        }
        let elapsed = SystemTime::now().duration_since(start).unwrap_or_default();
        if elapsed >= timeout {
            bail!("timed out acquiring lock {}", path.display());
        }
        thread::sleep(Duration::from_millis(25));
    }
}

fn reclaim_stale_lock(path: &Path, stale_after: Duration) -> bool {
    let Ok(metadata) = fs::metadata(path) else {
        return false;
    };
    let Ok(modified) = metadata.modified() else {
        return false;
    };
    let age = SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO);
    if age < stale_after {
        return false;
    }
    fs::remove_file(path).is_ok()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{acquire_file_lock, try_acquire_file_lock};

    #[test]
    fn unit_second_holder_is_refused_until_guard_drops() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("auth-profiles.json.lock");

        let first = try_acquire_file_lock(&path, Duration::from_secs(30))
            .expect("first attempt")
            .expect("first holder");
        assert!(try_acquire_file_lock(&path, Duration::from_secs(30))
            .expect("second attempt")
            .is_none());
        drop(first);
        assert!(!path.exists());
        assert!(try_acquire_file_lock(&path, Duration::from_secs(30))
            .expect("third attempt")
            .is_some());
    }

    #[test]
    fn regression_blocking_acquire_times_out_on_held_lock() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("sessions.json.lock");
        let _held = acquire_file_lock(&path, Duration::from_millis(200), Duration::ZERO)
            .expect("hold lock");
        let error = acquire_file_lock(&path, Duration::from_millis(80), Duration::ZERO)
            .expect_err("second acquire should time out");
        assert!(error.to_string().contains("timed out acquiring lock"));
    }
}
