use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;
use tracing::{debug, info, warn};

use crate::constants::PID_FILE_NAME;
use crate::error::VirbyError;

/// How long an orphan gets to react to SIGTERM before SIGKILL.
const ORPHAN_TERM_GRACE: Duration = Duration::from_millis(500);

pub fn pid_file_path(working_dir: &Path) -> PathBuf {
    working_dir.join(PID_FILE_NAME)
}

/// The live supervisor's claim on the working directory.
///
/// The PID is written atomically (tempfile, fsync, rename) and the resulting
/// file holds an exclusive advisory lock for as long as this value lives.
/// Orphan cleanup in a later process probes with a shared non-blocking lock:
/// probe failure means a live owner, probe success means the file is a
/// leftover that may be cleaned.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    // Held for the lock; the lock dies with the handle.
    _lock: File,
}

impl PidFile {
    /// Durably record `pid` in `<working_dir>/vfkit.pid` and lock it.
    pub fn write(working_dir: &Path, pid: u32) -> Result<Self, VirbyError> {
        let path = pid_file_path(working_dir);
        let mut tmp = tempfile::NamedTempFile::new_in(working_dir).map_err(|e| {
            VirbyError::Startup(format!(
                "failed to create PID tempfile in {}: {e}",
                working_dir.display()
            ))
        })?;
        tmp.write_all(format!("{pid}\n").as_bytes())
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(|e| VirbyError::Startup(format!("failed to write PID file: {e}")))?;

        let file = tmp.persist(&path).map_err(|e| {
            VirbyError::Startup(format!("failed to persist PID file {}: {e}", path.display()))
        })?;
        file.try_lock_exclusive().map_err(|e| {
            VirbyError::Startup(format!("failed to lock PID file {}: {e}", path.display()))
        })?;

        debug!(pid, path = %path.display(), "PID file written");
        Ok(Self { path, _lock: file })
    }

    /// Remove the PID file and release the lock.
    pub fn remove(self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove PID file");
        }
    }
}

/// True when `pid` names a live process (EPERM still means alive).
fn process_alive(pid: i32) -> bool {
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

fn send_signal(pid: i32, signal: libc::c_int) {
    if unsafe { libc::kill(pid, signal) } != 0 {
        debug!(pid, signal, error = %std::io::Error::last_os_error(), "kill failed");
    }
}

/// Terminate any vfkit process left over by a prior unclean shutdown.
///
/// Runs once at process entry. A PID file locked by a live supervisor is
/// left untouched; otherwise the named process (if alive) gets SIGTERM, a
/// short grace period, then SIGKILL, and the file is removed. Repeated
/// invocations after a successful pass are no-ops.
pub async fn cleanup_orphans(working_dir: &Path) -> Result<(), VirbyError> {
    let path = pid_file_path(working_dir);

    let file = match File::open(&path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no PID file, nothing to clean up");
            return Ok(());
        }
        Err(e) => {
            return Err(VirbyError::Startup(format!(
                "failed to open PID file {}: {e}",
                path.display()
            )));
        }
    };

    if file.try_lock_shared().is_err() {
        debug!(path = %path.display(), "PID file locked by an active supervisor, leaving it");
        return Ok(());
    }

    let content = std::fs::read_to_string(&path).map_err(|e| {
        VirbyError::Startup(format!("failed to read PID file {}: {e}", path.display()))
    })?;

    match content.trim().parse::<i32>() {
        Ok(pid) if pid > 0 => {
            if process_alive(pid) {
                info!(pid, "terminating orphaned vfkit process");
                send_signal(pid, libc::SIGTERM);
                tokio::time::sleep(ORPHAN_TERM_GRACE).await;
                if process_alive(pid) {
                    warn!(pid, "orphan survived SIGTERM, sending SIGKILL");
                    send_signal(pid, libc::SIGKILL);
                }
            } else {
                debug!(pid, "stale PID file references no live process");
            }
        }
        _ => warn!(path = %path.display(), "malformed PID file, removing"),
    }

    if let Err(e) = std::fs::remove_file(&path) {
        warn!(path = %path.display(), error = %e, "failed to remove stale PID file");
    }
    let _ = FileExt::unlock(&file);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_then_remove() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = PidFile::write(dir.path(), 4242).unwrap();

        let path = pid_file_path(dir.path());
        assert_eq!(std::fs::read_to_string(&path).unwrap().trim(), "4242");

        pid_file.remove();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_live_lock_blocks_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let _pid_file = PidFile::write(dir.path(), std::process::id()).unwrap();

        cleanup_orphans(dir.path()).await.unwrap();
        // Locked by "a live supervisor" (us): the file must survive.
        assert!(pid_file_path(dir.path()).exists());
    }

    #[tokio::test]
    async fn test_cleanup_removes_stale_pid_without_signalling() {
        let dir = tempfile::tempdir().unwrap();
        // A PID close to the upper bound will not name a live process.
        std::fs::write(pid_file_path(dir.path()), "2147483646\n").unwrap();

        cleanup_orphans(dir.path()).await.unwrap();
        assert!(!pid_file_path(dir.path()).exists());
    }

    #[tokio::test]
    async fn test_cleanup_removes_malformed_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(pid_file_path(dir.path()), "not-a-pid\n").unwrap();

        cleanup_orphans(dir.path()).await.unwrap();
        assert!(!pid_file_path(dir.path()).exists());
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(pid_file_path(dir.path()), "2147483646\n").unwrap();

        cleanup_orphans(dir.path()).await.unwrap();
        cleanup_orphans(dir.path()).await.unwrap();
        assert!(!pid_file_path(dir.path()).exists());
    }

    #[tokio::test]
    async fn test_cleanup_terminates_live_orphan() {
        let dir = tempfile::tempdir().unwrap();
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        std::fs::write(pid_file_path(dir.path()), format!("{}\n", child.id())).unwrap();

        cleanup_orphans(dir.path()).await.unwrap();
        assert!(!pid_file_path(dir.path()).exists());

        // SIGTERM lands well within the cleanup grace period.
        let status = child.wait().unwrap();
        assert!(!status.success());
    }
}
