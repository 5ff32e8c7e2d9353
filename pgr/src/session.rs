//! Session file
//!
//! One JSON file per working directory records the active run for the
//! `status` subcommand. The running process holds an advisory lock on it;
//! a file whose PID no longer exists is a stale leftover from a crash and
//! counts as "no active session".

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use eyre::{Context, Result, eyre};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Persisted session record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub ticket_id: String,
    pub working_dir: PathBuf,
    pub started_at: DateTime<Utc>,
    pub pid: u32,
}

impl Session {
    /// Session file path for a working directory
    pub fn path_for(dir: &Path) -> PathBuf {
        dir.join(".programmator").join("session.json")
    }

    /// Read the session file, if present and parseable
    pub fn read(dir: &Path) -> Option<Session> {
        let path = Self::path_for(dir);
        debug!(?path, "Session::read: called");
        let content = std::fs::read_to_string(&path).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Whether the recorded PID still exists
    pub fn is_alive(&self) -> bool {
        let alive = PathBuf::from(format!("/proc/{}", self.pid)).exists();
        debug!(pid = self.pid, alive, "Session::is_alive: checked");
        alive
    }
}

/// Holds the session file and its lock for the lifetime of a run
///
/// Dropping the guard removes the file.
pub struct SessionGuard {
    path: PathBuf,
    /// Keeps the advisory lock alive
    _file: File,
}

impl SessionGuard {
    /// Create the session file, refusing when another live session holds it
    pub fn acquire(dir: &Path, ticket_id: &str) -> Result<Self> {
        let path = Session::path_for(dir);
        debug!(?path, %ticket_id, "SessionGuard::acquire: called");

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("failed to create session directory")?;
        }

        if let Some(existing) = Session::read(dir)
            && existing.is_alive()
            && existing.pid != std::process::id()
        {
            return Err(eyre!(
                "another session is already running for {} (pid {})",
                existing.ticket_id,
                existing.pid
            ));
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .context("failed to open session file")?;
        file.try_lock_exclusive()
            .map_err(|_| eyre!("session file is locked by another process"))?;

        let session = Session {
            ticket_id: ticket_id.to_string(),
            working_dir: dir.to_path_buf(),
            started_at: Utc::now(),
            pid: std::process::id(),
        };
        let json = serde_json::to_string_pretty(&session).context("failed to encode session")?;
        file.write_all(json.as_bytes()).context("failed to write session file")?;
        file.flush().context("failed to flush session file")?;

        debug!(pid = session.pid, "SessionGuard::acquire: session recorded");
        Ok(Self { path, _file: file })
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        debug!(path = ?self.path, "SessionGuard::drop: removing session file");
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_writes_session() {
        let dir = tempfile::tempdir().unwrap();
        let guard = SessionGuard::acquire(dir.path(), "T-1").unwrap();

        let session = Session::read(dir.path()).unwrap();
        assert_eq!(session.ticket_id, "T-1");
        assert_eq!(session.pid, std::process::id());
        assert!(session.is_alive());
        drop(guard);
    }

    #[test]
    fn test_drop_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let guard = SessionGuard::acquire(dir.path(), "T-1").unwrap();
        assert!(Session::path_for(dir.path()).exists());
        drop(guard);
        assert!(!Session::path_for(dir.path()).exists());
    }

    #[test]
    fn test_no_session_reads_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Session::read(dir.path()).is_none());
    }

    #[test]
    fn test_stale_pid_not_alive() {
        let session = Session {
            ticket_id: "T-1".to_string(),
            working_dir: PathBuf::from("/tmp"),
            started_at: Utc::now(),
            pid: u32::MAX - 1,
        };
        assert!(!session.is_alive());
    }

    #[test]
    fn test_stale_session_can_be_reacquired() {
        let dir = tempfile::tempdir().unwrap();
        let path = Session::path_for(dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let stale = Session {
            ticket_id: "T-old".to_string(),
            working_dir: dir.path().to_path_buf(),
            started_at: Utc::now(),
            pid: u32::MAX - 1,
        };
        std::fs::write(&path, serde_json::to_string(&stale).unwrap()).unwrap();

        let guard = SessionGuard::acquire(dir.path(), "T-new").unwrap();
        assert_eq!(Session::read(dir.path()).unwrap().ticket_id, "T-new");
        drop(guard);
    }
}
