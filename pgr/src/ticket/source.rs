//! Ticket sources
//!
//! A [`TicketSource`] produces the latest work-item content once per loop
//! iteration. The runner trusts whatever the latest fetch says, including a
//! phase flipping back to uncompleted.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use super::{WorkItem, parse_work_item};

/// Errors from fetching or updating a work item
#[derive(Debug, Error)]
pub enum TicketError {
    #[error("ticket command failed (exit {code}): {stderr}")]
    CommandFailed { code: i32, stderr: String },

    #[error("failed to run ticket command '{command}': {source}")]
    CommandUnavailable {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read plan file {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("ticket output was empty")]
    Empty,
}

/// Provider of work-item content
#[async_trait]
pub trait TicketSource: Send + Sync {
    /// Fetch the latest work-item state
    async fn fetch(&self) -> Result<WorkItem, TicketError>;

    /// Persist a phase completion back to the source, where supported
    ///
    /// Command-backed tickets are updated by the external system, so the
    /// default is a no-op; plan files rewrite their checkbox.
    async fn mark_phase_complete(&self, _phase: &str) -> Result<(), TicketError> {
        Ok(())
    }

    /// Human-readable description for logs and the footer
    fn describe(&self) -> String;
}

/// Ticket content fetched by running an external command with the item id
///
/// The configured command may carry arguments ("tickets show"); it is split
/// on whitespace and the id appended as the final argument.
pub struct CommandTicketSource {
    command: String,
    id: String,
    working_dir: PathBuf,
}

impl CommandTicketSource {
    pub fn new(command: &str, id: &str, working_dir: &Path) -> Self {
        debug!(%command, %id, ?working_dir, "CommandTicketSource::new: called");
        Self {
            command: command.to_string(),
            id: id.to_string(),
            working_dir: working_dir.to_path_buf(),
        }
    }
}

#[async_trait]
impl TicketSource for CommandTicketSource {
    async fn fetch(&self) -> Result<WorkItem, TicketError> {
        debug!(command = %self.command, id = %self.id, "CommandTicketSource::fetch: called");
        let mut parts = self.command.split_whitespace();
        let program = parts.next().ok_or(TicketError::Empty)?;

        let output = tokio::process::Command::new(program)
            .args(parts)
            .arg(&self.id)
            .current_dir(&self.working_dir)
            .output()
            .await
            .map_err(|source| TicketError::CommandUnavailable {
                command: self.command.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(id = %self.id, %stderr, "CommandTicketSource::fetch: command failed");
            return Err(TicketError::CommandFailed {
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        let text = String::from_utf8_lossy(&output.stdout).to_string();
        if text.trim().is_empty() {
            debug!(id = %self.id, "CommandTicketSource::fetch: empty output");
            return Err(TicketError::Empty);
        }

        Ok(parse_work_item(&self.id, &text))
    }

    fn describe(&self) -> String {
        format!("ticket {} (via `{}`)", self.id, self.command)
    }
}

/// Plan file loaded from a path; the id is the file stem
pub struct PlanFileSource {
    path: PathBuf,
    id: String,
}

impl PlanFileSource {
    pub fn new(path: &Path) -> Self {
        let id = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "plan".to_string());
        debug!(?path, %id, "PlanFileSource::new: called");
        Self {
            path: path.to_path_buf(),
            id,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TicketSource for PlanFileSource {
    async fn fetch(&self) -> Result<WorkItem, TicketError> {
        debug!(path = ?self.path, "PlanFileSource::fetch: called");
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| TicketError::Unreadable {
                path: self.path.clone(),
                source,
            })?;
        Ok(parse_work_item(&self.id, &text))
    }

    /// Rewrite the phase's checkbox from `- [ ]` to `- [x]` in place
    async fn mark_phase_complete(&self, phase: &str) -> Result<(), TicketError> {
        debug!(path = ?self.path, %phase, "PlanFileSource::mark_phase_complete: called");
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| TicketError::Unreadable {
                path: self.path.clone(),
                source,
            })?;

        let needle = format!("- [ ] {}", phase.trim());
        let replacement = format!("- [x] {}", phase.trim());
        let rewritten = text.replacen(&needle, &replacement, 1);
        if rewritten == text {
            debug!(%phase, "PlanFileSource::mark_phase_complete: checkbox not found");
            return Ok(());
        }

        tokio::fs::write(&self.path, rewritten)
            .await
            .map_err(|source| TicketError::Unreadable {
                path: self.path.clone(),
                source,
            })?;
        debug!(%phase, "PlanFileSource::mark_phase_complete: checkbox rewritten");
        Ok(())
    }

    fn describe(&self) -> String {
        format!("plan {}", self.path.display())
    }
}

/// Fixed in-memory work item, used for ad-hoc `run` prompts and tests
pub struct StaticTicketSource {
    item: std::sync::Mutex<WorkItem>,
}

impl StaticTicketSource {
    pub fn new(item: WorkItem) -> Self {
        Self {
            item: std::sync::Mutex::new(item),
        }
    }
}

#[async_trait]
impl TicketSource for StaticTicketSource {
    async fn fetch(&self) -> Result<WorkItem, TicketError> {
        Ok(self.item.lock().expect("static ticket lock").clone())
    }

    async fn mark_phase_complete(&self, phase: &str) -> Result<(), TicketError> {
        self.item.lock().expect("static ticket lock").complete_phase(phase);
        Ok(())
    }

    fn describe(&self) -> String {
        let item = self.item.lock().expect("static ticket lock");
        format!("ad-hoc {}", item.id)
    }
}
