//! Work item model
//!
//! A work item is a ticket or plan file: an id, a title, a status, and an
//! ordered list of phases (markdown checkboxes). Headings encode status,
//! top-level `- [ ]` items encode phases, and plain bullets under a
//! `## Validation` heading are validation commands.

mod source;

pub use source::{CommandTicketSource, PlanFileSource, StaticTicketSource, TicketError, TicketSource};

use tracing::debug;

/// Lifecycle status of a work item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkItemStatus {
    #[default]
    Open,
    InProgress,
    Complete,
    Blocked,
}

impl WorkItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in-progress",
            Self::Complete => "complete",
            Self::Blocked => "blocked",
        }
    }

    /// Parse a status token; unknown values default to Open
    pub fn parse(value: &str) -> Self {
        let normalized = value.trim().to_lowercase().replace(' ', "-");
        match normalized.as_str() {
            "in-progress" | "wip" => Self::InProgress,
            "complete" | "completed" | "done" | "closed" => Self::Complete,
            "blocked" => Self::Blocked,
            _ => Self::Open,
        }
    }
}

impl std::fmt::Display for WorkItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One checkbox in a work item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phase {
    pub name: String,
    pub completed: bool,
}

/// A ticket or plan with ordered phases
///
/// Flat struct; "current phase" and "all complete" are computed, never
/// cached. Re-fetched from the external source once per loop iteration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WorkItem {
    pub id: String,
    pub title: String,
    pub status: WorkItemStatus,
    pub phases: Vec<Phase>,
    /// Raw source text the item was parsed from
    pub raw: String,
    /// Shell commands that must pass before the item counts as done
    pub validation_commands: Vec<String>,
}

impl WorkItem {
    /// Build a phaseless ad-hoc item from a free-form prompt
    pub fn adhoc(id: &str, prompt: &str) -> Self {
        debug!(%id, prompt_len = prompt.len(), "WorkItem::adhoc: called");
        let title: String = prompt.lines().next().unwrap_or("").chars().take(80).collect();
        Self {
            id: id.to_string(),
            title,
            status: WorkItemStatus::Open,
            phases: Vec::new(),
            raw: prompt.to_string(),
            validation_commands: Vec::new(),
        }
    }

    /// First phase whose completed bit is false
    pub fn current_phase(&self) -> Option<&Phase> {
        self.phases.iter().find(|p| !p.completed)
    }

    /// Phases non-empty and every bit true
    pub fn all_phases_complete(&self) -> bool {
        !self.phases.is_empty() && self.phases.iter().all(|p| p.completed)
    }

    /// Number of completed phases
    pub fn completed_count(&self) -> usize {
        self.phases.iter().filter(|p| p.completed).count()
    }

    /// Mark the named phase completed; returns false when no phase matches
    pub fn complete_phase(&mut self, name: &str) -> bool {
        debug!(%name, "complete_phase: called");
        let needle = name.trim();
        for phase in &mut self.phases {
            if phase.name == needle {
                phase.completed = true;
                debug!(%needle, "complete_phase: phase marked");
                return true;
            }
        }
        debug!(%needle, "complete_phase: no matching phase");
        false
    }
}

/// Parse ticket/plan markdown into a work item
///
/// The id comes from the caller (ticket command argument or plan file
/// stem); when the first `# ` heading starts with `<id>:` the remainder
/// becomes the title.
pub fn parse_work_item(id: &str, text: &str) -> WorkItem {
    debug!(%id, text_len = text.len(), "parse_work_item: called");
    let mut item = WorkItem {
        id: id.to_string(),
        raw: text.to_string(),
        ..Default::default()
    };

    let mut in_validation = false;

    for line in text.lines() {
        if let Some(heading) = line.strip_prefix("# ") {
            if item.title.is_empty() {
                let heading = heading.trim();
                item.title = match heading.strip_prefix(id).and_then(|rest| rest.strip_prefix(':')) {
                    Some(rest) => rest.trim().to_string(),
                    None => heading.to_string(),
                };
            }
            in_validation = false;
            continue;
        }

        if let Some(heading) = line.strip_prefix("## ") {
            let heading = heading.trim();
            in_validation = heading.eq_ignore_ascii_case("validation")
                || heading.to_lowercase().starts_with("validation");
            if let Some(value) = heading.strip_prefix("Status:") {
                item.status = WorkItemStatus::parse(value);
            }
            continue;
        }

        // A `Status: x` line outside headings also counts.
        if let Some(value) = line.trim().strip_prefix("Status:")
            && !line.starts_with(' ')
        {
            item.status = WorkItemStatus::parse(value);
            continue;
        }

        // Top-level checkboxes are phases regardless of section.
        if let Some(rest) = line.strip_prefix("- [ ] ") {
            item.phases.push(Phase {
                name: rest.trim().to_string(),
                completed: false,
            });
            continue;
        }
        if let Some(rest) = line.strip_prefix("- [x] ").or_else(|| line.strip_prefix("- [X] ")) {
            item.phases.push(Phase {
                name: rest.trim().to_string(),
                completed: true,
            });
            continue;
        }

        // Plain bullets inside the validation section are commands.
        if in_validation && let Some(cmd) = line.strip_prefix("- ") {
            let cmd = cmd.trim();
            if !cmd.is_empty() {
                item.validation_commands.push(cmd.to_string());
            }
        }
    }

    debug!(
        title = %item.title,
        status = %item.status,
        phases = item.phases.len(),
        validation = item.validation_commands.len(),
        "parse_work_item: complete"
    );
    item
}
