//! Agent status protocol
//!
//! The executor must end its output with a YAML-like block introduced by the
//! `PROGRAMMATOR_STATUS:` sentinel. Only the last block in the stream is
//! authoritative. The parser is deliberately hand-rolled: the grammar is
//! positional (two-space keys, indented list items, stop at the first
//! non-indented line) and must never fail hard — a malformed or missing
//! block degrades to a synthetic CONTINUE status upstream.

use tracing::{debug, warn};

/// Sentinel key that introduces the status block
pub const STATUS_SENTINEL: &str = "PROGRAMMATOR_STATUS:";

/// Agent-reported turn status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AgentStatus {
    /// More work remains
    #[default]
    Continue,
    /// The task is complete
    Done,
    /// The agent cannot make progress
    Blocked,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Continue => "CONTINUE",
            Self::Done => "DONE",
            Self::Blocked => "BLOCKED",
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Structured end-of-turn status reported by the executor
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedStatus {
    /// Name of the phase the agent finished this turn, if any
    pub phase_completed: Option<String>,

    /// CONTINUE | DONE | BLOCKED
    pub status: AgentStatus,

    /// Paths the agent reports as changed (trimmed, de-duplicated)
    pub files_changed: Vec<String>,

    /// Human-readable summary of the turn
    pub summary: String,

    /// Agent-supplied error text; meaningful only when BLOCKED
    pub error: Option<String>,

    /// Whether the agent committed its work this turn
    pub commit_made: bool,

    /// Raw value of an unrecognized `status:` line, kept for the warning
    /// event; the status itself fail-safes to CONTINUE
    pub unrecognized_status: Option<String>,
}

/// Split executor output into free text and the final status block
///
/// Returns the text before the last sentinel occurrence and the parsed
/// block, or the whole output and `None` when no sentinel is present.
pub fn split_output(output: &str) -> (&str, Option<ParsedStatus>) {
    debug!(output_len = output.len(), "split_output: called");
    match output.rfind(STATUS_SENTINEL) {
        Some(idx) => {
            let free_text = &output[..idx];
            let block = &output[idx..];
            debug!(block_len = block.len(), "split_output: sentinel found");
            (free_text, Some(parse_block(block)))
        }
        None => {
            debug!("split_output: no sentinel in output");
            (output, None)
        }
    }
}

/// Parse the last status block in `output`, if any
pub fn parse_last_block(output: &str) -> Option<ParsedStatus> {
    split_output(output).1
}

/// Parse one block starting at the sentinel line
///
/// Accepts `key: value` lines and `- item` list entries as long as they are
/// indented; stops at the first non-indented line or EOF. Unknown keys are
/// ignored. List items attach to the most recent list-valued key.
fn parse_block(block: &str) -> ParsedStatus {
    debug!(block_len = block.len(), "parse_block: called");
    let mut status = ParsedStatus::default();
    let mut in_files = false;

    let mut lines = block.lines();
    // Skip the sentinel line itself; anything after the colon is ignored.
    let _ = lines.next();

    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        if !line.starts_with(' ') && !line.starts_with('\t') {
            debug!(%line, "parse_block: non-indented line ends block");
            break;
        }

        let trimmed = line.trim();
        if let Some(item) = trimmed.strip_prefix("- ") {
            if in_files {
                push_file(&mut status.files_changed, item);
            } else {
                debug!(%item, "parse_block: list item outside files_changed, ignored");
            }
            continue;
        }

        let Some((key, value)) = trimmed.split_once(':') else {
            debug!(%trimmed, "parse_block: line without key, ignored");
            continue;
        };
        let key = key.trim();
        let value = unquote(value.trim());
        in_files = false;

        match key {
            "phase_completed" => {
                if !value.is_empty() && value != "null" && value != "~" {
                    status.phase_completed = Some(value.to_string());
                }
            }
            "status" => match value.to_uppercase().as_str() {
                "CONTINUE" => status.status = AgentStatus::Continue,
                "DONE" => status.status = AgentStatus::Done,
                "BLOCKED" => status.status = AgentStatus::Blocked,
                other => {
                    warn!(status = %other, "parse_block: unknown status value, treating as CONTINUE");
                    status.status = AgentStatus::Continue;
                    status.unrecognized_status = Some(other.to_string());
                }
            },
            "files_changed" => {
                in_files = true;
                // Inline form: files_changed: [] or a single path on the line
                if !value.is_empty() && value != "[]" {
                    push_file(&mut status.files_changed, value);
                }
            }
            "summary" => status.summary = value.to_string(),
            "commit_made" => status.commit_made = value.eq_ignore_ascii_case("true"),
            "error" => {
                if !value.is_empty() && value != "null" {
                    status.error = Some(value.to_string());
                }
            }
            other => {
                debug!(key = %other, "parse_block: unknown key ignored");
            }
        }
    }

    debug!(
        status = %status.status,
        files = status.files_changed.len(),
        phase = ?status.phase_completed,
        "parse_block: complete"
    );
    status
}

/// Serialize a status back into the wire grammar
///
/// Round-trip property: parsing the output of `serialize` yields a status
/// equal to the input (modulo `unrecognized_status`, which is diagnostic).
pub fn serialize(status: &ParsedStatus) -> String {
    let mut out = String::new();
    out.push_str(STATUS_SENTINEL);
    out.push('\n');
    match &status.phase_completed {
        Some(name) => out.push_str(&format!("  phase_completed: {}\n", name)),
        None => out.push_str("  phase_completed: null\n"),
    }
    out.push_str(&format!("  status: {}\n", status.status));
    if status.files_changed.is_empty() {
        out.push_str("  files_changed: []\n");
    } else {
        out.push_str("  files_changed:\n");
        for file in &status.files_changed {
            out.push_str(&format!("    - {}\n", file));
        }
    }
    out.push_str(&format!("  summary: \"{}\"\n", status.summary));
    out.push_str(&format!("  commit_made: {}\n", status.commit_made));
    if let Some(error) = &status.error {
        out.push_str(&format!("  error: \"{}\"\n", error));
    }
    out
}

/// Trim a path and append it unless already present
fn push_file(files: &mut Vec<String>, raw: &str) {
    let path = unquote(raw.trim());
    if path.is_empty() {
        return;
    }
    if !files.iter().any(|f| f == path) {
        files.push(path.to_string());
    }
}

/// Strip one layer of matching surrounding quotes
fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return &value[1..value.len() - 1];
        }
    }
    value
}
