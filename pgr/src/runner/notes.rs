//! Iteration notes
//!
//! A bounded ring of one-line summaries from recent turns, rendered into
//! the next prompt so the agent knows what already happened.

use std::collections::VecDeque;

use tracing::debug;

/// How many notes the ring keeps
const NOTE_CAP: usize = 20;

/// Ring of recent iteration notes, oldest first
#[derive(Debug, Default)]
pub struct IterationNotes {
    notes: VecDeque<String>,
}

impl IterationNotes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one turn: `[iter N] <summary> (files: a, b)` or
    /// `(no files changed)`
    pub fn record(&mut self, iteration: u32, summary: &str, files: &[String]) {
        let summary = if summary.is_empty() { "(no summary)" } else { summary };
        let files_part = if files.is_empty() {
            "(no files changed)".to_string()
        } else {
            format!("(files: {})", files.join(", "))
        };
        let note = format!("[iter {}] {} {}", iteration, summary, files_part);
        debug!(%note, "record: called");

        self.notes.push_back(note);
        while self.notes.len() > NOTE_CAP {
            self.notes.pop_front();
        }
    }

    /// Notes oldest-first for prompt rendering
    pub fn as_vec(&self) -> Vec<String> {
        self.notes.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_note_format() {
        let mut notes = IterationNotes::new();
        notes.record(1, "wrote parser", &["a.rs".to_string(), "b.rs".to_string()]);
        notes.record(2, "ran tests", &[]);

        let rendered = notes.as_vec();
        assert_eq!(rendered[0], "[iter 1] wrote parser (files: a.rs, b.rs)");
        assert_eq!(rendered[1], "[iter 2] ran tests (no files changed)");
    }

    #[test]
    fn test_empty_summary_placeholder() {
        let mut notes = IterationNotes::new();
        notes.record(3, "", &[]);
        assert_eq!(notes.as_vec()[0], "[iter 3] (no summary) (no files changed)");
    }

    #[test]
    fn test_ring_bounded_at_cap() {
        let mut notes = IterationNotes::new();
        for i in 0..(NOTE_CAP as u32 + 15) {
            notes.record(i + 1, "step", &[]);
        }
        assert_eq!(notes.len(), NOTE_CAP);
        // Oldest notes dropped; the first kept note is iteration 16.
        assert!(notes.as_vec()[0].starts_with("[iter 16]"));
    }
}
