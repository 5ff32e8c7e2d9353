//! Output demultiplexer
//!
//! Classifies the executor's raw output stream into writer events. This is
//! the only place that distinguishes a partial line from a complete one;
//! everything downstream treats events as whole values.
//!
//! Classification is conservative: diff events only inside a frame opened
//! by a recognizable diff header or hunk line, tool/review events only on
//! exact configured prefixes, and anything uncertain streams through as
//! plain text.

use regex::Regex;
use tracing::debug;

use crate::term::Event;

/// A partial line longer than this streams out instead of waiting for its
/// newline, giving up classification for that line.
const LINE_HOLD_MAX: usize = 2048;

/// Recognized line prefixes; configuration, not contract
#[derive(Debug, Clone)]
pub struct DemuxRules {
    pub tool_use_prefixes: Vec<String>,
    pub tool_result_prefixes: Vec<String>,
    pub review_prefix: String,
}

impl Default for DemuxRules {
    fn default() -> Self {
        Self {
            tool_use_prefixes: vec!["[TOOL] ".to_string(), "\u{23fa} ".to_string()],
            tool_result_prefixes: vec!["[RESULT] ".to_string()],
            review_prefix: "[REVIEW]".to_string(),
        }
    }
}

/// Streaming line classifier
pub struct OutputDemux {
    rules: DemuxRules,
    hunk_re: Regex,
    /// Inside a diff frame: +/-/space lines classify as diff events
    in_diff: bool,
    /// Start of the current line, held until its newline arrives
    pending: String,
    /// The current line's prefix already streamed out unclassified
    mid_line: bool,
}

impl OutputDemux {
    pub fn new(rules: DemuxRules) -> Self {
        Self {
            rules,
            hunk_re: Regex::new(r"^@@ .*@@").expect("hunk pattern compiles"),
            in_diff: false,
            pending: String::new(),
            mid_line: false,
        }
    }

    /// Feed one raw chunk, emitting events through the sink
    pub fn feed(&mut self, chunk: &str, sink: &mut dyn FnMut(Event)) {
        let mut data = std::mem::take(&mut self.pending);
        data.push_str(chunk);

        // Finish a line whose beginning was already streamed unclassified.
        if self.mid_line {
            match data.find('\n') {
                Some(pos) => {
                    sink(Event::StreamingText(data[..=pos].to_string()));
                    self.mid_line = false;
                    data.drain(..=pos);
                }
                None => {
                    if !data.is_empty() {
                        sink(Event::StreamingText(data));
                    }
                    return;
                }
            }
        }

        while let Some(pos) = data.find('\n') {
            let line: String = data.drain(..=pos).collect();
            self.classify(line.trim_end_matches('\n'), sink);
        }

        if data.len() > LINE_HOLD_MAX {
            debug!(len = data.len(), "feed: long partial line, streaming unclassified");
            sink(Event::StreamingText(data));
            self.mid_line = true;
        } else {
            self.pending = data;
        }
    }

    /// Flush any held partial line as plain text
    pub fn flush(&mut self, sink: &mut dyn FnMut(Event)) {
        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            sink(Event::StreamingText(format!("{}\n", rest)));
        }
        self.mid_line = false;
        self.in_diff = false;
    }

    /// Classify one complete line
    fn classify(&mut self, line: &str, sink: &mut dyn FnMut(Event)) {
        if self.in_diff {
            if self.hunk_re.is_match(line) {
                sink(Event::DiffHunk(line.to_string()));
                return;
            }
            if let Some(event) = diff_body_event(line) {
                sink(event);
                return;
            }
            // Anything else closes the frame.
            self.in_diff = false;
        }

        if self.hunk_re.is_match(line) {
            self.in_diff = true;
            sink(Event::DiffHunk(line.to_string()));
            return;
        }
        if line.starts_with("diff --git ") || line.starts_with("+++ ") || line.starts_with("--- ") {
            self.in_diff = true;
            sink(Event::DiffCtx(line.to_string()));
            return;
        }
        if line.starts_with(&self.rules.review_prefix) {
            sink(Event::Review(line.to_string()));
            return;
        }
        for prefix in &self.rules.tool_use_prefixes {
            if line.starts_with(prefix.as_str()) {
                sink(Event::ToolUse(line.to_string()));
                return;
            }
        }
        for prefix in &self.rules.tool_result_prefixes {
            if line.starts_with(prefix.as_str()) {
                sink(Event::ToolResult(line.to_string()));
                return;
            }
        }
        if line.starts_with('#') && line.trim_start_matches('#').starts_with(' ') {
            sink(Event::Markdown(line.to_string()));
            return;
        }

        sink(Event::StreamingText(format!("{}\n", line)));
    }
}

/// Diff-frame body classification for +/-/space lines
fn diff_body_event(line: &str) -> Option<Event> {
    if line.starts_with("+++ ") || line.starts_with("--- ") || line.starts_with("diff --git ") {
        return Some(Event::DiffCtx(line.to_string()));
    }
    match line.as_bytes().first() {
        Some(b'+') => Some(Event::DiffAdd(line.to_string())),
        Some(b'-') => Some(Event::DiffDel(line.to_string())),
        Some(b' ') => Some(Event::DiffCtx(line.to_string())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(chunks: &[&str]) -> Vec<Event> {
        let mut demux = OutputDemux::new(DemuxRules::default());
        let mut events = Vec::new();
        for chunk in chunks {
            demux.feed(chunk, &mut |e| events.push(e));
        }
        demux.flush(&mut |e| events.push(e));
        events
    }

    #[test]
    fn test_plain_lines_stream() {
        let events = collect(&["thinking about it\n"]);
        assert_eq!(events, vec![Event::StreamingText("thinking about it\n".to_string())]);
    }

    #[test]
    fn test_diff_frame_classification() {
        let events = collect(&[
            "diff --git a/a.rs b/a.rs\n",
            "--- a/a.rs\n",
            "+++ b/a.rs\n",
            "@@ -1,3 +1,4 @@\n",
            "+added line\n",
            "-removed line\n",
            " context line\n",
            "back to prose\n",
        ]);

        assert_eq!(events[0], Event::DiffCtx("diff --git a/a.rs b/a.rs".to_string()));
        assert_eq!(events[3], Event::DiffHunk("@@ -1,3 +1,4 @@".to_string()));
        assert_eq!(events[4], Event::DiffAdd("+added line".to_string()));
        assert_eq!(events[5], Event::DiffDel("-removed line".to_string()));
        assert_eq!(events[6], Event::DiffCtx(" context line".to_string()));
        assert_eq!(events[7], Event::StreamingText("back to prose\n".to_string()));
    }

    #[test]
    fn test_plus_line_outside_frame_is_text() {
        let events = collect(&["+not a diff\n"]);
        assert_eq!(events, vec![Event::StreamingText("+not a diff\n".to_string())]);
    }

    #[test]
    fn test_tool_and_review_prefixes() {
        let events = collect(&["[TOOL] reading src/a.rs\n", "[RESULT] 120 lines\n", "[REVIEW] agent bugs started\n"]);
        assert_eq!(events[0], Event::ToolUse("[TOOL] reading src/a.rs".to_string()));
        assert_eq!(events[1], Event::ToolResult("[RESULT] 120 lines".to_string()));
        assert_eq!(events[2], Event::Review("[REVIEW] agent bugs started".to_string()));
    }

    #[test]
    fn test_line_split_across_chunks_classified_once() {
        let events = collect(&["[TOOL] read", "ing file\n"]);
        assert_eq!(events, vec![Event::ToolUse("[TOOL] reading file".to_string())]);
    }

    #[test]
    fn test_markdown_heading() {
        let events = collect(&["## Plan\n"]);
        assert_eq!(events, vec![Event::Markdown("## Plan".to_string())]);
    }

    #[test]
    fn test_flush_emits_trailing_partial() {
        let events = collect(&["no newline at end"]);
        assert_eq!(events, vec![Event::StreamingText("no newline at end\n".to_string())]);
    }

    #[test]
    fn test_long_partial_line_streams_unclassified() {
        let long = "x".repeat(LINE_HOLD_MAX + 10);
        let mut demux = OutputDemux::new(DemuxRules::default());
        let mut events = Vec::new();
        demux.feed(&long, &mut |e| events.push(e));
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], Event::StreamingText(t) if t.len() == long.len()));

        // The rest of the line stays unclassified plain text.
        events.clear();
        demux.feed("[TOOL] tail\n", &mut |e| events.push(e));
        assert_eq!(events, vec![Event::StreamingText("[TOOL] tail\n".to_string())]);
    }

    #[test]
    fn test_hunk_opens_frame_without_header() {
        let events = collect(&["@@ -10,2 +10,3 @@ fn main\n", "+new\n"]);
        assert_eq!(events[0], Event::DiffHunk("@@ -10,2 +10,3 @@ fn main".to_string()));
        assert_eq!(events[1], Event::DiffAdd("+new".to_string()));
    }
}
