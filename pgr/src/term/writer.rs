//! Sticky-footer terminal writer
//!
//! Interleaves streamed child-process output with a persistent status
//! footer. Three modes:
//!
//! - plain: non-TTY. Text only, no footer, no escape sequences.
//! - legacy: TTY with unknown height. Line-oriented writes; the footer is
//!   erased and reprinted below the latest output.
//! - viewport: TTY with known width and height. Full-frame redraw on every
//!   event with the footer at absolute positions.
//!
//! Every exported method takes one writer-level lock, so events and footer
//! updates are totally ordered. Inbound text is sanitized (ANSI stripped,
//! control bytes dropped, `\r`/`\r\n` normalized, tabs expanded) before it
//! reaches the frame state. A write error on the underlying stream marks
//! the writer failed; it drops further output and never panics.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::Mutex;

use crossterm::style::Stylize;
use crossterm::{cursor, queue, style, terminal};
use tracing::debug;
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use super::Event;

/// Bounded row history; oldest rows beyond this are dropped.
const HISTORY_CAP: usize = 6000;

/// Flush threshold for a partial line when no terminal width is known.
const MAX_UNBOUNDED_LINE: usize = 4096;

/// Rendering mode, chosen at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Non-TTY output: plain text, no footer
    Plain,
    /// TTY with unknown height; footer erase/reprint, at most `max_footer` lines
    Legacy { max_footer: usize },
    /// TTY with known dimensions; full-frame redraws
    Viewport { width: u16, height: u16 },
}

/// Snapshot of orchestrator state for the footer
///
/// Always a copy, never a live reference: the process-stats ticker redraws
/// the footer from a different task than the loop.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FooterSnapshot {
    pub item_id: String,
    pub iteration: u32,
    pub max_iterations: u32,
    pub stagnation: u32,
    pub stagnation_limit: u32,
    pub files_changed: usize,
    pub current_phase: Option<String>,
    pub phases_done: usize,
    pub phases_total: usize,
}

/// Kind tag for a completed row, used for styling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowKind {
    Prog,
    ToolUse,
    ToolResult,
    Review,
    DiffAdd,
    DiffDel,
    DiffCtx,
    DiffHunk,
    Markdown,
    Separator,
    Text,
}

#[derive(Debug, Clone)]
struct Row {
    kind: RowKind,
    text: String,
}

struct WriterInner {
    out: Box<dyn Write + Send>,
    mode: Mode,
    /// Completed rows, oldest first, capped at [`HISTORY_CAP`]
    frame_rows: VecDeque<Row>,
    /// The row currently being streamed into
    frame_current: String,
    /// Rows completed since the last incremental render (plain/legacy)
    pending: Vec<Row>,
    footer_lines: Vec<String>,
    /// Footer lines currently on screen in legacy mode
    footer_drawn: usize,
    last_snapshot: Option<FooterSnapshot>,
    pid: Option<u32>,
    mem_kb: Option<u64>,
    closed: bool,
    failed: bool,
}

/// Concurrent sticky-footer renderer
pub struct TermWriter {
    inner: Mutex<WriterInner>,
}

impl TermWriter {
    /// Construct with an explicit output stream and mode
    pub fn with_output(out: Box<dyn Write + Send>, mode: Mode) -> Self {
        debug!(?mode, "TermWriter::with_output: called");
        Self {
            inner: Mutex::new(WriterInner {
                out,
                mode,
                frame_rows: VecDeque::new(),
                frame_current: String::new(),
                pending: Vec::new(),
                footer_lines: Vec::new(),
                footer_drawn: 0,
                last_snapshot: None,
                pid: None,
                mem_kb: None,
                closed: false,
                failed: false,
            }),
        }
    }

    /// Construct on stdout, picking the mode from the terminal
    ///
    /// Non-TTY gets plain mode; a TTY with unknown size or height ≤ 1
    /// degrades to legacy mode (one footer line when height ≤ 1).
    pub fn stdout() -> Self {
        use crossterm::tty::IsTty;

        let out = std::io::stdout();
        let mode = if !out.is_tty() {
            debug!("TermWriter::stdout: not a tty, plain mode");
            Mode::Plain
        } else {
            match terminal::size() {
                Ok((width, height)) if height > 1 && width > 0 => {
                    debug!(width, height, "TermWriter::stdout: viewport mode");
                    Mode::Viewport { width, height }
                }
                Ok((_, height)) => {
                    debug!(height, "TermWriter::stdout: degenerate height, legacy mode");
                    Mode::Legacy { max_footer: 1 }
                }
                Err(e) => {
                    debug!(error = %e, "TermWriter::stdout: size unknown, legacy mode");
                    Mode::Legacy { max_footer: 4 }
                }
            }
        };
        Self::with_output(Box::new(std::io::stdout()), mode)
    }

    /// Route one classified event into the frame
    pub fn handle(&self, event: Event) {
        let mut inner = self.inner.lock().expect("writer lock");
        if inner.closed || inner.failed {
            return;
        }

        let text = sanitize(event.text());
        match &event {
            Event::StreamingText(_) => inner.stream_text(&text),
            _ => inner.push_structured(kind_of(&event), &text),
        }

        if let Err(e) = inner.render() {
            debug!(error = %e, "handle: write error, disabling output");
            inner.failed = true;
        }
    }

    /// Recompute and redraw the footer from a state snapshot
    pub fn update_footer(&self, snapshot: FooterSnapshot) {
        let mut inner = self.inner.lock().expect("writer lock");
        if inner.closed || inner.failed {
            return;
        }
        inner.last_snapshot = Some(snapshot);
        inner.recompute_footer();
        if let Err(e) = inner.render_footer_only() {
            debug!(error = %e, "update_footer: write error, disabling output");
            inner.failed = true;
        }
    }

    /// Record executor process stats and refresh the footer
    ///
    /// Called from the invoker's stats ticker; uses the last stored
    /// snapshot, never live orchestrator state.
    pub fn set_process_stats(&self, pid: u32, mem_kb: u64) {
        let mut inner = self.inner.lock().expect("writer lock");
        if inner.closed || inner.failed {
            return;
        }
        inner.pid = Some(pid);
        inner.mem_kb = Some(mem_kb);
        if inner.last_snapshot.is_some() {
            inner.recompute_footer();
            if let Err(e) = inner.render_footer_only() {
                debug!(error = %e, "set_process_stats: write error, disabling output");
                inner.failed = true;
            }
        }
    }

    /// Blank the footer region and close the writer
    ///
    /// Subsequent events are dropped. Always called on the loop's return
    /// path.
    pub fn clear_footer(&self) {
        let mut inner = self.inner.lock().expect("writer lock");
        if inner.closed {
            return;
        }
        if !inner.failed {
            let _ = inner.flush_current_row();
            let _ = inner.render();
            let _ = inner.erase_footer();
        }
        inner.closed = true;
        debug!("clear_footer: writer closed");
    }

    #[cfg(test)]
    pub(crate) fn rows_len(&self) -> usize {
        self.inner.lock().expect("writer lock").frame_rows.len()
    }

    #[cfg(test)]
    pub(crate) fn current_text(&self) -> String {
        self.inner.lock().expect("writer lock").frame_current.clone()
    }

    #[cfg(test)]
    pub(crate) fn footer_len(&self) -> usize {
        self.inner.lock().expect("writer lock").footer_lines.len()
    }
}

impl WriterInner {
    /// Append streamed runes; newlines and width overflow flush rows
    fn stream_text(&mut self, text: &str) {
        for ch in text.chars() {
            if ch == '\n' {
                self.complete_row(RowKind::Text);
                continue;
            }
            self.frame_current.push(ch);
            match self.mode {
                Mode::Viewport { width, .. } => {
                    while UnicodeWidthStr::width(self.frame_current.as_str()) >= width as usize {
                        let (head, tail) = split_at_width(&self.frame_current, width as usize);
                        let tail = tail.to_string();
                        let head = head.to_string();
                        self.push_row(Row {
                            kind: RowKind::Text,
                            text: head,
                        });
                        self.frame_current = tail;
                    }
                }
                _ => {
                    if self.frame_current.len() >= MAX_UNBOUNDED_LINE {
                        self.complete_row(RowKind::Text);
                    }
                }
            }
        }
    }

    /// Push a structured event: flush the in-flight row, add the formatted
    /// line(s), then an empty trailing row so streaming resumes fresh
    fn push_structured(&mut self, kind: RowKind, text: &str) {
        if !self.frame_current.is_empty() {
            self.complete_row(RowKind::Text);
        }
        let width = match self.mode {
            Mode::Viewport { width, .. } => width as usize,
            _ => usize::MAX,
        };
        for line in text.split('\n') {
            for wrapped in wrap_width(line, width) {
                self.push_row(Row {
                    kind,
                    text: wrapped,
                });
            }
        }
        self.push_row(Row {
            kind: RowKind::Text,
            text: String::new(),
        });
    }

    fn complete_row(&mut self, kind: RowKind) {
        let text = std::mem::take(&mut self.frame_current);
        self.push_row(Row { kind, text });
    }

    fn push_row(&mut self, row: Row) {
        self.pending.push(row.clone());
        self.frame_rows.push_back(row);
        while self.frame_rows.len() > HISTORY_CAP {
            self.frame_rows.pop_front();
        }
    }

    fn flush_current_row(&mut self) -> std::io::Result<()> {
        if !self.frame_current.is_empty() {
            self.complete_row(RowKind::Text);
        }
        Ok(())
    }

    /// Render after an event
    fn render(&mut self) -> std::io::Result<()> {
        match self.mode {
            Mode::Plain => self.render_plain(),
            Mode::Legacy { .. } => self.render_legacy(),
            Mode::Viewport { .. } => self.render_viewport(),
        }
    }

    /// Footer-only refresh (no new content rows)
    fn render_footer_only(&mut self) -> std::io::Result<()> {
        match self.mode {
            Mode::Plain => Ok(()),
            Mode::Legacy { .. } => self.render_legacy(),
            Mode::Viewport { .. } => self.render_viewport(),
        }
    }

    /// Plain mode: completed rows become plain lines, nothing else
    fn render_plain(&mut self) -> std::io::Result<()> {
        let rows = std::mem::take(&mut self.pending);
        for row in rows {
            self.out.write_all(row.text.as_bytes())?;
            self.out.write_all(b"\n")?;
        }
        self.out.flush()
    }

    /// Legacy mode: erase the footer, write new rows, reprint the footer
    fn render_legacy(&mut self) -> std::io::Result<()> {
        self.erase_footer()?;
        let rows = std::mem::take(&mut self.pending);
        for row in rows {
            let styled = style_row(row.kind, &row.text);
            queue!(self.out, style::PrintStyledContent(styled), style::Print("\n"))?;
        }
        for line in self.footer_lines.clone() {
            queue!(
                self.out,
                style::PrintStyledContent(line.dark_grey()),
                style::Print("\n")
            )?;
        }
        self.footer_drawn = self.footer_lines.len();
        self.out.flush()
    }

    /// Erase the footer lines currently below the cursor (legacy mode)
    fn erase_footer(&mut self) -> std::io::Result<()> {
        match self.mode {
            Mode::Legacy { .. } => {
                if self.footer_drawn > 0 {
                    queue!(
                        self.out,
                        cursor::MoveUp(self.footer_drawn as u16),
                        cursor::MoveToColumn(0),
                        terminal::Clear(terminal::ClearType::FromCursorDown)
                    )?;
                    self.footer_drawn = 0;
                }
                self.out.flush()
            }
            Mode::Viewport { height, .. } => {
                let footer_h = self.footer_lines.len() as u16;
                if footer_h > 0 {
                    let top = height.saturating_sub(footer_h);
                    for i in 0..footer_h {
                        queue!(
                            self.out,
                            cursor::MoveTo(0, top + i),
                            terminal::Clear(terminal::ClearType::CurrentLine)
                        )?;
                    }
                    queue!(self.out, cursor::MoveTo(0, top))?;
                }
                self.footer_lines.clear();
                self.out.flush()
            }
            Mode::Plain => Ok(()),
        }
    }

    /// Viewport mode: redraw the whole frame
    ///
    /// Content region is the top `height - footer` rows, showing a window
    /// that ends at the row being built; the footer sits at absolute
    /// positions; the cursor parks at the end of the building row. Cursor
    /// hidden and re-shown around the redraw to prevent flicker.
    fn render_viewport(&mut self) -> std::io::Result<()> {
        let Mode::Viewport { width, height } = self.mode else {
            return Ok(());
        };
        self.pending.clear();

        let footer_h = self.footer_lines.len().min((height as usize).saturating_sub(1)) as u16;
        let content_h = height.saturating_sub(footer_h).max(1);

        queue!(self.out, cursor::Hide)?;

        // Completed rows that fit above the building row.
        let visible = (content_h as usize).saturating_sub(1);
        let start = self.frame_rows.len().saturating_sub(visible);
        let mut y: u16 = 0;
        for row in self.frame_rows.iter().skip(start) {
            let clipped = clip_width(&row.text, width as usize);
            let styled = style_row(row.kind, &clipped);
            queue!(
                self.out,
                cursor::MoveTo(0, y),
                terminal::Clear(terminal::ClearType::CurrentLine),
                style::PrintStyledContent(styled)
            )?;
            y += 1;
        }

        let cur_y = y;
        let clipped = clip_width(&self.frame_current, width as usize);
        queue!(
            self.out,
            cursor::MoveTo(0, cur_y),
            terminal::Clear(terminal::ClearType::CurrentLine),
            style::Print(clipped)
        )?;
        y += 1;

        while y < content_h {
            queue!(
                self.out,
                cursor::MoveTo(0, y),
                terminal::Clear(terminal::ClearType::CurrentLine)
            )?;
            y += 1;
        }

        for (i, line) in self.footer_lines.iter().take(footer_h as usize).enumerate() {
            let clipped = clip_width(line, width as usize);
            let styled = if i == 0 { clipped.dark_grey() } else { clipped.bold() };
            queue!(
                self.out,
                cursor::MoveTo(0, content_h + i as u16),
                terminal::Clear(terminal::ClearType::CurrentLine),
                style::PrintStyledContent(styled)
            )?;
        }

        let col = UnicodeWidthStr::width(self.frame_current.as_str()).min((width as usize).saturating_sub(1)) as u16;
        queue!(self.out, cursor::MoveTo(col, cur_y), cursor::Show)?;
        self.out.flush()
    }

    /// Rebuild the footer lines from the stored snapshot and stats
    fn recompute_footer(&mut self) {
        let Some(snap) = &self.last_snapshot else {
            self.footer_lines.clear();
            return;
        };

        let width = match self.mode {
            Mode::Viewport { width, .. } => width as usize,
            _ => 60,
        };

        let mut lines = Vec::new();
        lines.push("─".repeat(width.min(60)));
        lines.push(format!(
            "{} | iter {}/{} | stag {}/{} | files {}",
            snap.item_id,
            snap.iteration,
            snap.max_iterations,
            snap.stagnation,
            snap.stagnation_limit,
            snap.files_changed
        ));
        if snap.phases_total > 0 {
            match &snap.current_phase {
                Some(phase) => lines.push(format!(
                    "phase {}/{}: {}",
                    snap.phases_done + 1,
                    snap.phases_total,
                    phase
                )),
                None => lines.push(format!("phases {0}/{0} complete", snap.phases_total)),
            }
        }
        if let (Some(pid), Some(mem)) = (self.pid, self.mem_kb) {
            lines.push(format!("pid {} | mem {} KB", pid, mem));
        }

        // Footer never consumes the whole terminal.
        let cap = match self.mode {
            Mode::Viewport { height, .. } => (height as usize).saturating_sub(1).max(1),
            Mode::Legacy { max_footer } => max_footer,
            Mode::Plain => 0,
        };
        lines.truncate(cap);
        self.footer_lines = lines;
    }
}

fn kind_of(event: &Event) -> RowKind {
    match event {
        Event::Prog(_) => RowKind::Prog,
        Event::ToolUse(_) => RowKind::ToolUse,
        Event::ToolResult(_) => RowKind::ToolResult,
        Event::Review(_) => RowKind::Review,
        Event::DiffAdd(_) => RowKind::DiffAdd,
        Event::DiffDel(_) => RowKind::DiffDel,
        Event::DiffCtx(_) => RowKind::DiffCtx,
        Event::DiffHunk(_) => RowKind::DiffHunk,
        Event::Markdown(_) => RowKind::Markdown,
        Event::IterationSeparator(_) => RowKind::Separator,
        Event::StreamingText(_) => RowKind::Text,
    }
}

fn style_row(kind: RowKind, text: &str) -> style::StyledContent<String> {
    let text = text.to_string();
    match kind {
        RowKind::Prog => text.dark_grey(),
        RowKind::ToolUse => text.blue(),
        RowKind::ToolResult => text.dark_grey(),
        RowKind::Review => text.magenta(),
        RowKind::DiffAdd => text.green(),
        RowKind::DiffDel => text.red(),
        RowKind::DiffCtx => text.stylize(),
        RowKind::DiffHunk => text.cyan(),
        RowKind::Markdown => text.bold(),
        RowKind::Separator => text.dark_grey(),
        RowKind::Text => text.stylize(),
    }
}

/// Strip ANSI sequences and control bytes, normalize line endings
///
/// `\r\n` and bare `\r` become `\n`, tabs become four spaces, every other
/// control byte is dropped. Applied before any text reaches the frame.
fn sanitize(text: &str) -> String {
    let stripped = strip_ansi_escapes::strip(text.as_bytes());
    let text = String::from_utf8_lossy(&stripped).into_owned();
    let text = text.replace("\r\n", "\n").replace('\r', "\n");

    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '\n' => out.push('\n'),
            '\t' => out.push_str("    "),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }
    out
}

/// Split at the last char boundary whose accumulated display width fits
fn split_at_width(text: &str, width: usize) -> (&str, &str) {
    let mut acc = 0usize;
    for (idx, ch) in text.char_indices() {
        let w = UnicodeWidthChar::width(ch).unwrap_or(0);
        if acc + w > width {
            return text.split_at(idx);
        }
        acc += w;
    }
    (text, "")
}

/// Wrap a line into display-width-bounded pieces
fn wrap_width(line: &str, width: usize) -> Vec<String> {
    if width == usize::MAX || UnicodeWidthStr::width(line) <= width {
        return vec![line.to_string()];
    }
    let mut pieces = Vec::new();
    let mut rest = line;
    while UnicodeWidthStr::width(rest) > width {
        let (head, tail) = split_at_width(rest, width);
        pieces.push(head.to_string());
        rest = tail;
    }
    pieces.push(rest.to_string());
    pieces
}

/// Clip a line to a display width
fn clip_width(line: &str, width: usize) -> String {
    if UnicodeWidthStr::width(line) <= width {
        return line.to_string();
    }
    split_at_width(line, width).0.to_string()
}
