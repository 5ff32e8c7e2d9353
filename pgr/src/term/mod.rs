//! Terminal output
//!
//! Events produced by the output demultiplexer and consumed by the
//! sticky-footer writer. Each variant is a tagged text payload; the writer
//! owns styling and line discipline.

mod writer;

pub use writer::{FooterSnapshot, Mode, TermWriter};

/// A classified chunk of terminal output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Orchestrator chrome (progress messages)
    Prog(String),
    /// The agent started using a tool
    ToolUse(String),
    /// A tool returned a result
    ToolResult(String),
    /// Review-pipeline output
    Review(String),
    /// Added line inside a diff frame
    DiffAdd(String),
    /// Removed line inside a diff frame
    DiffDel(String),
    /// Context line inside a diff frame
    DiffCtx(String),
    /// `@@ … @@` hunk header
    DiffHunk(String),
    /// Markdown-ish agent prose emitted as a whole line
    Markdown(String),
    /// Visual separator between loop iterations
    IterationSeparator(String),
    /// Raw streamed text; partial lines accumulate until a newline
    StreamingText(String),
}

impl Event {
    /// The text payload of the event
    pub fn text(&self) -> &str {
        match self {
            Self::Prog(t)
            | Self::ToolUse(t)
            | Self::ToolResult(t)
            | Self::Review(t)
            | Self::DiffAdd(t)
            | Self::DiffDel(t)
            | Self::DiffCtx(t)
            | Self::DiffHunk(t)
            | Self::Markdown(t)
            | Self::IterationSeparator(t)
            | Self::StreamingText(t) => t,
        }
    }
}
