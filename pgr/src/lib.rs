//! Programmator - ticket-driven coding-agent orchestrator
//!
//! Given a work item (a ticket or a plan file with a phase checklist),
//! programmator repeatedly invokes an external coding agent, parses the
//! structured status block the agent emits at the end of each turn,
//! updates progress, and loops until every phase is complete, the agent
//! reports it is blocked, or a safety limit fires. Once the task side is
//! done, a review pipeline drives specialist review agents over the
//! changed files and feeds confirmed issues back for fix passes.
//!
//! # Core pieces
//!
//! - [`engine`] - pure decision engine (invoke / review / exit)
//! - [`runner`] - the loop: state, prompts, side effects, demultiplexing
//! - [`invoker`] - executor child-process supervision
//! - [`review`] - review agent fan-out and validator filtering
//! - [`term`] - sticky-footer terminal writer
//! - [`status`] - the end-of-turn status-block protocol
//! - [`safety`] - iteration/stagnation/error limits

pub mod cli;
pub mod config;
pub mod engine;
pub mod gitio;
pub mod interrupt;
pub mod invoker;
pub mod prompts;
pub mod review;
pub mod runner;
pub mod safety;
pub mod session;
pub mod status;
pub mod term;
pub mod ticket;

// Re-export commonly used types
pub use config::{Config, ReviewConfig};
pub use engine::{Action, Engine, ReviewOutcome, StatusProcessResult};
pub use interrupt::Interrupt;
pub use invoker::{InvokeError, InvokeOptions, InvokeOutcome, Invoker};
pub use prompts::PromptLoader;
pub use review::{AgentResult, Issue, ReviewAgent, ReviewRunner, RunResult, Severity};
pub use runner::{DemuxRules, IterationNotes, LoopRunner, OutputDemux, RunOutcome};
pub use safety::{ExitReason, SafetyConfig, SafetyState, SafetyVerdict, check_safety};
pub use session::{Session, SessionGuard};
pub use status::{AgentStatus, ParsedStatus, parse_last_block, split_output};
pub use term::{Event, FooterSnapshot, TermWriter};
pub use ticket::{CommandTicketSource, Phase, PlanFileSource, StaticTicketSource, TicketSource, WorkItem};
