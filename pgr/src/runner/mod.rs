//! Loop runner
//!
//! Owns the mutable run state and drives the engine: re-fetches the work
//! item, builds prompts, supervises executor invocations, demultiplexes
//! their output into writer events, applies status side effects, runs the
//! review pipeline, and enforces the safety limits. All engine decisions
//! are pure; everything with a side effect lives here.

mod demux;
mod notes;

pub use demux::{DemuxRules, OutputDemux};
pub use notes::IterationNotes;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use eyre::Result;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::engine::{Action, Engine};
use crate::gitio;
use crate::interrupt::Interrupt;
use crate::invoker::{InvokeOptions, Invoker, OutputFn, StatsFn};
use crate::prompts::PromptLoader;
use crate::review::{Issue, ReviewRunner, Severity};
use crate::safety::{ExitReason, SafetyState};
use crate::status::{ParsedStatus, split_output};
use crate::term::{Event, FooterSnapshot, TermWriter};
use crate::ticket::{TicketSource, WorkItem};

/// Final result of a run
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub reason: ExitReason,
    pub message: Option<String>,
    /// Completed turn count
    pub iterations: u32,
    /// Distinct files touched over the whole run
    pub files_changed: usize,
    pub duration: Duration,
}

/// Drives the outer orchestration loop
pub struct LoopRunner {
    config: Config,
    engine: Engine,
    state: SafetyState,
    work_item: WorkItem,
    task_completed: bool,
    source: Box<dyn TicketSource>,
    invoker: Invoker,
    review: ReviewRunner,
    writer: Arc<TermWriter>,
    prompts: PromptLoader,
    interrupt: Interrupt,
    notes: IterationNotes,
    /// Issues from the last failed review, rendered into the fix prompt
    last_review_issues: Vec<Issue>,
    working_dir: PathBuf,
    base_branch: Option<String>,
    /// Plan file backing the work item, for completed-plan relocation
    plan_path: Option<PathBuf>,
    demux_rules: DemuxRules,
    review_only: bool,
    /// Severities that count toward review pass/fail; empty = all
    severity_filter: Vec<Severity>,
}

impl LoopRunner {
    pub fn new(
        config: Config,
        source: Box<dyn TicketSource>,
        writer: Arc<TermWriter>,
        interrupt: Interrupt,
        working_dir: &Path,
        review_only: bool,
    ) -> Result<Self> {
        debug!(?working_dir, review_only, "LoopRunner::new: called");
        let review_phases = if config.review.enabled() { 1 } else { 0 };
        let engine = Engine::new(config.safety_config(), review_phases).with_review_only(review_only);
        let review = ReviewRunner::from_config(
            &config.review,
            &config.executor,
            Duration::from_secs(config.timeout),
        )?;
        let invoker = Invoker::new(&config.executor);
        let prompts = PromptLoader::new()?;

        let base_branch = config.git.base_branch.clone();
        Ok(Self {
            config,
            engine,
            state: SafetyState::new(),
            work_item: WorkItem::default(),
            task_completed: false,
            source,
            invoker,
            review,
            writer,
            prompts,
            interrupt,
            notes: IterationNotes::new(),
            last_review_issues: Vec::new(),
            working_dir: working_dir.to_path_buf(),
            base_branch,
            plan_path: None,
            demux_rules: DemuxRules::default(),
            review_only,
            severity_filter: Vec::new(),
        })
    }

    /// Base branch for changed-file discovery during review
    pub fn with_base_branch(mut self, branch: Option<String>) -> Self {
        self.base_branch = branch;
        self
    }

    /// Plan file path for completed-plan relocation
    pub fn with_plan_path(mut self, path: Option<PathBuf>) -> Self {
        self.plan_path = path;
        self
    }

    /// Only count issues with these severities toward pass/fail
    pub fn with_severity_filter(mut self, severities: Vec<Severity>) -> Self {
        self.severity_filter = severities;
        self
    }

    /// Replace the review runner (tests inject mock agents here)
    pub fn with_review_runner(mut self, review: ReviewRunner) -> Self {
        let review_phases = if review.agent_count() > 0 { 1 } else { 0 };
        self.engine =
            Engine::new(self.config.safety_config(), review_phases).with_review_only(self.review_only);
        self.review = review;
        self
    }

    /// Run the loop to completion
    ///
    /// The footer is always cleared on the way out, whatever the exit
    /// reason.
    pub async fn run(&mut self) -> Result<RunOutcome> {
        let result = self.run_inner().await;
        self.writer.clear_footer();
        result
    }

    async fn run_inner(&mut self) -> Result<RunOutcome> {
        info!(source = %self.source.describe(), "starting loop");

        loop {
            let iteration = self.state.begin_iteration();
            debug!(iteration, "run_inner: turn start");

            if self.interrupt.is_stopped() {
                debug!("run_inner: interrupt at turn start");
                return Ok(self.outcome_at_top(ExitReason::UserInterrupt, None));
            }

            let verdict = self.engine.check_safety(&self.state);
            if verdict.should_exit {
                let reason = verdict.reason.unwrap_or(ExitReason::Blocked);
                debug!(%reason, message = %verdict.message, "run_inner: safety exit");
                return Ok(self.outcome_at_top(reason, Some(verdict.message)));
            }

            // Always work against the latest external ticket state.
            match self.source.fetch().await {
                Ok(item) => {
                    self.work_item = item;
                }
                Err(e) => {
                    let message = format!("failed to fetch work item: {}", e);
                    warn!(%message, "run_inner: fetch failed");
                    self.writer.handle(Event::Prog(message.clone()));
                    self.state.record_iteration(&[], &message);
                    continue;
                }
            }

            self.refresh_footer();

            let action = self.engine.decide_next(
                self.interrupt.is_stopped(),
                false,
                &self.work_item,
                self.task_completed,
            );
            debug!(?action, iteration, "run_inner: action decided");

            match action {
                Action::InvokeAgent { review_fix } => {
                    if let Some(outcome) = self.invoke_agent(iteration, review_fix).await? {
                        return Ok(outcome);
                    }
                }
                Action::RunReview { phase_idx } => {
                    debug!(phase_idx, "run_inner: running review");
                    self.run_review(iteration).await?;
                }
                Action::Complete => {
                    debug!("run_inner: complete");
                    self.finish_plan().await;
                    return Ok(self.outcome_at_top(ExitReason::Complete, None));
                }
                Action::Exit { reason } => {
                    debug!(%reason, "run_inner: engine exit");
                    return Ok(self.outcome_at_top(reason, None));
                }
            }
        }
    }

    /// One executor turn; returns an outcome when the loop must exit
    async fn invoke_agent(&mut self, iteration: u32, review_fix: bool) -> Result<Option<RunOutcome>> {
        debug!(iteration, review_fix, "invoke_agent: called");

        self.writer
            .handle(Event::IterationSeparator(format!("── iteration {} ──", iteration)));
        if review_fix {
            self.writer
                .handle(Event::Prog(format!("fix pass for {} review issue(s)", self.last_review_issues.len())));
        }

        let prompt = if review_fix {
            self.prompts.render_review_fix(&self.work_item, &self.last_review_issues)?
        } else {
            self.prompts.render_task(&self.work_item, &self.notes.as_vec())?
        };

        let demux = Arc::new(std::sync::Mutex::new(OutputDemux::new(self.demux_rules.clone())));
        let demux_cb = Arc::clone(&demux);
        let writer_cb = Arc::clone(&self.writer);
        let on_output: OutputFn = Arc::new(move |chunk: &str| {
            let mut demux = demux_cb.lock().expect("demux lock");
            demux.feed(chunk, &mut |event| writer_cb.handle(event));
        });

        let writer_stats = Arc::clone(&self.writer);
        let on_stats: StatsFn = Arc::new(move |pid, mem_kb| writer_stats.set_process_stats(pid, mem_kb));

        let mut opts = InvokeOptions::new(&self.working_dir, Duration::from_secs(self.config.timeout));
        opts.on_output = Some(on_output);
        opts.on_process_stats = Some(on_stats);

        let outcome = self.invoker.invoke(&self.interrupt, &prompt, opts).await;

        {
            let mut demux = demux.lock().expect("demux lock");
            let writer = &self.writer;
            demux.flush(&mut |event| writer.handle(event));
        }

        // Executor errors become a synthetic CONTINUE status; the loop
        // retries and the identical-error counter eventually exits.
        let (status, error_text) = match outcome.error {
            Some(error) => {
                let message = error.to_string();
                warn!(%message, iteration, "invoke_agent: executor error");
                self.writer.handle(Event::Prog(format!("executor error: {}", message)));
                (ParsedStatus::default(), message)
            }
            None => match split_output(&outcome.stdout) {
                (_, Some(status)) => {
                    if let Some(unknown) = &status.unrecognized_status {
                        self.writer.handle(Event::Prog(format!(
                            "unknown status '{}', treating as CONTINUE",
                            unknown
                        )));
                    }
                    (status, String::new())
                }
                (_, None) => {
                    debug!(iteration, "invoke_agent: no status block");
                    self.writer
                        .handle(Event::Prog("agent output had no status block".to_string()));
                    (ParsedStatus::default(), "no status block in agent output".to_string())
                }
            },
        };

        let result = self.engine.process_status(&status, iteration);

        if let Some(phase) = &result.phase_completed {
            if self.work_item.complete_phase(phase) {
                info!(%phase, iteration, "invoke_agent: phase completed");
                self.writer.handle(Event::Prog(format!("phase completed: {}", phase)));
                if let Err(e) = self.source.mark_phase_complete(phase).await {
                    warn!(%phase, error = %e, "invoke_agent: failed to persist phase completion");
                }
            } else {
                warn!(%phase, "invoke_agent: agent reported unknown phase");
                self.writer
                    .handle(Event::Prog(format!("agent reported unknown phase: {}", phase)));
            }
        }

        if self.config.git.auto_commit
            && !status.commit_made
            && !result.files_changed.is_empty()
            && error_text.is_empty()
        {
            let message = gitio::auto_commit_message(iteration, &result.summary);
            match gitio::commit_files(&self.working_dir, &result.files_changed, &message).await {
                Ok(()) => self.writer.handle(Event::Prog(format!("auto-committed: {}", message))),
                Err(e) => {
                    warn!(error = %e, "invoke_agent: auto-commit failed");
                    self.writer.handle(Event::Prog(format!("auto-commit failed: {}", e)));
                }
            }
        }

        self.notes.record(iteration, &result.summary, &result.files_changed);
        self.state.record_iteration(&result.files_changed, &error_text);
        self.task_completed = self.task_completed || result.task_completed;
        self.refresh_footer();

        if result.should_exit {
            let reason = result.exit_reason.clone().unwrap_or(ExitReason::Blocked);
            debug!(%reason, "invoke_agent: status requested exit");
            return Ok(Some(self.outcome_mid_turn(reason, result.error)));
        }

        Ok(None)
    }

    /// One review pass over everything changed so far
    async fn run_review(&mut self, iteration: u32) -> Result<()> {
        let mut files: BTreeSet<String> = self.state.total_files_changed.clone();
        for file in gitio::changed_files(&self.working_dir, self.base_branch.as_deref()).await {
            files.insert(file);
        }
        let files = filter_review_files(
            files.into_iter().collect(),
            &self.config.review.include,
            &self.config.review.exclude,
        );

        self.writer.handle(Event::Review(format!(
            "[REVIEW] running {} agent(s) over {} file(s)",
            self.review.agent_count(),
            files.len()
        )));

        let result = self.review.run(&self.interrupt, &self.working_dir, &files, iteration).await;
        if self.interrupt.is_stopped() {
            debug!("run_review: cancelled");
            return Ok(());
        }
        let result = result.filter_by_severity(&self.severity_filter);

        for agent in &result.agents {
            let line = match &agent.error {
                Some(error) => format!("[REVIEW] {}: error: {}", agent.agent, error),
                None => format!("[REVIEW] {}: {} issue(s)", agent.agent, agent.issues.len()),
            };
            self.writer.handle(Event::Review(line));
        }

        let outcome = self.engine.decide_review(result.passed)?;
        if outcome.needs_fix {
            self.last_review_issues = result.all_issues();
            self.writer.handle(Event::Review(format!(
                "[REVIEW] {} issue(s) confirmed, queueing fix pass",
                result.total_issues
            )));
        } else if outcome.all_phases_done {
            let line = if outcome.exhausted {
                "[REVIEW] fix budget exhausted, accepting remaining issues".to_string()
            } else {
                "[REVIEW] review passed".to_string()
            };
            self.writer.handle(Event::Review(line));
        }

        Ok(())
    }

    /// Relocate a finished plan file when configured
    async fn finish_plan(&self) {
        if !self.config.git.move_completed_plans {
            return;
        }
        let Some(plan) = &self.plan_path else {
            return;
        };
        let completed_dir = self.working_dir.join(&self.config.git.completed_plans_dir);
        match gitio::move_completed_plan(plan, &completed_dir) {
            Ok(target) => {
                info!(?target, "finish_plan: plan moved");
                self.writer
                    .handle(Event::Prog(format!("plan moved to {}", target.display())));
            }
            Err(e) => {
                warn!(error = %e, "finish_plan: failed to move plan");
            }
        }
    }

    /// Push a fresh state snapshot into the footer
    ///
    /// Copies only; the writer reads these from other tasks.
    fn refresh_footer(&self) {
        self.writer.update_footer(FooterSnapshot {
            item_id: self.work_item.id.clone(),
            iteration: self.state.iteration,
            max_iterations: self.config.max_iterations,
            stagnation: self.state.consecutive_no_changes,
            stagnation_limit: self.config.stagnation_limit,
            files_changed: self.state.total_files_changed.len(),
            current_phase: self.work_item.current_phase().map(|p| p.name.clone()),
            phases_done: self.work_item.completed_count(),
            phases_total: self.work_item.phases.len(),
        });
    }

    /// Exit decided at the top of an un-run turn
    fn outcome_at_top(&self, reason: ExitReason, message: Option<String>) -> RunOutcome {
        RunOutcome {
            reason,
            message,
            iterations: self.state.completed_iterations(),
            files_changed: self.state.total_files_changed.len(),
            duration: self.state.started_at.elapsed(),
        }
    }

    /// Exit decided in the middle of the current turn
    fn outcome_mid_turn(&self, reason: ExitReason, message: Option<String>) -> RunOutcome {
        RunOutcome {
            reason,
            message,
            iterations: self.state.iteration,
            files_changed: self.state.total_files_changed.len(),
            duration: self.state.started_at.elapsed(),
        }
    }
}

/// Apply include/exclude globs to the review file set
///
/// Empty include means every file; exclude always wins.
pub fn filter_review_files(files: Vec<String>, include: &[String], exclude: &[String]) -> Vec<String> {
    let include: Vec<glob::Pattern> = include
        .iter()
        .filter_map(|p| match glob::Pattern::new(p) {
            Ok(pattern) => Some(pattern),
            Err(e) => {
                warn!(pattern = %p, error = %e, "filter_review_files: invalid include pattern");
                None
            }
        })
        .collect();
    let exclude: Vec<glob::Pattern> = exclude
        .iter()
        .filter_map(|p| match glob::Pattern::new(p) {
            Ok(pattern) => Some(pattern),
            Err(e) => {
                warn!(pattern = %p, error = %e, "filter_review_files: invalid exclude pattern");
                None
            }
        })
        .collect();

    files
        .into_iter()
        .filter(|file| {
            if exclude.iter().any(|p| p.matches(file)) {
                return false;
            }
            include.is_empty() || include.iter().any(|p| p.matches(file))
        })
        .collect()
}
