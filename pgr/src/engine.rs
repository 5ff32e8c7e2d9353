//! Decision engine
//!
//! Pure state machine over the loop: given the work item, the last parsed
//! status, and the safety counters, pick the next action. Performs no I/O
//! and holds no callbacks; every transition is testable by value
//! comparison. The loop runner owns all side effects.

use eyre::eyre;
use tracing::debug;

use crate::safety::{ExitReason, SafetyConfig, SafetyState, SafetyVerdict, check_safety};
use crate::status::{AgentStatus, ParsedStatus};
use crate::ticket::WorkItem;

/// What the loop should do next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Invoke the coding agent; `review_fix` selects the fix-pass prompt
    InvokeAgent { review_fix: bool },
    /// Run the review pipeline for the given review phase
    RunReview { phase_idx: usize },
    /// Everything done; exit cleanly
    Complete,
    /// Exit for the given reason
    Exit { reason: ExitReason },
}

/// Side effects the runner must apply after a turn's status
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatusProcessResult {
    pub iteration: u32,
    pub phase_completed: Option<String>,
    pub files_changed: Vec<String>,
    pub summary: String,
    /// The agent reported DONE
    pub task_completed: bool,
    /// The agent reported BLOCKED
    pub should_exit: bool,
    pub exit_reason: Option<ExitReason>,
    pub error: Option<String>,
    /// A pending review fix was consumed by this turn
    pub cleared_review_fix: bool,
}

/// Outcome flags of one review decision
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReviewOutcome {
    /// The loop must invoke the agent with a fix prompt
    pub needs_fix: bool,
    /// The current phase passed
    pub phase_passed: bool,
    /// The phase index moved forward
    pub advanced_phase: bool,
    /// All review phases are done; review is considered passed
    pub all_phases_done: bool,
    /// The phase was abandoned after exhausting its fix iterations
    pub exhausted: bool,
}

/// Pure decision engine
///
/// Carries the safety config, the review-phase cursor, and the
/// pending-review-fix / review-passed flags.
#[derive(Debug)]
pub struct Engine {
    cfg: SafetyConfig,
    review_phase_count: usize,
    review_phase_idx: usize,
    review_phase_iter: u32,
    pending_review_fix: bool,
    review_passed: bool,
    review_only: bool,
}

impl Engine {
    /// Build an engine; `review_phase_count` of 0 means review disabled
    /// (review counts as passed from the start).
    pub fn new(cfg: SafetyConfig, review_phase_count: usize) -> Self {
        debug!(review_phase_count, "Engine::new: called");
        Self {
            cfg,
            review_phase_count,
            review_phase_idx: 0,
            review_phase_iter: 0,
            pending_review_fix: false,
            review_passed: review_phase_count == 0,
            review_only: false,
        }
    }

    /// Run review (and fixes) without requiring task phases first
    pub fn with_review_only(mut self, enabled: bool) -> Self {
        debug!(enabled, "Engine::with_review_only: called");
        self.review_only = enabled;
        self
    }

    pub fn pending_review_fix(&self) -> bool {
        self.pending_review_fix
    }

    pub fn review_passed(&self) -> bool {
        self.review_passed
    }

    pub fn safety_config(&self) -> &SafetyConfig {
        &self.cfg
    }

    /// Per-phase fix-iteration cap
    ///
    /// Flat agent lists form a single logical phase, so the cap is uniform.
    fn phase_max_iterations(&self, _phase_idx: usize) -> u32 {
        self.cfg.max_review_iterations
    }

    /// Pick the next action
    pub fn decide_next(
        &self,
        stopped: bool,
        ctx_done: bool,
        work_item: &WorkItem,
        task_completed: bool,
    ) -> Action {
        debug!(
            stopped,
            ctx_done,
            task_completed,
            pending_review_fix = self.pending_review_fix,
            review_passed = self.review_passed,
            review_only = self.review_only,
            "decide_next: called"
        );

        if stopped || ctx_done {
            debug!("decide_next: interrupted");
            return Action::Exit {
                reason: ExitReason::UserInterrupt,
            };
        }

        let all_complete = task_completed || work_item.all_phases_complete();
        if all_complete || self.review_only {
            if self.pending_review_fix {
                debug!("decide_next: pending review fix");
                return Action::InvokeAgent { review_fix: true };
            }
            if !self.review_passed {
                debug!(phase_idx = self.review_phase_idx, "decide_next: run review");
                return Action::RunReview {
                    phase_idx: self.review_phase_idx,
                };
            }
            debug!("decide_next: complete");
            return Action::Complete;
        }

        debug!("decide_next: invoke agent");
        Action::InvokeAgent { review_fix: false }
    }

    /// Thin wrapper over the safety check
    pub fn check_safety(&self, state: &SafetyState) -> SafetyVerdict {
        check_safety(&self.cfg, state)
    }

    /// Interpret a parsed status into side effects for the runner
    pub fn process_status(&mut self, status: &ParsedStatus, iteration: u32) -> StatusProcessResult {
        debug!(iteration, status = %status.status, "process_status: called");

        let mut result = StatusProcessResult {
            iteration,
            phase_completed: status.phase_completed.clone(),
            files_changed: status.files_changed.clone(),
            summary: status.summary.clone(),
            ..Default::default()
        };

        if self.pending_review_fix {
            debug!("process_status: clearing pending review fix");
            self.pending_review_fix = false;
            result.cleared_review_fix = true;
        }

        match status.status {
            AgentStatus::Blocked => {
                debug!("process_status: agent blocked");
                result.should_exit = true;
                result.exit_reason = Some(ExitReason::Blocked);
                result.error = Some(
                    status
                        .error
                        .clone()
                        .unwrap_or_else(|| "agent reported BLOCKED without a message".to_string()),
                );
            }
            AgentStatus::Done => {
                debug!("process_status: task completed");
                result.task_completed = true;
            }
            AgentStatus::Continue => {}
        }

        result
    }

    /// Advance the review-phase state machine with one pass/fail result
    pub fn decide_review(&mut self, passed: bool) -> eyre::Result<ReviewOutcome> {
        debug!(
            passed,
            phase_idx = self.review_phase_idx,
            phase_iter = self.review_phase_iter,
            "decide_review: called"
        );

        if self.review_phase_count == 0 {
            return Err(eyre!("no review phases configured"));
        }

        let mut outcome = ReviewOutcome::default();

        if passed {
            self.review_phase_iter = 0;
            self.review_phase_idx += 1;
            outcome.phase_passed = true;
            outcome.advanced_phase = true;
            if self.review_phase_idx >= self.review_phase_count {
                debug!("decide_review: all phases passed");
                self.review_passed = true;
                outcome.all_phases_done = true;
            }
            return Ok(outcome);
        }

        self.review_phase_iter += 1;
        self.pending_review_fix = true;

        if self.review_phase_iter > self.phase_max_iterations(self.review_phase_idx) {
            debug!(
                phase_iter = self.review_phase_iter,
                "decide_review: phase fix budget exhausted, advancing"
            );
            self.pending_review_fix = false;
            self.review_phase_iter = 0;
            self.review_phase_idx += 1;
            outcome.advanced_phase = true;
            outcome.exhausted = true;
            if self.review_phase_idx >= self.review_phase_count {
                self.review_passed = true;
                outcome.all_phases_done = true;
            }
            return Ok(outcome);
        }

        debug!("decide_review: needs fix");
        outcome.needs_fix = true;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ticket::{Phase, parse_work_item};

    fn item_with_phases(completed: &[bool]) -> WorkItem {
        let mut item = WorkItem::adhoc("T-1", "task");
        for (i, done) in completed.iter().enumerate() {
            item.phases.push(Phase {
                name: format!("P{}", i + 1),
                completed: *done,
            });
        }
        item
    }

    #[test]
    fn test_interrupt_wins_over_everything() {
        let engine = Engine::new(SafetyConfig::default(), 1);
        let item = item_with_phases(&[true, true]);
        assert_eq!(
            engine.decide_next(true, false, &item, true),
            Action::Exit {
                reason: ExitReason::UserInterrupt
            }
        );
        assert_eq!(
            engine.decide_next(false, true, &item, false),
            Action::Exit {
                reason: ExitReason::UserInterrupt
            }
        );
    }

    #[test]
    fn test_incomplete_phases_invoke_agent() {
        let engine = Engine::new(SafetyConfig::default(), 1);
        let item = item_with_phases(&[true, false]);
        assert_eq!(
            engine.decide_next(false, false, &item, false),
            Action::InvokeAgent { review_fix: false }
        );
    }

    #[test]
    fn test_all_complete_runs_review() {
        let engine = Engine::new(SafetyConfig::default(), 1);
        let item = item_with_phases(&[true, true]);
        assert_eq!(
            engine.decide_next(false, false, &item, false),
            Action::RunReview { phase_idx: 0 }
        );
    }

    #[test]
    fn test_done_flag_runs_review_even_with_open_phases() {
        let engine = Engine::new(SafetyConfig::default(), 1);
        let item = item_with_phases(&[true, false]);
        assert_eq!(
            engine.decide_next(false, false, &item, true),
            Action::RunReview { phase_idx: 0 }
        );
    }

    #[test]
    fn test_review_disabled_completes_directly() {
        let engine = Engine::new(SafetyConfig::default(), 0);
        let item = item_with_phases(&[true]);
        assert_eq!(engine.decide_next(false, false, &item, false), Action::Complete);
    }

    #[test]
    fn test_review_only_mode_reviews_without_phases() {
        let engine = Engine::new(SafetyConfig::default(), 1).with_review_only(true);
        let item = WorkItem::adhoc("adhoc", "prompt");
        assert_eq!(
            engine.decide_next(false, false, &item, false),
            Action::RunReview { phase_idx: 0 }
        );
    }

    #[test]
    fn test_pending_fix_invokes_fix_prompt() {
        let mut engine = Engine::new(SafetyConfig::default(), 1);
        let item = item_with_phases(&[true]);
        engine.decide_review(false).unwrap();
        assert_eq!(
            engine.decide_next(false, false, &item, false),
            Action::InvokeAgent { review_fix: true }
        );
    }

    #[test]
    fn test_process_status_blocked() {
        let mut engine = Engine::new(SafetyConfig::default(), 0);
        let status = ParsedStatus {
            status: AgentStatus::Blocked,
            error: Some("missing dep".to_string()),
            ..Default::default()
        };
        let result = engine.process_status(&status, 2);
        assert!(result.should_exit);
        assert_eq!(result.exit_reason, Some(ExitReason::Blocked));
        assert_eq!(result.error.as_deref(), Some("missing dep"));
    }

    #[test]
    fn test_process_status_done_sets_task_completed() {
        let mut engine = Engine::new(SafetyConfig::default(), 0);
        let status = ParsedStatus {
            status: AgentStatus::Done,
            files_changed: vec!["b.go".to_string()],
            summary: "finished".to_string(),
            ..Default::default()
        };
        let result = engine.process_status(&status, 1);
        assert!(result.task_completed);
        assert!(!result.should_exit);
        assert_eq!(result.files_changed, vec!["b.go"]);
        assert_eq!(result.summary, "finished");
    }

    #[test]
    fn test_process_status_clears_pending_fix() {
        let mut engine = Engine::new(SafetyConfig::default(), 1);
        engine.decide_review(false).unwrap();
        assert!(engine.pending_review_fix());

        let status = ParsedStatus::default();
        let result = engine.process_status(&status, 3);
        assert!(result.cleared_review_fix);
        assert!(!engine.pending_review_fix());
    }

    #[test]
    fn test_decide_review_without_phases_errors() {
        let mut engine = Engine::new(SafetyConfig::default(), 0);
        assert!(engine.decide_review(true).is_err());
    }

    #[test]
    fn test_decide_review_pass_advances_to_done() {
        let mut engine = Engine::new(SafetyConfig::default(), 1);
        let outcome = engine.decide_review(true).unwrap();
        assert!(outcome.phase_passed);
        assert!(outcome.advanced_phase);
        assert!(outcome.all_phases_done);
        assert!(engine.review_passed());
    }

    #[test]
    fn test_decide_review_multi_phase_progression() {
        let mut engine = Engine::new(SafetyConfig::default(), 2);
        let first = engine.decide_review(true).unwrap();
        assert!(first.phase_passed);
        assert!(!first.all_phases_done);

        let second = engine.decide_review(true).unwrap();
        assert!(second.all_phases_done);
        assert!(engine.review_passed());
    }

    #[test]
    fn test_decide_review_fail_requests_fix() {
        let mut engine = Engine::new(SafetyConfig::default(), 1);
        let outcome = engine.decide_review(false).unwrap();
        assert!(outcome.needs_fix);
        assert!(engine.pending_review_fix());
        assert!(!engine.review_passed());
    }

    #[test]
    fn test_decide_review_exhaustion_advances_and_clears_fix() {
        let cfg = SafetyConfig {
            max_review_iterations: 2,
            ..Default::default()
        };
        let mut engine = Engine::new(cfg, 1);

        assert!(engine.decide_review(false).unwrap().needs_fix);
        engine.process_status(&ParsedStatus::default(), 1);
        assert!(engine.decide_review(false).unwrap().needs_fix);
        engine.process_status(&ParsedStatus::default(), 2);

        let third = engine.decide_review(false).unwrap();
        assert!(third.exhausted);
        assert!(third.advanced_phase);
        assert!(third.all_phases_done);
        assert!(!engine.pending_review_fix());
        assert!(engine.review_passed());
    }
}
