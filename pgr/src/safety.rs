//! Safety counters and exit-reason classification
//!
//! Tracks per-run iteration counts, stagnation (consecutive turns with no
//! file changes), and repeated identical errors. The loop runner bumps the
//! iteration counter at the top of each turn and consults [`check_safety`]
//! before deciding what to do next.

use std::collections::BTreeSet;
use std::time::Instant;

use tracing::debug;

/// How many identical consecutive errors trigger a Blocked exit.
const MAX_CONSECUTIVE_ERRORS: u32 = 3;

/// Why a run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// All phases complete and review passed
    Complete,
    /// Iteration budget exhausted
    MaxIterations,
    /// Too many consecutive turns without file changes
    Stagnation,
    /// The agent reported BLOCKED, or errors repeated
    Blocked,
    /// Context cancelled by the user
    UserInterrupt,
}

impl ExitReason {
    /// Stable process exit code for this reason
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Complete => 0,
            Self::MaxIterations => 2,
            Self::Stagnation => 3,
            Self::Blocked => 4,
            Self::UserInterrupt => 130,
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Complete => write!(f, "complete"),
            Self::MaxIterations => write!(f, "max-iterations"),
            Self::Stagnation => write!(f, "stagnation"),
            Self::Blocked => write!(f, "blocked"),
            Self::UserInterrupt => write!(f, "user-interrupt"),
        }
    }
}

/// Safety limits for a run
#[derive(Debug, Clone)]
pub struct SafetyConfig {
    /// Maximum outer-loop iterations
    pub max_iterations: u32,

    /// Consecutive no-change turns before a stagnation exit (0 disables)
    pub stagnation_limit: u32,

    /// Per-invocation executor timeout in seconds
    pub timeout_secs: u64,

    /// Maximum fix iterations per review phase
    pub max_review_iterations: u32,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            max_iterations: 30,
            stagnation_limit: 3,
            timeout_secs: 1800,
            max_review_iterations: 3,
        }
    }
}

/// Mutable per-run safety counters
///
/// Invariants: `iteration` is strictly increasing, `consecutive_no_changes`
/// never exceeds `iteration`, and `total_files_changed` never shrinks.
#[derive(Debug, Clone)]
pub struct SafetyState {
    /// 1-based turn counter, bumped at the top of each turn
    pub iteration: u32,

    /// Turns in a row whose reported file set was empty
    pub consecutive_no_changes: u32,

    /// Turns in a row with the same non-empty error text
    pub consecutive_errors: u32,

    /// Error text of the previous turn, for the identical-error check
    last_error: Option<String>,

    /// Every file path the run has ever touched
    pub total_files_changed: BTreeSet<String>,

    /// When the run started
    pub started_at: Instant,
}

impl Default for SafetyState {
    fn default() -> Self {
        Self::new()
    }
}

impl SafetyState {
    pub fn new() -> Self {
        Self {
            iteration: 0,
            consecutive_no_changes: 0,
            consecutive_errors: 0,
            last_error: None,
            total_files_changed: BTreeSet::new(),
            started_at: Instant::now(),
        }
    }

    /// Bump the turn counter at the top of an iteration
    pub fn begin_iteration(&mut self) -> u32 {
        self.iteration += 1;
        debug!(iteration = self.iteration, "begin_iteration: called");
        self.iteration
    }

    /// Record the outcome of one completed turn
    ///
    /// Stagnation increments iff `files_changed` is empty, else resets.
    /// The error counter increments iff `error_text` is non-empty and equal
    /// byte-for-byte to the previous turn's; a different non-empty error
    /// starts a new run at 1; empty resets to 0.
    pub fn record_iteration(&mut self, files_changed: &[String], error_text: &str) {
        debug!(
            iteration = self.iteration,
            files = files_changed.len(),
            has_error = !error_text.is_empty(),
            "record_iteration: called"
        );

        if files_changed.is_empty() {
            self.consecutive_no_changes += 1;
            debug!(
                consecutive_no_changes = self.consecutive_no_changes,
                "record_iteration: no files changed"
            );
        } else {
            self.consecutive_no_changes = 0;
            for file in files_changed {
                self.total_files_changed.insert(file.clone());
            }
            debug!(
                total_files = self.total_files_changed.len(),
                "record_iteration: files recorded"
            );
        }

        if error_text.is_empty() {
            self.consecutive_errors = 0;
            self.last_error = None;
        } else if self.last_error.as_deref() == Some(error_text) {
            self.consecutive_errors += 1;
            debug!(
                consecutive_errors = self.consecutive_errors,
                "record_iteration: repeated error"
            );
        } else {
            self.consecutive_errors = 1;
            self.last_error = Some(error_text.to_string());
            debug!("record_iteration: new error run");
        }
    }

    /// Number of completed turns (the counter minus the turn being decided)
    pub fn completed_iterations(&self) -> u32 {
        self.iteration.saturating_sub(1)
    }
}

/// Result of a safety check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafetyVerdict {
    pub should_exit: bool,
    pub reason: Option<ExitReason>,
    pub message: String,
}

impl SafetyVerdict {
    fn ok() -> Self {
        Self {
            should_exit: false,
            reason: None,
            message: String::new(),
        }
    }

    fn exit(reason: ExitReason, message: String) -> Self {
        Self {
            should_exit: true,
            reason: Some(reason),
            message,
        }
    }
}

/// Check the safety limits against the current counters
///
/// Called at the top of each turn, after the iteration counter has been
/// bumped for the turn about to run. Tie-break order: MaxIterations >
/// Stagnation > repeated errors.
pub fn check_safety(cfg: &SafetyConfig, state: &SafetyState) -> SafetyVerdict {
    debug!(
        iteration = state.iteration,
        max_iterations = cfg.max_iterations,
        consecutive_no_changes = state.consecutive_no_changes,
        stagnation_limit = cfg.stagnation_limit,
        consecutive_errors = state.consecutive_errors,
        "check_safety: called"
    );

    if state.iteration > cfg.max_iterations {
        debug!("check_safety: max iterations exceeded");
        return SafetyVerdict::exit(
            ExitReason::MaxIterations,
            format!("reached the maximum of {} iterations", cfg.max_iterations),
        );
    }

    if cfg.stagnation_limit > 0 && state.consecutive_no_changes >= cfg.stagnation_limit {
        debug!("check_safety: stagnation limit reached");
        return SafetyVerdict::exit(
            ExitReason::Stagnation,
            format!(
                "{} consecutive iterations without file changes",
                state.consecutive_no_changes
            ),
        );
    }

    if state.consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
        debug!("check_safety: too many consecutive errors");
        return SafetyVerdict::exit(
            ExitReason::Blocked,
            format!("{} consecutive identical errors", state.consecutive_errors),
        );
    }

    SafetyVerdict::ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_iteration_strictly_increases() {
        let mut state = SafetyState::new();
        assert_eq!(state.begin_iteration(), 1);
        assert_eq!(state.begin_iteration(), 2);
        assert_eq!(state.begin_iteration(), 3);
    }

    #[test]
    fn test_stagnation_resets_on_changes() {
        let mut state = SafetyState::new();
        state.begin_iteration();
        state.record_iteration(&[], "");
        assert_eq!(state.consecutive_no_changes, 1);

        state.begin_iteration();
        state.record_iteration(&files(&["a.rs"]), "");
        assert_eq!(state.consecutive_no_changes, 0);

        state.begin_iteration();
        state.record_iteration(&[], "");
        assert_eq!(state.consecutive_no_changes, 1);
    }

    #[test]
    fn test_total_files_never_shrink() {
        let mut state = SafetyState::new();
        state.begin_iteration();
        state.record_iteration(&files(&["a.rs", "b.rs"]), "");
        assert_eq!(state.total_files_changed.len(), 2);

        state.begin_iteration();
        state.record_iteration(&files(&["a.rs"]), "");
        assert_eq!(state.total_files_changed.len(), 2);

        state.begin_iteration();
        state.record_iteration(&[], "boom");
        assert_eq!(state.total_files_changed.len(), 2);
    }

    #[test]
    fn test_error_counter_requires_identical_text() {
        let mut state = SafetyState::new();
        state.begin_iteration();
        state.record_iteration(&[], "error one");
        assert_eq!(state.consecutive_errors, 1);

        state.begin_iteration();
        state.record_iteration(&[], "error one");
        assert_eq!(state.consecutive_errors, 2);

        state.begin_iteration();
        state.record_iteration(&[], "error two");
        assert_eq!(state.consecutive_errors, 1);

        state.begin_iteration();
        state.record_iteration(&[], "");
        assert_eq!(state.consecutive_errors, 0);
    }

    #[test]
    fn test_check_max_iterations() {
        let cfg = SafetyConfig {
            max_iterations: 2,
            ..Default::default()
        };
        let mut state = SafetyState::new();

        state.begin_iteration();
        assert!(!check_safety(&cfg, &state).should_exit);
        state.begin_iteration();
        assert!(!check_safety(&cfg, &state).should_exit);

        state.begin_iteration();
        let verdict = check_safety(&cfg, &state);
        assert!(verdict.should_exit);
        assert_eq!(verdict.reason, Some(ExitReason::MaxIterations));
    }

    #[test]
    fn test_max_iterations_one_allows_single_turn() {
        let cfg = SafetyConfig {
            max_iterations: 1,
            ..Default::default()
        };
        let mut state = SafetyState::new();

        state.begin_iteration();
        assert!(!check_safety(&cfg, &state).should_exit);

        state.record_iteration(&files(&["a.rs"]), "");
        state.begin_iteration();
        let verdict = check_safety(&cfg, &state);
        assert!(verdict.should_exit);
        assert_eq!(verdict.reason, Some(ExitReason::MaxIterations));
        assert_eq!(state.completed_iterations(), 1);
    }

    #[test]
    fn test_check_stagnation() {
        let cfg = SafetyConfig {
            stagnation_limit: 3,
            ..Default::default()
        };
        let mut state = SafetyState::new();

        for _ in 0..3 {
            state.begin_iteration();
            state.record_iteration(&[], "");
        }

        state.begin_iteration();
        let verdict = check_safety(&cfg, &state);
        assert!(verdict.should_exit);
        assert_eq!(verdict.reason, Some(ExitReason::Stagnation));
    }

    #[test]
    fn test_stagnation_zero_disables() {
        let cfg = SafetyConfig {
            stagnation_limit: 0,
            ..Default::default()
        };
        let mut state = SafetyState::new();

        for _ in 0..10 {
            state.begin_iteration();
            state.record_iteration(&[], "");
        }

        assert!(!check_safety(&cfg, &state).should_exit);
    }

    #[test]
    fn test_check_blocked_on_repeated_errors() {
        let cfg = SafetyConfig::default();
        let mut state = SafetyState::new();

        for _ in 0..3 {
            state.begin_iteration();
            state.record_iteration(&files(&["a.rs"]), "same failure");
        }

        state.begin_iteration();
        let verdict = check_safety(&cfg, &state);
        assert!(verdict.should_exit);
        assert_eq!(verdict.reason, Some(ExitReason::Blocked));
    }

    #[test]
    fn test_tie_break_prefers_max_iterations() {
        let cfg = SafetyConfig {
            max_iterations: 2,
            stagnation_limit: 1,
            ..Default::default()
        };
        let mut state = SafetyState::new();
        state.iteration = 3;
        state.consecutive_no_changes = 5;
        state.consecutive_errors = 5;

        let verdict = check_safety(&cfg, &state);
        assert_eq!(verdict.reason, Some(ExitReason::MaxIterations));
    }

    #[test]
    fn test_exit_codes_stable() {
        assert_eq!(ExitReason::Complete.exit_code(), 0);
        assert_eq!(ExitReason::MaxIterations.exit_code(), 2);
        assert_eq!(ExitReason::Stagnation.exit_code(), 3);
        assert_eq!(ExitReason::Blocked.exit_code(), 4);
        assert_eq!(ExitReason::UserInterrupt.exit_code(), 130);
    }
}
