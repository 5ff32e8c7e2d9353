//! Embedded prompts
//!
//! Compiled into the binary from .pmt files at build time.

use tracing::debug;

/// Phased task prompt for ticket/plan work items
pub const TASK_PHASED: &str = include_str!("../../prompts/task_phased.pmt");

/// Phaseless task prompt for ad-hoc `run` work
pub const TASK_PHASELESS: &str = include_str!("../../prompts/task_phaseless.pmt");

/// Fix-pass prompt fed with confirmed review issues
pub const REVIEW_FIX: &str = include_str!("../../prompts/review_fix.pmt");

/// Default review agent prompt
pub const REVIEW_AGENT: &str = include_str!("../../prompts/review_agent.pmt");

/// Validator prompt fed with the issue list as YAML
pub const VALIDATOR: &str = include_str!("../../prompts/validator.pmt");

/// Plan file scaffold
pub const PLAN: &str = include_str!("../../prompts/plan.pmt");

/// Get an embedded prompt by name
pub fn get_embedded(name: &str) -> Option<&'static str> {
    debug!(%name, "get_embedded: called");
    match name {
        "task-phased" => Some(TASK_PHASED),
        "task-phaseless" => Some(TASK_PHASELESS),
        "review-fix" => Some(REVIEW_FIX),
        "review-agent" => Some(REVIEW_AGENT),
        "validator" => Some(VALIDATOR),
        "plan" => Some(PLAN),
        _ => {
            debug!(%name, "get_embedded: no match found");
            None
        }
    }
}
