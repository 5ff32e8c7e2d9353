//! Prompt templates
//!
//! Loads prompt templates from embedded defaults (or files, for review
//! agent overrides) and renders them with handlebars.

pub mod embedded;

use eyre::{Context, Result};
use handlebars::Handlebars;
use serde::Serialize;
use tracing::debug;

use crate::review::Issue;
use crate::ticket::WorkItem;

/// Registered template names
const TEMPLATE_NAMES: &[&str] = &[
    "task-phased",
    "task-phaseless",
    "review-fix",
    "review-agent",
    "validator",
    "plan",
];

/// Context for the task prompts
#[derive(Debug, Clone, Serialize)]
pub struct TaskPromptContext {
    pub ticket_id: String,
    pub title: String,
    pub current_phase: String,
    pub phases: Vec<PhaseView>,
    pub validation_commands: Vec<String>,
    pub notes: Vec<String>,
    pub raw: String,
}

/// Phase as the templates see it
#[derive(Debug, Clone, Serialize)]
pub struct PhaseView {
    pub name: String,
    pub completed: bool,
}

impl TaskPromptContext {
    /// Build the context from a work item and recent iteration notes
    pub fn from_work_item(item: &WorkItem, notes: &[String]) -> Self {
        Self {
            ticket_id: item.id.clone(),
            title: item.title.clone(),
            current_phase: item.current_phase().map(|p| p.name.clone()).unwrap_or_default(),
            phases: item
                .phases
                .iter()
                .map(|p| PhaseView {
                    name: p.name.clone(),
                    completed: p.completed,
                })
                .collect(),
            validation_commands: item.validation_commands.clone(),
            notes: notes.to_vec(),
            raw: item.raw.clone(),
        }
    }
}

/// Context for the review-fix prompt
#[derive(Debug, Clone, Serialize)]
pub struct FixPromptContext {
    pub ticket_id: String,
    pub title: String,
    pub issues: Vec<Issue>,
}

/// Context for the plan scaffold
#[derive(Debug, Clone, Serialize)]
pub struct PlanContext {
    pub title: String,
    pub description: String,
    pub phases: Vec<String>,
}

/// Template registry over the embedded prompts
pub struct PromptLoader {
    registry: Handlebars<'static>,
}

impl PromptLoader {
    /// Register all embedded templates
    ///
    /// A registration failure is a fatal config error: the binary refuses
    /// to start rather than fail mid-loop.
    pub fn new() -> Result<Self> {
        debug!("PromptLoader::new: called");
        let mut registry = Handlebars::new();
        registry.register_escape_fn(handlebars::no_escape);
        for name in TEMPLATE_NAMES {
            let template = embedded::get_embedded(name).expect("embedded template registered");
            registry
                .register_template_string(name, template)
                .context(format!("failed to register template '{}'", name))?;
        }
        Ok(Self { registry })
    }

    /// Render a registered template with the given context
    pub fn render<T: Serialize>(&self, name: &str, context: &T) -> Result<String> {
        debug!(%name, "render: called");
        self.registry
            .render(name, context)
            .context(format!("failed to render template '{}'", name))
    }

    /// Render the right task prompt for a work item
    pub fn render_task(&self, item: &WorkItem, notes: &[String]) -> Result<String> {
        let context = TaskPromptContext::from_work_item(item, notes);
        let name = if item.phases.is_empty() { "task-phaseless" } else { "task-phased" };
        debug!(template = %name, "render_task: selected template");
        self.render(name, &context)
    }

    /// Render the review-fix prompt with the current issue list
    pub fn render_review_fix(&self, item: &WorkItem, issues: &[Issue]) -> Result<String> {
        let context = FixPromptContext {
            ticket_id: item.id.clone(),
            title: item.title.clone(),
            issues: issues.to_vec(),
        };
        self.render("review-fix", &context)
    }

    /// Render the plan scaffold for `plan create`
    pub fn render_plan(&self, title: &str, description: &str, phases: &[String]) -> Result<String> {
        let context = PlanContext {
            title: title.to_string(),
            description: description.to_string(),
            phases: phases.to_vec(),
        };
        self.render("plan", &context)
    }
}
