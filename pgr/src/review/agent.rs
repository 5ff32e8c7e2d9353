//! Review agent capability
//!
//! A review agent inspects a file set and reports issues; it never edits
//! code. The validator is the same capability fed the issue list as YAML
//! and returning per-issue verdicts. Concrete variants: an executor-backed
//! agent (a child process, like the coding agent) and a scripted mock for
//! tests.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use eyre::{Context, eyre};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::interrupt::Interrupt;
use crate::invoker::{InvokeOptions, Invoker};
use crate::review::issue::Issue;

/// Input to one review invocation
///
/// Always an owned copy: parallel invocations must not share mutable
/// per-invocation state.
#[derive(Debug, Clone)]
pub struct ReviewRequest {
    pub working_dir: PathBuf,
    pub files: Vec<String>,
    /// Issue list as YAML; set only for validator invocations
    pub issues_yaml: Option<String>,
    pub timeout: Duration,
    pub interrupt: Interrupt,
}

/// Per-issue verdict returned by a validator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub id: String,
    pub verdict: String,
}

/// Structured output of one agent invocation
#[derive(Debug, Clone, Default)]
pub struct AgentReview {
    pub issues: Vec<Issue>,
    pub verdicts: Vec<Verdict>,
    pub summary: String,
}

/// The review capability
#[async_trait]
pub trait ReviewAgent: Send + Sync {
    fn name(&self) -> &str;

    /// Run one review; errors are reported, never fatal to the pipeline
    async fn review(&self, request: &ReviewRequest) -> eyre::Result<AgentReview>;
}

/// Wire shape of the fenced YAML block agents emit
#[derive(Debug, Default, Deserialize)]
struct RawReview {
    #[serde(default)]
    issues: Vec<Issue>,
    #[serde(default)]
    verdicts: Vec<Verdict>,
    #[serde(default)]
    summary: String,
}

/// Extract and parse the last fenced YAML block in agent output
///
/// Review agents are instructed to always end with a fenced block, even
/// when they found nothing. No block or a malformed block is an error so
/// the runner can tag the agent's slot instead of silently reporting zero
/// issues.
pub fn parse_agent_output(agent_name: &str, output: &str) -> eyre::Result<AgentReview> {
    debug!(%agent_name, output_len = output.len(), "parse_agent_output: called");

    let block = last_fenced_block(output).ok_or_else(|| eyre!("no structured review output"))?;
    let raw: RawReview = serde_yaml::from_str(block).context("malformed review YAML")?;

    let mut issues = raw.issues;
    for issue in &mut issues {
        if issue.agent.is_empty() {
            issue.agent = agent_name.to_string();
        }
    }

    debug!(
        %agent_name,
        issues = issues.len(),
        verdicts = raw.verdicts.len(),
        "parse_agent_output: parsed"
    );
    Ok(AgentReview {
        issues,
        verdicts: raw.verdicts,
        summary: raw.summary,
    })
}

/// The last ``` fenced block, preferring ```yaml fences
fn last_fenced_block(output: &str) -> Option<&str> {
    let mut result = None;
    let mut rest = output;
    while let Some(start) = rest.find("```") {
        let after_fence = &rest[start + 3..];
        let Some(newline) = after_fence.find('\n') else {
            break;
        };
        let body_start = newline + 1;
        let lang = after_fence[..newline].trim();
        let body = &after_fence[body_start..];
        let Some(end) = body.find("```") else {
            break;
        };
        if lang.is_empty() || lang == "yaml" || lang == "yml" {
            result = Some(&body[..end]);
        }
        rest = &body[end + 3..];
    }
    result
}

/// Review agent backed by an executor child process
pub struct ExecutorReviewAgent {
    name: String,
    invoker: Invoker,
    /// Handlebars template with `files` and `issues_yaml` variables
    prompt_template: String,
}

#[derive(Serialize)]
struct PromptVars<'a> {
    files: &'a [String],
    issues_yaml: &'a str,
}

impl ExecutorReviewAgent {
    pub fn new(name: &str, invoker: Invoker, prompt_template: &str) -> Self {
        debug!(%name, executor = %invoker.executor(), "ExecutorReviewAgent::new: called");
        Self {
            name: name.to_string(),
            invoker,
            prompt_template: prompt_template.to_string(),
        }
    }
}

#[async_trait]
impl ReviewAgent for ExecutorReviewAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn review(&self, request: &ReviewRequest) -> eyre::Result<AgentReview> {
        debug!(
            agent = %self.name,
            files = request.files.len(),
            validator = request.issues_yaml.is_some(),
            "ExecutorReviewAgent::review: called"
        );

        let vars = PromptVars {
            files: &request.files,
            issues_yaml: request.issues_yaml.as_deref().unwrap_or(""),
        };
        let prompt = handlebars::Handlebars::new()
            .render_template(&self.prompt_template, &vars)
            .context("failed to render review prompt")?;

        let opts = InvokeOptions::new(&request.working_dir, request.timeout);
        let outcome = self.invoker.invoke(&request.interrupt, &prompt, opts).await;

        if let Some(error) = outcome.error {
            warn!(agent = %self.name, %error, "ExecutorReviewAgent::review: invocation failed");
            return Err(eyre!("review agent '{}' failed: {}", self.name, error));
        }

        parse_agent_output(&self.name, &outcome.stdout)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::issue::Severity;

    #[test]
    fn test_parse_agent_output_yaml_block() {
        let output = "\
I reviewed the files.

```yaml
issues:
  - file: src/a.rs
    line: 10
    severity: high
    category: logic
    description: off by one
summary: \"one issue\"
```
";
        let review = parse_agent_output("bugs", output).unwrap();
        assert_eq!(review.issues.len(), 1);
        assert_eq!(review.issues[0].agent, "bugs");
        assert_eq!(review.issues[0].severity, Severity::High);
        assert_eq!(review.summary, "one issue");
    }

    #[test]
    fn test_parse_agent_output_last_block_wins() {
        let output = "\
```yaml
issues:
  - file: a.rs
    line: 1
    severity: low
    category: style
    description: first
```
revised:
```yaml
issues: []
summary: \"clean\"
```
";
        let review = parse_agent_output("bugs", output).unwrap();
        assert!(review.issues.is_empty());
        assert_eq!(review.summary, "clean");
    }

    #[test]
    fn test_parse_agent_output_missing_block_errors() {
        let err = parse_agent_output("bugs", "just chatter, no yaml").unwrap_err();
        assert!(err.to_string().contains("no structured review output"));
    }

    #[test]
    fn test_parse_agent_output_malformed_yaml_errors() {
        let output = "```yaml\nissues: [unclosed\n```\n";
        assert!(parse_agent_output("bugs", output).is_err());
    }

    #[test]
    fn test_parse_validator_verdicts() {
        let output = "\
```yaml
verdicts:
  - id: abc123
    verdict: valid
  - id: def456
    verdict: false_positive
```
";
        let review = parse_agent_output("validator", output).unwrap();
        assert_eq!(review.verdicts.len(), 2);
        assert_eq!(review.verdicts[1].verdict, "false_positive");
    }

    #[test]
    fn test_existing_agent_name_preserved() {
        let output = "\
```yaml
issues:
  - file: a.rs
    line: 2
    severity: info
    category: naming
    description: rename
    agent: original
```
";
        let review = parse_agent_output("other", output).unwrap();
        assert_eq!(review.issues[0].agent, "original");
    }

    #[test]
    fn test_plain_fence_accepted() {
        let output = "```\nissues: []\nsummary: ok\n```\n";
        let review = parse_agent_output("bugs", output).unwrap();
        assert!(review.issues.is_empty());
        assert_eq!(review.summary, "ok");
    }
}
