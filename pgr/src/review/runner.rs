//! Review runner
//!
//! Fans a set of review agents out over the changed files (in parallel or
//! sequentially), validates their findings through a validator agent, and
//! merges everything into one result. Agent failures fill their slot with
//! an error-tagged result; a validator outage keeps every issue (fail
//! open) so infrastructure problems never hide real bugs.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use eyre::{Context, Result};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::ReviewConfig;
use crate::interrupt::Interrupt;
use crate::invoker::Invoker;
use crate::prompts::embedded;
use crate::review::agent::{AgentReview, ExecutorReviewAgent, ReviewAgent, ReviewRequest};
use crate::review::issue::{Issue, Severity, VERDICT_FALSE_POSITIVE};

/// Result of one agent's review
#[derive(Debug, Clone)]
pub struct AgentResult {
    pub agent: String,
    pub issues: Vec<Issue>,
    pub summary: String,
    pub error: Option<String>,
    pub duration: Duration,
}

impl AgentResult {
    fn not_run(name: &str, reason: &str) -> Self {
        Self {
            agent: name.to_string(),
            issues: Vec::new(),
            summary: String::new(),
            error: Some(reason.to_string()),
            duration: Duration::ZERO,
        }
    }
}

/// Merged result of one review run
#[derive(Debug, Clone)]
pub struct RunResult {
    /// True when no issues survived filtering
    pub passed: bool,
    pub iteration: u32,
    pub total_issues: usize,
    /// Per-agent results, ordered like the configured agents
    pub agents: Vec<AgentResult>,
    pub duration: Duration,
}

impl RunResult {
    /// All surviving issues across agents
    pub fn all_issues(&self) -> Vec<Issue> {
        self.agents.iter().flat_map(|a| a.issues.iter().cloned()).collect()
    }

    /// New result keeping only issues with a severity in the set
    ///
    /// An empty set passes everything through.
    pub fn filter_by_severity(&self, severities: &[Severity]) -> RunResult {
        debug!(severities = severities.len(), "filter_by_severity: called");
        if severities.is_empty() {
            return self.clone();
        }
        let agents: Vec<AgentResult> = self
            .agents
            .iter()
            .map(|result| {
                let mut filtered = result.clone();
                filtered.issues.retain(|issue| severities.contains(&issue.severity));
                filtered
            })
            .collect();
        let total_issues = agents.iter().map(|a| a.issues.len()).sum();
        RunResult {
            passed: total_issues == 0,
            iteration: self.iteration,
            total_issues,
            agents,
            duration: self.duration,
        }
    }
}

/// Resolved agent: everything needed to construct it on first use
#[derive(Debug, Clone)]
struct AgentSpec {
    name: String,
    simplification: bool,
    executor: String,
    template: String,
}

/// Per-agent result limits, parsed from configuration
#[derive(Debug, Clone, Default)]
struct ResolvedOverride {
    max_issues: Option<usize>,
    severities: Option<Vec<Severity>>,
}

/// Drives review agents over a file set
pub struct ReviewRunner {
    specs: Vec<AgentSpec>,
    parallel: bool,
    overrides: HashMap<String, ResolvedOverride>,
    /// Agents constructed on first use, reused afterwards; access serialized
    cache: Mutex<HashMap<String, Arc<dyn ReviewAgent>>>,
    validator_spec: Option<AgentSpec>,
    simplification_validator_spec: Option<AgentSpec>,
    timeout: Duration,
}

impl ReviewRunner {
    /// Build a runner from configuration
    ///
    /// Prompt files are read here; an unreadable prompt is a fatal config
    /// error and the binary refuses to start.
    pub fn from_config(review: &ReviewConfig, default_executor: &str, timeout: Duration) -> Result<Self> {
        debug!(
            agents = review.agents.len(),
            parallel = review.parallel,
            "ReviewRunner::from_config: called"
        );

        let executor_for = |agent_executor: &Option<String>| {
            agent_executor
                .clone()
                .or_else(|| review.executor.clone())
                .unwrap_or_else(|| default_executor.to_string())
        };

        let mut specs = Vec::with_capacity(review.agents.len());
        for agent in &review.agents {
            let template = match &agent.prompt_file {
                Some(path) => std::fs::read_to_string(path)
                    .context(format!("failed to read review prompt {}", path.display()))?,
                None => embedded::REVIEW_AGENT.to_string(),
            };
            specs.push(AgentSpec {
                name: agent.name.clone(),
                simplification: agent.simplification,
                executor: executor_for(&agent.executor),
                template,
            });
        }

        let mut overrides = HashMap::new();
        for entry in &review.overrides {
            let severities = entry.severities.as_ref().map(|names| {
                names
                    .iter()
                    .filter_map(|name| match name.parse::<Severity>() {
                        Ok(sev) => Some(sev),
                        Err(e) => {
                            warn!(agent = %entry.agent, %e, "from_config: ignoring invalid severity override");
                            None
                        }
                    })
                    .collect()
            });
            overrides.insert(
                entry.agent.clone(),
                ResolvedOverride {
                    max_issues: entry.max_issues,
                    severities,
                },
            );
        }

        let has_simplification = specs.iter().any(|s| s.simplification);
        let validator_executor = executor_for(&None);
        let validator_spec = Some(AgentSpec {
            name: "validator".to_string(),
            simplification: false,
            executor: validator_executor.clone(),
            template: embedded::VALIDATOR.to_string(),
        });
        let simplification_validator_spec = has_simplification.then(|| AgentSpec {
            name: "simplification-validator".to_string(),
            simplification: true,
            executor: validator_executor,
            template: embedded::VALIDATOR.to_string(),
        });

        Ok(Self {
            specs,
            parallel: review.parallel,
            overrides,
            cache: Mutex::new(HashMap::new()),
            validator_spec,
            simplification_validator_spec,
            timeout,
        })
    }

    /// Build a runner around pre-constructed agents (tests)
    pub fn with_agents(agents: Vec<(Arc<dyn ReviewAgent>, bool)>, parallel: bool) -> Self {
        let mut cache = HashMap::new();
        let mut specs = Vec::new();
        for (agent, simplification) in agents {
            specs.push(AgentSpec {
                name: agent.name().to_string(),
                simplification,
                executor: String::new(),
                template: String::new(),
            });
            cache.insert(agent.name().to_string(), agent);
        }
        Self {
            specs,
            parallel,
            overrides: HashMap::new(),
            cache: Mutex::new(cache),
            validator_spec: None,
            simplification_validator_spec: None,
            timeout: Duration::from_secs(60),
        }
    }

    /// Install a pre-constructed validator (tests)
    pub fn with_validator_agent(mut self, validator: Arc<dyn ReviewAgent>) -> Self {
        let spec = AgentSpec {
            name: validator.name().to_string(),
            simplification: false,
            executor: String::new(),
            template: String::new(),
        };
        self.cache
            .lock()
            .expect("agent cache lock")
            .insert(validator.name().to_string(), validator);
        self.validator_spec = Some(spec);
        self
    }

    /// Number of configured agents
    pub fn agent_count(&self) -> usize {
        self.specs.len()
    }

    /// Look the agent up in the cache, constructing it on first use
    fn agent_for(&self, spec: &AgentSpec) -> Arc<dyn ReviewAgent> {
        let mut cache = self.cache.lock().expect("agent cache lock");
        if let Some(agent) = cache.get(&spec.name) {
            return Arc::clone(agent);
        }
        debug!(name = %spec.name, executor = %spec.executor, "agent_for: constructing agent");
        let agent: Arc<dyn ReviewAgent> = Arc::new(ExecutorReviewAgent::new(
            &spec.name,
            Invoker::new(&spec.executor),
            &spec.template,
        ));
        cache.insert(spec.name.clone(), Arc::clone(&agent));
        agent
    }

    /// Run every agent over the file set and merge the results
    ///
    /// Per-agent slot ordering always matches the configured agent order,
    /// regardless of parallel scheduling.
    pub async fn run(&self, interrupt: &Interrupt, working_dir: &Path, files: &[String], iteration: u32) -> RunResult {
        let start = Instant::now();
        debug!(
            agents = self.specs.len(),
            files = files.len(),
            parallel = self.parallel,
            iteration,
            "run: called"
        );

        let mut slots: Vec<Option<AgentResult>> = self.specs.iter().map(|_| None).collect();

        if self.parallel {
            let mut set: JoinSet<(usize, AgentResult)> = JoinSet::new();
            for (idx, spec) in self.specs.iter().enumerate() {
                if interrupt.is_stopped() {
                    debug!(idx, "run: interrupt set, not dispatching further agents");
                    break;
                }
                let agent = self.agent_for(spec);
                let request = self.request_for(interrupt, working_dir, files, None);
                set.spawn(async move { (idx, run_one(agent, request).await) });
            }
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((idx, result)) => slots[idx] = Some(result),
                    Err(e) => warn!(error = %e, "run: review task panicked"),
                }
            }
        } else {
            for (idx, spec) in self.specs.iter().enumerate() {
                if interrupt.is_stopped() {
                    debug!(idx, "run: interrupt set, stopping sequential dispatch");
                    break;
                }
                let agent = self.agent_for(spec);
                let request = self.request_for(interrupt, working_dir, files, None);
                slots[idx] = Some(run_one(agent, request).await);
            }
        }

        if interrupt.is_stopped() {
            debug!("run: cancelled, discarding results");
            return RunResult {
                passed: false,
                iteration,
                total_issues: 0,
                agents: Vec::new(),
                duration: start.elapsed(),
            };
        }

        let mut agents: Vec<AgentResult> = slots
            .into_iter()
            .enumerate()
            .map(|(idx, slot)| slot.unwrap_or_else(|| AgentResult::not_run(&self.specs[idx].name, "not run")))
            .collect();

        self.apply_overrides(&mut agents);

        for result in &mut agents {
            for issue in &mut result.issues {
                issue.ensure_id();
            }
        }

        self.validate_issues(interrupt, working_dir, files, &mut agents).await;

        let total_issues = agents.iter().map(|a| a.issues.len()).sum();
        let result = RunResult {
            passed: total_issues == 0,
            iteration,
            total_issues,
            agents,
            duration: start.elapsed(),
        };
        debug!(
            total_issues = result.total_issues,
            passed = result.passed,
            "run: complete"
        );
        result
    }

    /// Per-invocation request; always an owned copy so parallel agents
    /// cannot race on shared state
    fn request_for(
        &self,
        interrupt: &Interrupt,
        working_dir: &Path,
        files: &[String],
        issues_yaml: Option<String>,
    ) -> ReviewRequest {
        ReviewRequest {
            working_dir: working_dir.to_path_buf(),
            files: files.to_vec(),
            issues_yaml,
            timeout: self.timeout,
            interrupt: interrupt.clone(),
        }
    }

    /// Truncate and severity-limit per-agent raw results
    fn apply_overrides(&self, agents: &mut [AgentResult]) {
        for result in agents.iter_mut() {
            let Some(limits) = self.overrides.get(&result.agent) else {
                continue;
            };
            if let Some(severities) = &limits.severities {
                result.issues.retain(|issue| severities.contains(&issue.severity));
            }
            if let Some(max) = limits.max_issues
                && result.issues.len() > max
            {
                debug!(agent = %result.agent, max, "apply_overrides: truncating issues");
                result.issues.truncate(max);
            }
        }
    }

    /// Run the validator(s) and drop confirmed false positives
    ///
    /// Simplification agents bypass the issue validator and get their own
    /// optional validator with the identical contract. Any validator
    /// failure keeps every issue.
    async fn validate_issues(
        &self,
        interrupt: &Interrupt,
        working_dir: &Path,
        files: &[String],
        agents: &mut [AgentResult],
    ) {
        let simplification: HashMap<&str, bool> = self
            .specs
            .iter()
            .map(|spec| (spec.name.as_str(), spec.simplification))
            .collect();

        let split = |simpl: bool, agents: &[AgentResult]| -> Vec<Issue> {
            agents
                .iter()
                .filter(|a| simplification.get(a.agent.as_str()).copied().unwrap_or(false) == simpl)
                .flat_map(|a| a.issues.iter().cloned())
                .collect()
        };

        let regular = split(false, agents);
        if !regular.is_empty()
            && let Some(spec) = &self.validator_spec
        {
            let verdicts = self.collect_verdicts(interrupt, working_dir, files, spec, &regular).await;
            apply_verdicts(agents, &simplification, false, verdicts);
        }

        let simplifications = split(true, agents);
        if !simplifications.is_empty()
            && let Some(spec) = &self.simplification_validator_spec
        {
            let verdicts = self
                .collect_verdicts(interrupt, working_dir, files, spec, &simplifications)
                .await;
            apply_verdicts(agents, &simplification, true, verdicts);
        }
    }

    /// Invoke one validator; `None` means "keep everything"
    async fn collect_verdicts(
        &self,
        interrupt: &Interrupt,
        working_dir: &Path,
        files: &[String],
        spec: &AgentSpec,
        issues: &[Issue],
    ) -> Option<HashMap<String, String>> {
        let issues_yaml = match serde_yaml::to_string(issues) {
            Ok(yaml) => yaml,
            Err(e) => {
                warn!(error = %e, "collect_verdicts: failed to encode issues");
                return None;
            }
        };

        let validator = self.agent_for(spec);
        let request = self.request_for(interrupt, working_dir, files, Some(issues_yaml));
        match validator.review(&request).await {
            Ok(AgentReview { verdicts, .. }) if !verdicts.is_empty() => {
                debug!(count = verdicts.len(), validator = %spec.name, "collect_verdicts: got verdicts");
                Some(verdicts.into_iter().map(|v| (v.id, v.verdict)).collect())
            }
            Ok(_) => {
                debug!(validator = %spec.name, "collect_verdicts: validator returned no verdicts, keeping all");
                None
            }
            Err(e) => {
                warn!(validator = %spec.name, error = %e, "collect_verdicts: validator failed, keeping all");
                None
            }
        }
    }
}

/// Annotate verdicts and drop confirmed false positives
///
/// Keep rule per original issue: drop only an explicit `false_positive`;
/// `valid`, any other value, or an absent id keeps the issue.
fn apply_verdicts(
    agents: &mut [AgentResult],
    simplification: &HashMap<&str, bool>,
    simpl: bool,
    verdicts: Option<HashMap<String, String>>,
) {
    let Some(verdicts) = verdicts else {
        return;
    };
    for result in agents.iter_mut() {
        if simplification.get(result.agent.as_str()).copied().unwrap_or(false) != simpl {
            continue;
        }
        result.issues.retain_mut(|issue| {
            let Some(id) = &issue.id else {
                return true;
            };
            match verdicts.get(id) {
                Some(verdict) => {
                    issue.verdict = Some(verdict.clone());
                    verdict != VERDICT_FALSE_POSITIVE
                }
                None => true,
            }
        });
    }
}

/// Run one agent, converting failure into an error-tagged slot
async fn run_one(agent: Arc<dyn ReviewAgent>, request: ReviewRequest) -> AgentResult {
    let start = Instant::now();
    let name = agent.name().to_string();
    debug!(agent = %name, "run_one: called");

    match agent.review(&request).await {
        Ok(review) => AgentResult {
            agent: name,
            issues: review.issues,
            summary: review.summary,
            error: None,
            duration: start.elapsed(),
        },
        Err(e) => {
            warn!(agent = %name, error = %e, "run_one: agent failed");
            AgentResult {
                agent: name,
                issues: Vec::new(),
                summary: String::new(),
                error: Some(e.to_string()),
                duration: start.elapsed(),
            }
        }
    }
}
