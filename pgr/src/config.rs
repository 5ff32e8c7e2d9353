//! Configuration types and loading
//!
//! Layered YAML with kebab-case keys: embedded defaults < global file
//! (`~/.config/programmator/programmator.yml`) < local file
//! (`.programmator.yml` or `--config`) < CLI flags. Files are merged as
//! YAML trees before deserializing, then the result is frozen and passed
//! down by value.

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::safety::SafetyConfig;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum outer-loop iterations
    #[serde(rename = "max-iterations")]
    pub max_iterations: u32,

    /// Consecutive no-change turns before a stagnation exit (0 disables)
    #[serde(rename = "stagnation-limit")]
    pub stagnation_limit: u32,

    /// Per-invocation executor timeout in seconds
    pub timeout: u64,

    /// Executor binary for the coding agent
    pub executor: String,

    /// External command that prints ticket markdown for an id
    #[serde(rename = "ticket-command")]
    pub ticket_command: String,

    /// Log level for the file logger
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,

    /// Git workflow configuration
    pub git: GitConfig,

    /// Review pipeline configuration
    pub review: ReviewConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_iterations: 30,
            stagnation_limit: 3,
            timeout: 1800,
            executor: "claude".to_string(),
            ticket_command: "ticket".to_string(),
            log_level: None,
            git: GitConfig::default(),
            review: ReviewConfig::default(),
        }
    }
}

/// Git workflow configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    /// Commit reported files when the agent did not commit itself
    #[serde(rename = "auto-commit")]
    pub auto_commit: bool,

    /// Move finished plan files into the completed directory
    #[serde(rename = "move-completed-plans")]
    pub move_completed_plans: bool,

    /// Where finished plans go
    #[serde(rename = "completed-plans-dir")]
    pub completed_plans_dir: PathBuf,

    /// Prefix for work branches created by `start`; empty = no branch setup
    #[serde(rename = "branch-prefix")]
    pub branch_prefix: String,

    /// Base branch the review diffs changed files against
    #[serde(rename = "base-branch")]
    pub base_branch: Option<String>,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            auto_commit: false,
            move_completed_plans: false,
            completed_plans_dir: PathBuf::from("plans/completed"),
            branch_prefix: String::new(),
            base_branch: None,
        }
    }
}

/// Review pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewConfig {
    /// Maximum fix iterations per review phase
    #[serde(rename = "max-iterations")]
    pub max_iterations: u32,

    /// Fan review agents out concurrently
    pub parallel: bool,

    /// Flat list of review agents
    pub agents: Vec<ReviewAgentConfig>,

    /// Glob patterns selecting files to review; empty = all changed files
    pub include: Vec<String>,

    /// Glob patterns excluding files from review; exclude wins
    pub exclude: Vec<String>,

    /// Per-agent result overrides
    pub overrides: Vec<AgentOverride>,

    /// Executor for review agents; falls back to the main executor
    pub executor: Option<String>,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            parallel: true,
            agents: Vec::new(),
            include: Vec::new(),
            exclude: Vec::new(),
            overrides: Vec::new(),
            executor: None,
        }
    }
}

impl ReviewConfig {
    /// Review is enabled when at least one agent is configured
    pub fn enabled(&self) -> bool {
        !self.agents.is_empty()
    }
}

/// One configured review agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewAgentConfig {
    pub name: String,

    /// Prompt template file; the embedded template is used when absent
    #[serde(rename = "prompt-file")]
    pub prompt_file: Option<PathBuf>,

    /// Executor override for this agent
    pub executor: Option<String>,

    /// Simplification agents bypass the issue validator
    pub simplification: bool,
}

impl Default for ReviewAgentConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            prompt_file: None,
            executor: None,
            simplification: false,
        }
    }
}

/// Per-agent result limits applied before merging
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentOverride {
    pub agent: String,

    /// Keep at most this many issues from the agent
    #[serde(rename = "max-issues")]
    pub max_issues: Option<usize>,

    /// Keep only these severities from the agent
    pub severities: Option<Vec<String>>,
}

impl Default for AgentOverride {
    fn default() -> Self {
        Self {
            agent: String::new(),
            max_issues: None,
            severities: None,
        }
    }
}

/// CLI values that override file configuration
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub max_iterations: Option<u32>,
    pub stagnation_limit: Option<u32>,
    pub timeout: Option<u64>,
    pub auto_commit: bool,
}

impl Config {
    /// Load configuration with layered precedence
    ///
    /// `explicit` replaces the local-file layer when provided.
    pub fn load(explicit: Option<&PathBuf>) -> Result<Self> {
        debug!(?explicit, "Config::load: called");
        let mut value = serde_yaml::to_value(Config::default()).context("failed to encode default config")?;

        if let Some(global) = global_config_path()
            && global.exists()
        {
            debug!(?global, "Config::load: merging global config");
            merge_file(&mut value, &global)?;
        }

        let local = match explicit {
            Some(path) => path.clone(),
            None => PathBuf::from(".programmator.yml"),
        };
        if local.exists() {
            debug!(?local, "Config::load: merging local config");
            merge_file(&mut value, &local)?;
        } else if explicit.is_some() {
            return Err(eyre::eyre!("config file not found: {}", local.display()));
        }

        let config: Config = serde_yaml::from_value(value).context("failed to parse merged config")?;
        debug!(
            executor = %config.executor,
            max_iterations = config.max_iterations,
            review_agents = config.review.agents.len(),
            "Config::load: complete"
        );
        Ok(config)
    }

    /// Apply CLI flag overrides, the final precedence layer
    pub fn apply_overrides(&mut self, overrides: &CliOverrides) {
        debug!(?overrides, "apply_overrides: called");
        if let Some(max) = overrides.max_iterations {
            self.max_iterations = max;
        }
        if let Some(limit) = overrides.stagnation_limit {
            self.stagnation_limit = limit;
        }
        if let Some(timeout) = overrides.timeout {
            self.timeout = timeout;
        }
        if overrides.auto_commit {
            self.git.auto_commit = true;
        }
    }

    /// Safety limits derived from this configuration
    pub fn safety_config(&self) -> SafetyConfig {
        SafetyConfig {
            max_iterations: self.max_iterations,
            stagnation_limit: self.stagnation_limit,
            timeout_secs: self.timeout,
            max_review_iterations: self.review.max_iterations,
        }
    }
}

/// Global config file path under the user config dir
fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("programmator").join("programmator.yml"))
}

/// Merge one YAML file onto the accumulated tree
fn merge_file(base: &mut serde_yaml::Value, path: &Path) -> Result<()> {
    let content = fs::read_to_string(path).context(format!("failed to read config {}", path.display()))?;
    let overlay: serde_yaml::Value =
        serde_yaml::from_str(&content).context(format!("failed to parse config {}", path.display()))?;
    merge_yaml(base, overlay);
    Ok(())
}

/// Recursive YAML merge: mappings merge key-wise, everything else replaces
fn merge_yaml(base: &mut serde_yaml::Value, overlay: serde_yaml::Value) {
    match (base, overlay) {
        (serde_yaml::Value::Mapping(base_map), serde_yaml::Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_yaml(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base_slot, overlay) => *base_slot = overlay,
    }
}
