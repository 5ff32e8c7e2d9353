//! Programmator - ticket-driven coding-agent orchestrator
//!
//! CLI entry point. Logging goes to a file under the user data dir
//! because the terminal belongs to the sticky-footer writer.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result, eyre};
use tracing::{debug, info, warn};

use programmator::cli::{Cli, Command, ConfigCommand, PlanCommand};
use programmator::config::{CliOverrides, Config};
use programmator::gitio;
use programmator::interrupt::Interrupt;
use programmator::prompts::PromptLoader;
use programmator::review::Severity;
use programmator::runner::{LoopRunner, RunOutcome};
use programmator::safety::ExitReason;
use programmator::session::{Session, SessionGuard};
use programmator::term::TermWriter;
use programmator::ticket::{CommandTicketSource, PlanFileSource, StaticTicketSource, TicketSource, WorkItem};

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("programmator")
        .join("logs");
    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let level_str = cli_log_level.or(config_log_level);
    let level = match level_str.map(|s| s.to_uppercase()) {
        Some(s) => match s.as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let log_file = fs::File::create(log_dir.join("programmator.log")).context("Failed to create log file")?;
    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    config.apply_overrides(&CliOverrides {
        max_iterations: cli.max_iterations,
        stagnation_limit: cli.stagnation_limit,
        timeout: cli.timeout,
        auto_commit: cli.auto_commit,
    });

    setup_logging(cli.log_level.as_deref(), config.log_level.as_deref()).context("Failed to setup logging")?;

    let working_dir = match &cli.dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    debug!(?working_dir, "main: resolved working directory");

    let code = match cli.command {
        Command::Start { ref id } => {
            debug!(%id, "main: matched Start command");
            cmd_start(config, id, &working_dir, cli.branch.clone()).await?
        }
        Command::Run { ref prompt } => {
            debug!(prompt_len = prompt.len(), "main: matched Run command");
            cmd_run(config, prompt, &working_dir, cli.branch.clone()).await?
        }
        Command::Review { ref severities } => {
            debug!(?severities, "main: matched Review command");
            cmd_review(config, severities, &working_dir).await?
        }
        Command::Status => {
            debug!("main: matched Status command");
            cmd_status(&working_dir)
        }
        Command::Plan {
            command: PlanCommand::Create { ref description, ref output },
        } => {
            debug!(%description, "main: matched Plan Create command");
            cmd_plan_create(description, output.clone(), &working_dir)?
        }
        Command::Config {
            command: ConfigCommand::Show,
        } => {
            debug!("main: matched Config Show command");
            println!("{}", serde_yaml::to_string(&config).context("Failed to encode config")?);
            0
        }
    };

    std::process::exit(code);
}

/// Run the loop for a ticket id or plan file
async fn cmd_start(config: Config, id: &str, working_dir: &std::path::Path, branch: Option<String>) -> Result<i32> {
    debug!(%id, "cmd_start: called");

    let plan_candidate = PathBuf::from(id);
    let (source, plan_path, session_id): (Box<dyn TicketSource>, Option<PathBuf>, String) =
        if plan_candidate.is_file() {
            debug!(path = ?plan_candidate, "cmd_start: id is a plan file");
            let source = PlanFileSource::new(&plan_candidate);
            let session_id = plan_candidate
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| id.to_string());
            (Box::new(source), Some(plan_candidate), session_id)
        } else {
            debug!(%id, command = %config.ticket_command, "cmd_start: id is a ticket");
            (
                Box::new(CommandTicketSource::new(&config.ticket_command, id, working_dir)),
                None,
                id.to_string(),
            )
        };

    let branch = resolve_branch(&config, branch, &session_id);
    run_loop(config, source, &session_id, working_dir, branch, false, Vec::new(), plan_path).await
}

/// Run the loop for an ad-hoc phaseless prompt
async fn cmd_run(config: Config, prompt: &str, working_dir: &std::path::Path, branch: Option<String>) -> Result<i32> {
    debug!("cmd_run: called");
    let id = format!("run-{}", &uuid::Uuid::now_v7().simple().to_string()[..8]);
    let source = Box::new(StaticTicketSource::new(WorkItem::adhoc(&id, prompt)));
    let branch = resolve_branch(&config, branch, &id);
    run_loop(config, source, &id, working_dir, branch, false, Vec::new(), None).await
}

/// Run review (and fix passes) without a task side
async fn cmd_review(config: Config, severities: &[String], working_dir: &std::path::Path) -> Result<i32> {
    debug!(?severities, "cmd_review: called");
    if !config.review.enabled() {
        println!("No review agents configured; nothing to do.");
        return Ok(0);
    }

    let severities: Vec<Severity> = severities
        .iter()
        .map(|s| s.parse::<Severity>().map_err(|e| eyre!(e)))
        .collect::<Result<_>>()
        .context("invalid --severities value")?;

    let source = Box::new(StaticTicketSource::new(WorkItem::adhoc(
        "review",
        "review the current changes",
    )));
    run_loop(config, source, "review", working_dir, None, true, severities, None).await
}

/// Common loop setup: session file, branch, signal watcher, writer
#[allow(clippy::too_many_arguments)]
async fn run_loop(
    config: Config,
    source: Box<dyn TicketSource>,
    session_id: &str,
    working_dir: &std::path::Path,
    branch: Option<String>,
    review_only: bool,
    severities: Vec<Severity>,
    plan_path: Option<PathBuf>,
) -> Result<i32> {
    if !executor_available(&config.executor) {
        return Err(eyre!(
            "executor '{}' not found; set `executor` in the config or install it",
            config.executor
        ));
    }

    let _session = SessionGuard::acquire(working_dir, session_id)?;

    if let Some(branch) = &branch {
        info!(%branch, "run_loop: setting up branch");
        gitio::ensure_branch(working_dir, branch)
            .await
            .context(format!("failed to set up branch {}", branch))?;
    }

    let interrupt = Interrupt::new();
    let signal_interrupt = interrupt.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt signal received");
            signal_interrupt.stop();
        }
    });

    let writer = Arc::new(TermWriter::stdout());
    let mut runner = LoopRunner::new(config, source, writer, interrupt, working_dir, review_only)?
        .with_plan_path(plan_path)
        .with_severity_filter(severities);

    let outcome = runner.run().await?;
    print_summary(&outcome);
    Ok(outcome.reason.exit_code())
}

/// Whether the executor binary resolves to something runnable
///
/// A bad executor name is a fatal config error at startup, never a
/// mid-loop surprise.
fn executor_available(executor: &str) -> bool {
    let path = std::path::Path::new(executor);
    if path.is_absolute() || executor.contains('/') {
        return path.exists();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(executor).is_file()))
        .unwrap_or(false)
}

/// Work branch: explicit flag wins, else branch-prefix + id when configured
fn resolve_branch(config: &Config, flag: Option<String>, id: &str) -> Option<String> {
    if flag.is_some() {
        return flag;
    }
    if config.git.branch_prefix.is_empty() {
        return None;
    }
    Some(format!("{}{}", config.git.branch_prefix, id))
}

/// Show the active session, if any
fn cmd_status(working_dir: &std::path::Path) -> i32 {
    debug!("cmd_status: called");
    match Session::read(working_dir) {
        Some(session) if session.is_alive() => {
            println!("Active session");
            println!("  Ticket:  {}", session.ticket_id);
            println!("  PID:     {}", session.pid);
            println!("  Started: {}", session.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
            println!("  Dir:     {}", session.working_dir.display());
        }
        Some(session) => {
            debug!(pid = session.pid, "cmd_status: stale session");
            println!("No active session (stale session file for {}, pid {} gone)", session.ticket_id, session.pid);
        }
        None => {
            println!("No active session");
        }
    }
    0
}

/// Scaffold a plan file from a description
fn cmd_plan_create(description: &str, output: Option<PathBuf>, working_dir: &std::path::Path) -> Result<i32> {
    debug!(%description, "cmd_plan_create: called");

    let phases: Vec<String> = description
        .split(';')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if phases.is_empty() {
        return Err(eyre!("plan description is empty"));
    }
    let title: String = description.chars().take(60).collect();

    let loader = PromptLoader::new()?;
    let text = loader.render_plan(title.trim(), description, &phases)?;

    let path = match output {
        Some(path) => path,
        None => working_dir.join("plans").join(format!("{}.md", slugify(&title))),
    };
    if path.exists() {
        return Err(eyre!("plan file already exists: {}", path.display()));
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("failed to create plan directory")?;
    }
    fs::write(&path, text).context("failed to write plan file")?;

    println!("Plan created: {}", path.display());
    println!("Start it with: pgr start {}", path.display());
    Ok(0)
}

/// Filesystem-safe slug from a title
fn slugify(title: &str) -> String {
    let mut slug = String::new();
    let mut last_dash = true;
    for ch in title.to_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch);
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() { "plan".to_string() } else { slug }
}

/// Human summary printed after the loop ends
fn print_summary(outcome: &RunOutcome) {
    let secs = outcome.duration.as_secs();
    let duration = if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{}s", secs)
    };

    match outcome.reason {
        ExitReason::Complete => {
            println!("\n{} complete", "\u{2713}".green());
        }
        ExitReason::UserInterrupt => {
            println!("\n{} interrupted", "\u{26a0}".yellow());
        }
        ref reason => {
            println!("\n{} exited: {}", "\u{2717}".red(), reason);
        }
    }
    if let Some(message) = &outcome.message {
        println!("  {}", message);
    }
    println!("  iterations:    {}", outcome.iterations);
    println!("  files changed: {}", outcome.files_changed);
    println!("  duration:      {}", duration);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Add caching layer"), "add-caching-layer");
        assert_eq!(slugify("  Fix: the bug!  "), "fix-the-bug");
        assert_eq!(slugify("***"), "plan");
    }

    #[test]
    fn test_executor_available() {
        assert!(executor_available("/bin/sh"));
        assert!(executor_available("sh"));
        assert!(!executor_available("/definitely/not/a/binary"));
        assert!(!executor_available("definitely-not-a-real-binary-xyz"));
    }

    #[test]
    fn test_resolve_branch_flag_wins() {
        let mut config = Config::default();
        config.git.branch_prefix = "work/".to_string();
        assert_eq!(
            resolve_branch(&config, Some("feature/x".to_string()), "T-1"),
            Some("feature/x".to_string())
        );
        assert_eq!(resolve_branch(&config, None, "T-1"), Some("work/T-1".to_string()));

        config.git.branch_prefix.clear();
        assert_eq!(resolve_branch(&config, None, "T-1"), None);
    }
}
