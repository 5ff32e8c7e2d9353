//! Git glue
//!
//! Changed-file discovery, auto-commit, branch setup, and completed-plan
//! relocation. Shells out to git the way the rest of the tool shells out
//! to its executors; none of these failures are fatal to the loop.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use eyre::{Context, Result, eyre};
use tracing::debug;

/// Run git with args in a directory, capturing stdout
async fn git(dir: &Path, args: &[&str]) -> Result<String> {
    debug!(?dir, ?args, "git: called");
    let output = tokio::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .context("failed to run git")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(eyre!("git {} failed: {}", args.join(" "), stderr));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Files changed in the working tree, optionally also vs a base branch
///
/// Combines `git status --porcelain` (staged, unstaged, untracked) with
/// `git diff --name-only <base>...HEAD` when a base branch is given.
/// Returns an empty list outside a repository.
pub async fn changed_files(dir: &Path, base_branch: Option<&str>) -> Vec<String> {
    debug!(?dir, ?base_branch, "changed_files: called");
    let mut files = BTreeSet::new();

    match git(dir, &["status", "--porcelain"]).await {
        Ok(output) => {
            for line in output.lines() {
                if line.len() > 3 {
                    let path = line[3..].trim();
                    if !path.is_empty() {
                        files.insert(path.to_string());
                    }
                }
            }
        }
        Err(e) => {
            debug!(error = %e, "changed_files: status failed");
        }
    }

    if let Some(base) = base_branch {
        let range = format!("{}...HEAD", base);
        match git(dir, &["diff", "--name-only", &range]).await {
            Ok(output) => {
                for line in output.lines() {
                    let path = line.trim();
                    if !path.is_empty() {
                        files.insert(path.to_string());
                    }
                }
            }
            Err(e) => {
                debug!(error = %e, base, "changed_files: diff vs base failed");
            }
        }
    }

    let files: Vec<String> = files.into_iter().collect();
    debug!(count = files.len(), "changed_files: complete");
    files
}

/// Stage the given paths and commit them
pub async fn commit_files(dir: &Path, files: &[String], message: &str) -> Result<()> {
    debug!(?dir, count = files.len(), %message, "commit_files: called");
    if files.is_empty() {
        return Ok(());
    }

    let mut add_args = vec!["add", "--"];
    add_args.extend(files.iter().map(|s| s.as_str()));
    git(dir, &add_args).await?;

    git(dir, &["commit", "-m", message]).await?;
    debug!("commit_files: committed");
    Ok(())
}

/// Check out the branch, creating it when it does not exist
pub async fn ensure_branch(dir: &Path, branch: &str) -> Result<()> {
    debug!(?dir, %branch, "ensure_branch: called");
    let verify = format!("refs/heads/{}", branch);
    if git(dir, &["rev-parse", "--verify", &verify]).await.is_ok() {
        debug!(%branch, "ensure_branch: branch exists, checking out");
        git(dir, &["checkout", branch]).await?;
    } else {
        debug!(%branch, "ensure_branch: creating branch");
        git(dir, &["checkout", "-b", branch]).await?;
    }
    Ok(())
}

/// Move a finished plan file into the completed directory
pub fn move_completed_plan(plan: &Path, completed_dir: &Path) -> Result<PathBuf> {
    debug!(?plan, ?completed_dir, "move_completed_plan: called");
    std::fs::create_dir_all(completed_dir)
        .context(format!("failed to create {}", completed_dir.display()))?;

    let name = plan
        .file_name()
        .ok_or_else(|| eyre!("plan path has no file name: {}", plan.display()))?;
    let target = completed_dir.join(name);

    std::fs::rename(plan, &target).or_else(|_| {
        // Rename fails across filesystems; fall back to copy + remove.
        std::fs::copy(plan, &target)
            .and_then(|_| std::fs::remove_file(plan))
            .map(|_| ())
    })?;

    debug!(?target, "move_completed_plan: moved");
    Ok(target)
}

/// Commit message for an auto-committed iteration
pub fn auto_commit_message(iteration: u32, summary: &str) -> String {
    if summary.is_empty() {
        format!("[pgr] iteration {}", iteration)
    } else {
        format!("[pgr] iteration {}: {}", iteration, summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn init_repo(dir: &Path) {
        for args in [
            vec!["init"],
            vec!["config", "user.email", "test@example.com"],
            vec!["config", "user.name", "Test"],
        ] {
            let status = tokio::process::Command::new("git")
                .args(&args)
                .current_dir(dir)
                .output()
                .await
                .unwrap();
            assert!(status.status.success(), "git {:?} failed", args);
        }
    }

    #[tokio::test]
    async fn test_changed_files_outside_repo() {
        let dir = tempfile::tempdir().unwrap();
        let files = changed_files(dir.path(), None).await;
        assert!(files.is_empty());
    }

    #[tokio::test]
    async fn test_changed_files_sees_untracked() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path()).await;
        std::fs::write(dir.path().join("new.rs"), "fn main() {}\n").unwrap();

        let files = changed_files(dir.path(), None).await;
        assert_eq!(files, vec!["new.rs"]);
    }

    #[tokio::test]
    async fn test_commit_files() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path()).await;
        std::fs::write(dir.path().join("a.rs"), "// a\n").unwrap();

        commit_files(dir.path(), &["a.rs".to_string()], "add a.rs")
            .await
            .unwrap();

        let log = git(dir.path(), &["log", "--oneline"]).await.unwrap();
        assert!(log.contains("add a.rs"));
        let files = changed_files(dir.path(), None).await;
        assert!(files.is_empty());
    }

    #[tokio::test]
    async fn test_ensure_branch_creates_and_reuses() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path()).await;
        std::fs::write(dir.path().join("a.rs"), "// a\n").unwrap();
        commit_files(dir.path(), &["a.rs".to_string()], "init").await.unwrap();

        ensure_branch(dir.path(), "pgr/T-1").await.unwrap();
        let branch = git(dir.path(), &["rev-parse", "--abbrev-ref", "HEAD"]).await.unwrap();
        assert_eq!(branch.trim(), "pgr/T-1");

        // Second call reuses the existing branch.
        ensure_branch(dir.path(), "pgr/T-1").await.unwrap();
    }

    #[test]
    fn test_move_completed_plan() {
        let dir = tempfile::tempdir().unwrap();
        let plan = dir.path().join("plan.md");
        std::fs::write(&plan, "# P\n").unwrap();
        let completed = dir.path().join("done");

        let target = move_completed_plan(&plan, &completed).unwrap();
        assert!(!plan.exists());
        assert!(target.exists());
        assert_eq!(target, completed.join("plan.md"));
    }

    #[test]
    fn test_auto_commit_message() {
        assert_eq!(auto_commit_message(3, "fixed parser"), "[pgr] iteration 3: fixed parser");
        assert_eq!(auto_commit_message(4, ""), "[pgr] iteration 4");
    }
}
