//! Git Committer: stages, commits and pushes an applied fix.
//!
//! Every subprocess runs with the checkout as working directory and under a
//! per-command timeout. Failures are reported in the returned
//! [`CommitOutcome`]; the committer never retries.

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use tracing::{info, warn};

pub const DEFAULT_AUTHOR_NAME: &str = "autoheal[bot]";
pub const DEFAULT_AUTHOR_EMAIL: &str = "autoheal@users.noreply.github.com";

#[derive(Debug, Clone)]
pub struct GitConfig {
    pub remote: String,
    /// Branch to push to. `None` pushes `HEAD` to the branch of the same name.
    pub branch: Option<String>,
    pub author_name: String,
    pub author_email: String,
    pub timeout: Duration,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            remote: "origin".to_string(),
            branch: None,
            author_name: DEFAULT_AUTHOR_NAME.to_string(),
            author_email: DEFAULT_AUTHOR_EMAIL.to_string(),
            timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitOutcome {
    pub success: bool,
    /// Whether a new commit is left in the checkout. False for a clean
    /// tree, and after a failed push whose commit was undone.
    pub committed: bool,
    pub timed_out: bool,
    pub error: Option<String>,
}

impl CommitOutcome {
    pub fn no_op() -> Self {
        Self {
            success: true,
            committed: false,
            timed_out: false,
            error: None,
        }
    }

    pub fn pushed() -> Self {
        Self {
            success: true,
            committed: true,
            timed_out: false,
            error: None,
        }
    }

    fn failed(committed: bool, failure: GitFailure) -> Self {
        Self {
            success: false,
            committed,
            timed_out: matches!(failure, GitFailure::TimedOut(_)),
            error: Some(failure.to_string()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum GitFailure {
    #[error("git {0} timed out")]
    TimedOut(String),
    #[error("{0:#}")]
    Failed(anyhow::Error),
}

#[async_trait]
pub trait Committer: Send + Sync {
    /// Stage everything, commit with `message` and push. A clean tree after
    /// staging is a successful no-op.
    async fn commit_and_push(&self, message: &str, working_dir: &Path) -> CommitOutcome;

    async fn head_sha(&self, working_dir: &Path) -> Result<String>;
}

pub struct GitCommitter {
    config: GitConfig,
}

impl GitCommitter {
    pub fn new(config: GitConfig) -> Self {
        Self { config }
    }

    async fn git(&self, dir: &Path, args: &[&str]) -> Result<String, GitFailure> {
        let subcommand = args.first().copied().unwrap_or_default();

        let mut command = Command::new("git");
        command
            .args(args)
            .current_dir(dir)
            .env("GIT_AUTHOR_NAME", &self.config.author_name)
            .env("GIT_AUTHOR_EMAIL", &self.config.author_email)
            .env("GIT_COMMITTER_NAME", &self.config.author_name)
            .env("GIT_COMMITTER_EMAIL", &self.config.author_email)
            .env("GIT_TERMINAL_PROMPT", "0")
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.config.timeout, command.output())
            .await
            .map_err(|_| GitFailure::TimedOut(subcommand.to_string()))?
            .with_context(|| format!("Failed to execute git {}", subcommand))
            .map_err(GitFailure::Failed)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GitFailure::Failed(anyhow!(
                "git {} failed: {}",
                subcommand,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Committer for GitCommitter {
    async fn commit_and_push(&self, message: &str, working_dir: &Path) -> CommitOutcome {
        if let Err(failure) = self.git(working_dir, &["add", "-A"]).await {
            warn!("Staging failed: {}", failure);
            return CommitOutcome::failed(false, failure);
        }

        match self.git(working_dir, &["status", "--porcelain"]).await {
            Ok(status) if status.trim().is_empty() => {
                info!("Working tree unchanged after applying fix; nothing to commit");
                return CommitOutcome::no_op();
            }
            Ok(_) => {}
            Err(failure) => {
                warn!("git status failed: {}", failure);
                return CommitOutcome::failed(false, failure);
            }
        }

        if let Err(failure) = self.git(working_dir, &["commit", "-m", message]).await {
            warn!("Commit failed: {}", failure);
            return CommitOutcome::failed(false, failure);
        }

        let refspec = match &self.config.branch {
            Some(branch) => format!("HEAD:{}", branch),
            None => "HEAD".to_string(),
        };
        if let Err(failure) = self
            .git(working_dir, &["push", &self.config.remote, &refspec])
            .await
        {
            warn!("Push to {} failed: {}", self.config.remote, failure);
            // Leave the fix staged so the next attempt commits it again.
            let rolled_back = match self
                .git(working_dir, &["reset", "--soft", "HEAD~1"])
                .await
            {
                Ok(_) => true,
                Err(e) => {
                    warn!("Could not undo unpushed commit: {}", e);
                    false
                }
            };
            return CommitOutcome::failed(!rolled_back, failure);
        }

        info!("Pushed fix to {} ({})", self.config.remote, refspec);
        CommitOutcome::pushed()
    }

    async fn head_sha(&self, working_dir: &Path) -> Result<String> {
        let output = self
            .git(working_dir, &["rev-parse", "HEAD"])
            .await
            .map_err(|e| anyhow!("{}", e))?;
        Ok(output.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn run(dir: &Path, args: &[&str]) {
        let status = std::process::Command::new("git")
            .args(["-c", "user.name=test", "-c", "user.email=test@example.com"])
            .args(["-c", "commit.gpgsign=false"])
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(status.status.success(), "git {:?} failed", args);
    }

    /// A checkout with one commit whose `origin` is a bare repo next to it.
    fn checkout_with_remote(root: &Path) -> PathBuf {
        let remote = root.join("remote.git");
        let work = root.join("work");
        std::fs::create_dir_all(&remote).unwrap();
        std::fs::create_dir_all(&work).unwrap();
        run(&remote, &["init", "--bare", "-q"]);
        run(&work, &["init", "-q"]);
        std::fs::write(work.join("README.md"), "hello\n").unwrap();
        run(&work, &["add", "-A"]);
        run(&work, &["commit", "-q", "-m", "initial"]);
        run(
            &work,
            &["remote", "add", "origin", remote.to_str().unwrap()],
        );
        work
    }

    fn committer() -> GitCommitter {
        GitCommitter::new(GitConfig::default())
    }

    #[tokio::test]
    async fn test_clean_tree_is_successful_no_op() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let work = checkout_with_remote(dir.path());
        let before = committer().head_sha(&work).await.unwrap();

        let outcome = committer().commit_and_push("fix(core): nothing", &work).await;

        assert_eq!(outcome, CommitOutcome::no_op());
        assert_eq!(committer().head_sha(&work).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_changes_are_committed_and_pushed() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let work = checkout_with_remote(dir.path());
        let before = committer().head_sha(&work).await.unwrap();
        std::fs::write(work.join("README.md"), "fixed\n").unwrap();

        let outcome = committer()
            .commit_and_push("fix(README.md): auto-heal pipeline failure", &work)
            .await;

        assert!(outcome.success, "{:?}", outcome.error);
        assert!(outcome.committed);
        let after = committer().head_sha(&work).await.unwrap();
        assert_ne!(after, before);

        let log = std::process::Command::new("git")
            .args(["log", "-1", "--format=%an <%ae>%n%s"])
            .current_dir(&work)
            .output()
            .unwrap();
        let log = String::from_utf8_lossy(&log.stdout);
        assert!(log.contains("autoheal[bot] <autoheal@users.noreply.github.com>"));
        assert!(log.contains("fix(README.md): auto-heal pipeline failure"));
    }

    #[tokio::test]
    async fn test_push_failure_is_reported_not_raised() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let work = checkout_with_remote(dir.path());
        std::fs::write(work.join("README.md"), "fixed\n").unwrap();

        let committer = GitCommitter::new(GitConfig {
            remote: "nowhere".to_string(),
            ..GitConfig::default()
        });
        let outcome = committer.commit_and_push("fix(core): x", &work).await;

        assert!(!outcome.success);
        assert!(!outcome.committed);
        assert!(!outcome.timed_out);
        assert!(outcome.error.unwrap().contains("git push failed"));
    }

    #[tokio::test]
    async fn test_failed_push_is_not_a_no_op_next_time() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let work = checkout_with_remote(dir.path());
        let committer = GitCommitter::new(GitConfig {
            remote: "nowhere".to_string(),
            ..GitConfig::default()
        });
        let before = committer.head_sha(&work).await.unwrap();

        std::fs::write(work.join("README.md"), "fixed\n").unwrap();
        let first = committer.commit_and_push("fix(core): x", &work).await;
        assert!(!first.success);
        assert_eq!(committer.head_sha(&work).await.unwrap(), before);

        // The same fix written again must still be pushed, not skipped.
        std::fs::write(work.join("README.md"), "fixed\n").unwrap();
        let second = committer.commit_and_push("fix(core): x", &work).await;
        assert!(!second.success);
        assert!(second.error.unwrap().contains("git push failed"));
        assert_eq!(committer.head_sha(&work).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_outside_repository_fails() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let outcome = committer().commit_and_push("fix(core): x", dir.path()).await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("git add failed"));
    }
}
