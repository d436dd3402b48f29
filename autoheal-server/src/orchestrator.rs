//! Auto-Heal Orchestrator.
//!
//! One orchestration run per failure notification:
//!
//! 1. Atomically check the retry ceiling and count the attempt
//!    ([`RetryStore::begin_attempt`]). An exhausted or resolved commit stops
//!    here without any external call.
//! 2. Fetch the failed jobs (and optionally their logs) from the CI host and
//!    build the error context.
//! 3. Ask the fix provider for a fix and gate on it having files and enough
//!    confidence.
//! 4. Apply the fix, then commit and push it unless this is a dry run or
//!    auto-apply is off.
//! 5. Record an [`AutoHealHistory`](crate::store::AutoHealHistory) row and
//!    update the attempt.
//!
//! Every external call runs under a timeout. A timed-out run still consumed
//! its attempt and is recorded with `last_error = "timeout"`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use autoheal_core::{
    commit_message, confidence_percent, create_user_prompt, derive_scope, FixSuggester,
    FixSuggestion,
};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::applier::{ApplyFailure, ApplyReport, FixApplier, SkippedChange};
use crate::context::{build_error_context, collect_referenced_files, FileLimits, JobLog};
use crate::git::Committer;
use crate::github::CiHost;
use crate::store::{
    AttemptGate, AttemptKey, AttemptStatus, AttemptUpdate, NewHistoryEntry, RetryAttempt,
    RetryStore, StoreError,
};

/// Jobs whose logs are downloaded per run.
const MAX_LOG_JOBS: usize = 3;

/// Stored as `last_error` when a run hit a timeout.
pub const TIMEOUT_ERROR: &str = "timeout";

#[derive(Debug, Clone)]
pub struct HealConfig {
    pub max_retries: u32,
    pub min_confidence: f64,
    /// Commit and push applied fixes.
    pub auto_apply: bool,
    /// Default dry-run flag for webhook-triggered runs.
    pub dry_run: bool,
    pub include_logs: bool,
    pub repo_dir: PathBuf,
    pub ci_timeout: Duration,
    pub fix_timeout: Duration,
    pub file_limits: FileLimits,
}

impl Default for HealConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            min_confidence: 0.5,
            auto_apply: true,
            dry_run: false,
            include_logs: true,
            repo_dir: PathBuf::from("."),
            ci_timeout: Duration::from_secs(60),
            fix_timeout: Duration::from_secs(300),
            file_limits: FileLimits::default(),
        }
    }
}

/// A failed workflow run, as reported by the webhook handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealTrigger {
    pub repo_owner: String,
    pub repo_name: String,
    pub commit_sha: String,
    pub workflow_run_id: u64,
    /// From the webhook payload; resolved through the CI host when absent.
    pub installation_id: Option<u64>,
    /// Failing units named by the notification itself (the workflow name for
    /// `workflow_run` events). Shown when the CI host reports no failed jobs.
    pub failed_jobs: Vec<String>,
    /// The CI host's own re-run counter for this workflow run.
    pub attempt_number: u32,
    pub dry_run: bool,
}

impl HealTrigger {
    pub fn key(&self) -> AttemptKey {
        AttemptKey::new(&self.repo_owner, &self.repo_name, &self.commit_sha)
    }
}

/// How an orchestration run ended. Gate failures are outcomes, not errors.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum HealOutcome {
    /// The retry ceiling was reached; the attempt is now `exhausted`.
    MaxRetriesExceeded { attempt_count: u32 },
    /// The commit was already healed or cancelled.
    AlreadyResolved { status: AttemptStatus },
    NoFixAvailable,
    LowConfidence { confidence: f64 },
    ApplyFailed { failures: Vec<ApplyFailure> },
    /// Every change was skipped (deletes, missing content); nothing to commit.
    NothingApplied { skipped: Vec<SkippedChange> },
    GitFailed { error: String, timed_out: bool },
    /// The fix was applied but deliberately not committed.
    Applied { dry_run: bool, report: ApplyReport },
    /// The fix was committed and pushed, or turned out to change nothing.
    Healed {
        committed: bool,
        commit_sha: Option<String>,
        confidence: f64,
    },
}

impl HealOutcome {
    /// Whether the run achieved what it set out to do.
    pub fn is_success(&self) -> bool {
        matches!(self, HealOutcome::Applied { .. } | HealOutcome::Healed { .. })
    }

    fn resolves_attempt(&self) -> bool {
        matches!(self, HealOutcome::Healed { .. })
    }

    fn failure_reason(&self, min_confidence: f64) -> Option<String> {
        match self {
            HealOutcome::NoFixAvailable => Some("no fix available".to_string()),
            HealOutcome::LowConfidence { confidence } => Some(format!(
                "confidence {}% below threshold {}%",
                confidence_percent(*confidence),
                confidence_percent(min_confidence)
            )),
            HealOutcome::ApplyFailed { failures } => Some(format!(
                "failed to apply fix: {}",
                failures
                    .iter()
                    .map(|f| format!("{}: {}", f.path, f.error))
                    .collect::<Vec<_>>()
                    .join("; ")
            )),
            HealOutcome::NothingApplied { skipped } => Some(format!(
                "fix changed no files ({} change(s) skipped)",
                skipped.len()
            )),
            HealOutcome::GitFailed { timed_out: true, .. } => Some(TIMEOUT_ERROR.to_string()),
            HealOutcome::GitFailed { error, .. } => Some(error.clone()),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HealError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("CI host request failed: {0:#}")]
    CiHost(anyhow::Error),
    #[error("fix provider request failed: {0:#}")]
    FixProvider(anyhow::Error),
    #[error("{stage} timed out after {}s", .after.as_secs())]
    Timeout {
        stage: &'static str,
        after: Duration,
    },
}

impl HealError {
    fn last_error(&self) -> String {
        match self {
            HealError::Timeout { .. } => TIMEOUT_ERROR.to_string(),
            other => other.to_string(),
        }
    }
}

/// Where the failure description of a run comes from.
enum FailureSource<'a> {
    WorkflowRun {
        ci_host: &'a dyn CiHost,
        trigger: &'a HealTrigger,
    },
    Manual {
        error_message: &'a str,
    },
}

/// What a run has gathered so far; recorded in history however it ends.
#[derive(Default)]
struct RunProgress {
    error_message: String,
    fix_prompt: Option<String>,
    fix_applied: Option<String>,
    commit_sha_before: Option<String>,
    commit_sha_after: Option<String>,
}

async fn with_timeout<T>(
    stage: &'static str,
    after: Duration,
    future: impl std::future::Future<Output = T>,
) -> Result<T, HealError> {
    tokio::time::timeout(after, future)
        .await
        .map_err(|_| HealError::Timeout { stage, after })
}

pub struct AutoHealer {
    store: Arc<dyn RetryStore>,
    ci_host: Option<Arc<dyn CiHost>>,
    suggester: Arc<dyn FixSuggester>,
    applier: FixApplier,
    committer: Arc<dyn Committer>,
    config: HealConfig,
    /// Held while a run writes to and commits from the shared checkout.
    checkout: Mutex<()>,
}

impl AutoHealer {
    pub fn new(
        store: Arc<dyn RetryStore>,
        suggester: Arc<dyn FixSuggester>,
        committer: Arc<dyn Committer>,
        config: HealConfig,
    ) -> Self {
        Self {
            store,
            ci_host: None,
            suggester,
            applier: FixApplier::new(config.repo_dir.clone()),
            committer,
            config,
            checkout: Mutex::new(()),
        }
    }

    pub fn with_ci_host(mut self, ci_host: Arc<dyn CiHost>) -> Self {
        self.ci_host = Some(ci_host);
        self
    }

    pub fn config(&self) -> &HealConfig {
        &self.config
    }

    /// Run the full algorithm for a failed workflow run.
    pub async fn handle_failure(&self, trigger: &HealTrigger) -> Result<HealOutcome, HealError> {
        let key = trigger.key();
        let ci_host = self
            .ci_host
            .clone()
            .ok_or_else(|| HealError::CiHost(anyhow!("no CI host configured")))?;

        let attempt = match self
            .store
            .begin_attempt(&key, Some(trigger.workflow_run_id), self.config.max_retries)
            .await?
        {
            AttemptGate::Started(attempt) => attempt,
            AttemptGate::Exhausted(attempt) => {
                info!(
                    "Retry limit of {} reached for {}; marked exhausted",
                    self.config.max_retries, key
                );
                return Ok(HealOutcome::MaxRetriesExceeded {
                    attempt_count: attempt.attempt_count,
                });
            }
            AttemptGate::Terminal(attempt) => {
                info!("{} is already {}; not healing", key, attempt.status);
                return Ok(HealOutcome::AlreadyResolved {
                    status: attempt.status,
                });
            }
        };

        info!(
            "Starting auto-heal attempt {}/{} for {} (workflow run {}, run attempt {})",
            attempt.attempt_count,
            self.config.max_retries,
            key,
            trigger.workflow_run_id,
            trigger.attempt_number
        );

        let source = FailureSource::WorkflowRun {
            ci_host: ci_host.as_ref(),
            trigger,
        };
        self.run(&key, &attempt, source, trigger.dry_run).await
    }

    /// Heal a commit from a caller-supplied error message.
    ///
    /// Skips the retry gate: the attempt row is created if needed but not
    /// counted, and no CI host call is made.
    pub async fn manual_trigger(
        &self,
        repo_owner: &str,
        repo_name: &str,
        commit_sha: &str,
        error_message: &str,
        dry_run: bool,
    ) -> Result<HealOutcome, HealError> {
        let key = AttemptKey::new(repo_owner, repo_name, commit_sha);
        let attempt = self.store.get_or_create(&key, None).await?;

        info!("Manual auto-heal for {}", key);
        self.run(&key, &attempt, FailureSource::Manual { error_message }, dry_run)
            .await
    }

    async fn run(
        &self,
        key: &AttemptKey,
        attempt: &RetryAttempt,
        source: FailureSource<'_>,
        dry_run: bool,
    ) -> Result<HealOutcome, HealError> {
        let started = Instant::now();
        let mut progress = RunProgress::default();

        let result = self.execute(key, source, dry_run, &mut progress).await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match &result {
            Ok(outcome) => info!("Auto-heal for {} finished: {:?}", key, outcome),
            Err(e) => error!("Auto-heal for {} failed: {}", key, e),
        }

        if let Err(store_error) = self
            .record(key, attempt, progress, &result, duration_ms)
            .await
        {
            error!("Failed to record auto-heal result for {}: {}", key, store_error);
            // The run's own error wins; a store failure is only surfaced
            // when there is nothing else to report.
            return match result {
                Err(e) => Err(e),
                Ok(_) => Err(store_error.into()),
            };
        }

        result
    }

    async fn record(
        &self,
        key: &AttemptKey,
        attempt: &RetryAttempt,
        progress: RunProgress,
        result: &Result<HealOutcome, HealError>,
        duration_ms: u64,
    ) -> Result<(), StoreError> {
        let (success, resolved, last_error) = match result {
            Ok(outcome) => (
                outcome.is_success(),
                outcome.resolves_attempt(),
                outcome.failure_reason(self.config.min_confidence),
            ),
            Err(e) => (false, false, Some(e.last_error())),
        };

        self.store
            .record_history(&NewHistoryEntry {
                retry_attempt_id: attempt.id,
                error_message: progress.error_message,
                fix_prompt: progress.fix_prompt,
                fix_applied: progress.fix_applied,
                commit_sha_before: progress.commit_sha_before,
                commit_sha_after: progress.commit_sha_after,
                success,
                duration_ms,
            })
            .await?;

        if resolved {
            let attempt = self.store.resolve(key).await?;
            if attempt.status != AttemptStatus::Success {
                info!("{} became {} during the run; status kept", key, attempt.status);
            }
        }
        if let Some(error) = last_error {
            self.store.update(key, AttemptUpdate::last_error(error)).await?;
        }
        Ok(())
    }

    async fn execute(
        &self,
        key: &AttemptKey,
        source: FailureSource<'_>,
        dry_run: bool,
        progress: &mut RunProgress,
    ) -> Result<HealOutcome, HealError> {
        let (error_context, request_context) = match source {
            FailureSource::WorkflowRun { ci_host, trigger } => {
                // Recorded even if fetching the details fails below.
                progress.error_message = format!(
                    "Workflow run {} failed for {}",
                    trigger.workflow_run_id, key
                );
                let error_context = self.fetch_error_context(ci_host, trigger).await?;
                let request_context = format!(
                    "Repository {}/{} at commit {}, workflow run {} (run attempt {}).",
                    trigger.repo_owner,
                    trigger.repo_name,
                    trigger.commit_sha,
                    trigger.workflow_run_id,
                    trigger.attempt_number
                );
                (error_context, request_context)
            }
            FailureSource::Manual { error_message } => (
                error_message.to_string(),
                format!(
                    "Repository {}/{} at commit {}, reported manually.",
                    key.repo_owner, key.repo_name, key.commit_sha
                ),
            ),
        };
        progress.error_message = error_context.clone();

        let file_contents = collect_referenced_files(
            &self.config.repo_dir,
            &error_context,
            self.config.file_limits,
        )
        .await;
        progress.fix_prompt = Some(create_user_prompt(
            &error_context,
            &file_contents,
            Some(&request_context),
        ));

        info!(
            "Requesting fix from {} with {} file(s) of context",
            self.suggester.name(),
            file_contents.len()
        );
        let suggestion = with_timeout(
            "fix suggestion",
            self.config.fix_timeout,
            self.suggester
                .generate_fix(&error_context, &file_contents, Some(&request_context)),
        )
        .await?
        .map_err(HealError::FixProvider)?;
        progress.fix_applied = Some(describe_fix(&suggestion));

        if suggestion.suggested_fix.files.is_empty() {
            info!("No fix available for {}", key);
            return Ok(HealOutcome::NoFixAvailable);
        }
        if suggestion.confidence < self.config.min_confidence {
            info!(
                "Fix for {} has confidence {}%, below the {}% threshold",
                key,
                suggestion.confidence_percent(),
                confidence_percent(self.config.min_confidence)
            );
            return Ok(HealOutcome::LowConfidence {
                confidence: suggestion.confidence,
            });
        }

        let commit = !dry_run && self.config.auto_apply;
        let repo_dir = self.config.repo_dir.as_path();
        let _checkout = self.checkout.lock().await;

        if commit {
            progress.commit_sha_before = self.head_sha(repo_dir).await;
        }

        let report = self
            .applier
            .apply(&suggestion.suggested_fix.files, dry_run)
            .await;
        if !report.succeeded() {
            return Ok(HealOutcome::ApplyFailed {
                failures: report.failures,
            });
        }
        if !dry_run && report.applied.is_empty() {
            info!(
                "Fix for {} wrote no files ({} change(s) skipped)",
                key,
                report.skipped.len()
            );
            return Ok(HealOutcome::NothingApplied {
                skipped: report.skipped,
            });
        }
        if !report.failures.is_empty() {
            warn!(
                "{} of {} change(s) failed to apply for {}",
                report.failures.len(),
                suggestion.suggested_fix.files.len(),
                key
            );
        }

        if !commit {
            info!(
                "Not committing fix for {} (dry run: {}, auto-apply: {})",
                key, dry_run, self.config.auto_apply
            );
            return Ok(HealOutcome::Applied { dry_run, report });
        }

        let scope = derive_scope(report.applied.first().map(PathBuf::as_path), repo_dir);
        let message = commit_message(&scope, &suggestion.root_cause, suggestion.confidence);
        let outcome = self.committer.commit_and_push(&message, repo_dir).await;
        if !outcome.success {
            return Ok(HealOutcome::GitFailed {
                error: outcome.error.unwrap_or_else(|| "git failed".to_string()),
                timed_out: outcome.timed_out,
            });
        }

        progress.commit_sha_after = self.head_sha(repo_dir).await;
        Ok(HealOutcome::Healed {
            committed: outcome.committed,
            commit_sha: progress.commit_sha_after.clone(),
            confidence: suggestion.confidence,
        })
    }

    async fn fetch_error_context(
        &self,
        ci_host: &dyn CiHost,
        trigger: &HealTrigger,
    ) -> Result<String, HealError> {
        let timeout = self.config.ci_timeout;
        let owner = trigger.repo_owner.as_str();
        let repo = trigger.repo_name.as_str();

        let installation_id = match trigger.installation_id {
            Some(id) => id,
            None => with_timeout(
                "installation lookup",
                timeout,
                ci_host.resolve_installation(owner, repo),
            )
            .await?
            .map_err(HealError::CiHost)?,
        };

        let details = with_timeout(
            "run details",
            timeout,
            ci_host.get_failed_run_details(installation_id, owner, repo, trigger.workflow_run_id),
        )
        .await?
        .map_err(HealError::CiHost)?;

        let mut logs = Vec::new();
        if self.config.include_logs {
            for job in details.failed_jobs.iter().take(MAX_LOG_JOBS) {
                let download = with_timeout(
                    "log download",
                    timeout,
                    ci_host.download_job_logs(installation_id, owner, repo, job.id),
                )
                .await?;
                match download {
                    Ok(log) => logs.push(JobLog {
                        job_name: job.name.clone(),
                        log,
                    }),
                    Err(e) => warn!("Continuing without logs for job {}: {:#}", job.name, e),
                }
            }
        }

        Ok(build_error_context(
            trigger.workflow_run_id,
            &details,
            &trigger.failed_jobs,
            &logs,
        ))
    }

    async fn head_sha(&self, repo_dir: &Path) -> Option<String> {
        match self.committer.head_sha(repo_dir).await {
            Ok(sha) => Some(sha),
            Err(e) => {
                warn!("Could not read HEAD in {}: {:#}", repo_dir.display(), e);
                None
            }
        }
    }
}

/// One-line description of a suggested fix for the history table.
fn describe_fix(suggestion: &FixSuggestion) -> String {
    let files = suggestion
        .suggested_fix
        .files
        .iter()
        .map(|f| format!("{} {}", f.action, f.path))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "{} [{}] ({}% confidence)",
        suggestion.suggested_fix.description,
        files,
        suggestion.confidence_percent()
    )
}
