//! Fix Applier: writes a suggested set of whole-file changes into the
//! repository checkout.
//!
//! Automated fixes never delete files. A `delete` change is reported as
//! skipped regardless of the dry-run flag, and a dry run performs no
//! filesystem mutation at all.

use std::path::{Component, Path, PathBuf};

use autoheal_core::{FixAction, FixChange};
use serde::Serialize;
use tracing::{info, warn};

/// Why a change was not written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    DeleteNotAllowed,
    MissingContent,
    DryRun,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedChange {
    pub path: String,
    pub action: FixAction,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplyFailure {
    pub path: String,
    pub error: String,
}

/// Per-file outcome of one `apply` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    /// Paths written, relative to the repository root, in request order.
    pub applied: Vec<PathBuf>,
    pub skipped: Vec<SkippedChange>,
    pub failures: Vec<ApplyFailure>,
}

impl ApplyReport {
    /// The batch counts as applied unless every attempted write failed.
    pub fn succeeded(&self) -> bool {
        self.failures.is_empty() || !self.applied.is_empty()
    }
}

pub struct FixApplier {
    repo_root: PathBuf,
}

impl FixApplier {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
        }
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    /// Apply `changes` in order. One failing write does not stop the rest.
    pub async fn apply(&self, changes: &[FixChange], dry_run: bool) -> ApplyReport {
        let mut report = ApplyReport::default();

        for change in changes {
            let relative = match self.resolve(&change.path) {
                Ok(relative) => relative,
                Err(error) => {
                    warn!("Refusing to apply change to {}: {}", change.path, error);
                    report.failures.push(ApplyFailure {
                        path: change.path.clone(),
                        error,
                    });
                    continue;
                }
            };

            if change.action == FixAction::Delete {
                info!(
                    "Skipping delete of {}: automated fixes never delete files",
                    relative.display()
                );
                report.skipped.push(skipped(change, SkipReason::DeleteNotAllowed));
                continue;
            }

            let Some(content) = change.content.as_deref() else {
                warn!(
                    "Skipping {} of {}: no content supplied",
                    change.action,
                    relative.display()
                );
                report.skipped.push(skipped(change, SkipReason::MissingContent));
                continue;
            };

            if dry_run {
                info!(
                    "[dry run] Would {} {} ({} bytes)",
                    change.action,
                    relative.display(),
                    content.len()
                );
                report.skipped.push(skipped(change, SkipReason::DryRun));
                continue;
            }

            match self.write(&relative, content).await {
                Ok(()) => {
                    info!("Applied {} to {}", change.action, relative.display());
                    report.applied.push(relative);
                }
                Err(e) => {
                    warn!("Failed to write {}: {}", relative.display(), e);
                    report.failures.push(ApplyFailure {
                        path: change.path.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        report
    }

    async fn write(&self, relative: &Path, content: &str) -> std::io::Result<()> {
        let target = self.repo_root.join(relative);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, content).await
    }

    /// Normalize `raw` to a path relative to the repository root, rejecting
    /// anything that could land outside it.
    fn resolve(&self, raw: &str) -> Result<PathBuf, String> {
        let path = Path::new(raw);
        let relative = if path.is_absolute() {
            path.strip_prefix(&self.repo_root)
                .map_err(|_| "absolute path outside the repository root".to_string())?
        } else {
            path
        };

        let mut clean = PathBuf::new();
        for component in relative.components() {
            match component {
                Component::Normal(segment) => clean.push(segment),
                Component::CurDir => {}
                Component::ParentDir => {
                    return Err("path contains '..'".to_string());
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err("absolute path outside the repository root".to_string());
                }
            }
        }

        if clean.as_os_str().is_empty() {
            return Err("empty path".to_string());
        }
        Ok(clean)
    }
}

fn skipped(change: &FixChange, reason: SkipReason) -> SkippedChange {
    SkippedChange {
        path: change.path.clone(),
        action: change.action,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(path: &str, action: FixAction, content: Option<&str>) -> FixChange {
        FixChange {
            path: path.to_string(),
            action,
            content: content.map(str::to_string),
        }
    }

    /// Every file under `root`, with contents, for before/after comparison.
    fn snapshot(root: &Path) -> Vec<(PathBuf, Vec<u8>)> {
        let mut files = Vec::new();
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            for entry in std::fs::read_dir(&dir).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    let contents = std::fs::read(&path).unwrap();
                    files.push((path, contents));
                }
            }
        }
        files.sort();
        files
    }

    #[tokio::test]
    async fn test_create_and_modify_write_full_contents() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("README.md"), "old").unwrap();
        let applier = FixApplier::new(dir.path());

        let report = applier
            .apply(
                &[
                    change("src/deep/new.rs", FixAction::Create, Some("fn new() {}")),
                    change("README.md", FixAction::Modify, Some("new")),
                ],
                false,
            )
            .await;

        assert!(report.failures.is_empty());
        assert_eq!(
            report.applied,
            vec![PathBuf::from("src/deep/new.rs"), PathBuf::from("README.md")]
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("src/deep/new.rs")).unwrap(),
            "fn new() {}"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("README.md")).unwrap(),
            "new"
        );
    }

    #[tokio::test]
    async fn test_delete_never_removes_file() {
        for dry_run in [false, true] {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join("keep.txt"), "precious").unwrap();
            let before = snapshot(dir.path());

            let report = FixApplier::new(dir.path())
                .apply(&[change("keep.txt", FixAction::Delete, None)], dry_run)
                .await;

            assert_eq!(snapshot(dir.path()), before);
            assert_eq!(report.skipped.len(), 1);
            assert_eq!(report.skipped[0].reason, SkipReason::DeleteNotAllowed);
        }
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        let before = snapshot(dir.path());

        let report = FixApplier::new(dir.path())
            .apply(
                &[
                    change("a.txt", FixAction::Modify, Some("changed")),
                    change("new/b.txt", FixAction::Create, Some("b")),
                ],
                true,
            )
            .await;

        assert_eq!(snapshot(dir.path()), before);
        assert!(!dir.path().join("new").exists());
        assert!(report.applied.is_empty());
        assert!(report
            .skipped
            .iter()
            .all(|s| s.reason == SkipReason::DryRun));
        assert!(report.succeeded());
    }

    #[tokio::test]
    async fn test_escaping_paths_fail_without_stopping_batch() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        std::fs::create_dir(&repo).unwrap();

        let report = FixApplier::new(&repo)
            .apply(
                &[
                    change("../outside.txt", FixAction::Create, Some("x")),
                    change("/etc/autoheal-test", FixAction::Create, Some("x")),
                    change("ok.txt", FixAction::Create, Some("ok")),
                ],
                false,
            )
            .await;

        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.applied, vec![PathBuf::from("ok.txt")]);
        assert!(!dir.path().join("outside.txt").exists());
        assert!(report.succeeded());
    }

    #[tokio::test]
    async fn test_absolute_path_inside_root_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let absolute = dir.path().join("src").join("lib.rs");

        let report = FixApplier::new(dir.path())
            .apply(
                &[change(
                    absolute.to_str().unwrap(),
                    FixAction::Create,
                    Some("// lib"),
                )],
                false,
            )
            .await;

        assert_eq!(report.applied, vec![PathBuf::from("src/lib.rs")]);
        assert!(absolute.exists());
    }

    #[tokio::test]
    async fn test_missing_content_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let report = FixApplier::new(dir.path())
            .apply(&[change("a.txt", FixAction::Modify, None)], false)
            .await;

        assert_eq!(report.skipped[0].reason, SkipReason::MissingContent);
        assert!(!dir.path().join("a.txt").exists());
    }

    #[tokio::test]
    async fn test_all_writes_failing_is_not_success() {
        let dir = tempfile::tempdir().unwrap();
        let report = FixApplier::new(dir.path())
            .apply(&[change("../x", FixAction::Create, Some("x"))], false)
            .await;
        assert!(!report.succeeded());
    }
}
