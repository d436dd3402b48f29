//! Failure context handed to the fix provider: a readable summary of what
//! failed, and the contents of the repository files it mentions.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use crate::github::RunDetails;

/// Upper bounds on the files sent alongside the error context.
#[derive(Debug, Clone, Copy)]
pub struct FileLimits {
    pub max_files: usize,
    pub max_file_bytes: u64,
    pub max_total_bytes: u64,
}

impl Default for FileLimits {
    fn default() -> Self {
        Self {
            max_files: 10,
            max_file_bytes: 100_000,
            max_total_bytes: 300_000,
        }
    }
}

/// Log tail downloaded for one failed job.
#[derive(Debug, Clone)]
pub struct JobLog {
    pub job_name: String,
    pub log: String,
}

/// Summarize a failed run: each failed job with its failed steps, then the
/// downloaded log tails.
///
/// `known_failed_jobs` is used when the CI host reported no failed jobs.
pub fn build_error_context(
    run_id: u64,
    details: &RunDetails,
    known_failed_jobs: &[String],
    logs: &[JobLog],
) -> String {
    let mut context = format!(
        "Workflow run {} concluded with {}.\n",
        run_id,
        details.conclusion.as_deref().unwrap_or("failure")
    );

    if details.failed_jobs.is_empty() {
        if known_failed_jobs.is_empty() {
            context.push_str("No failed jobs were reported.\n");
        }
        for name in known_failed_jobs {
            context.push_str(&format!("\nReported failing: {}\n", name));
        }
    }

    for job in &details.failed_jobs {
        context.push_str(&format!(
            "\nFailed job: {} ({})\n",
            job.name,
            job.conclusion.as_deref().unwrap_or("unknown")
        ));
        for step in &job.steps {
            context.push_str(&format!(
                "  Step {}: {} ({})\n",
                step.number,
                step.name,
                step.conclusion.as_deref().unwrap_or("unknown")
            ));
        }
    }

    for log in logs {
        context.push_str(&format!(
            "\n--- Log tail for job \"{}\" ---\n{}\n--- End of log ---\n",
            log.job_name,
            log.log.trim_end()
        ));
    }

    context
}

fn path_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"[A-Za-z0-9_\-./]+\.[A-Za-z0-9]{1,10}").expect("path pattern is valid")
    })
}

/// Path-like tokens in `text`, in order of first appearance.
pub fn referenced_paths(text: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for found in path_pattern().find_iter(text) {
        let candidate = found.as_str().trim_start_matches("./").trim_end_matches('.');
        if !candidate.is_empty() && !seen.iter().any(|s: &String| s == candidate) {
            seen.push(candidate.to_string());
        }
    }
    seen
}

/// Resolve `candidate` inside `repo_root`, or `None` when it would leave it.
fn contained(repo_root: &Path, candidate: &str) -> Option<PathBuf> {
    let path = Path::new(candidate);
    let relative = if path.is_absolute() {
        path.strip_prefix(repo_root).ok()?
    } else {
        path
    };

    let mut clean = PathBuf::new();
    for component in relative.components() {
        match component {
            Component::Normal(segment) => clean.push(segment),
            Component::CurDir => {}
            _ => return None,
        }
    }
    (!clean.as_os_str().is_empty()).then_some(clean)
}

/// Read the repository files mentioned in `error_context`.
///
/// Only regular UTF-8 files inside `repo_root` are returned, keyed by their
/// path relative to the root, within `limits`.
pub async fn collect_referenced_files(
    repo_root: &Path,
    error_context: &str,
    limits: FileLimits,
) -> BTreeMap<String, String> {
    let mut files = BTreeMap::new();
    let mut total_bytes = 0u64;

    for candidate in referenced_paths(error_context) {
        if files.len() >= limits.max_files {
            break;
        }
        let Some(relative) = contained(repo_root, &candidate) else {
            continue;
        };
        let key = relative.to_string_lossy().into_owned();
        if files.contains_key(&key) {
            continue;
        }

        let full = repo_root.join(&relative);
        let Ok(metadata) = tokio::fs::metadata(&full).await else {
            continue;
        };
        if !metadata.is_file()
            || metadata.len() > limits.max_file_bytes
            || total_bytes + metadata.len() > limits.max_total_bytes
        {
            debug!("Not sending {} to the fix provider", key);
            continue;
        }

        match tokio::fs::read_to_string(&full).await {
            Ok(contents) => {
                total_bytes += metadata.len();
                files.insert(key, contents);
            }
            Err(e) => debug!("Skipping {}: {}", key, e),
        }
    }

    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::{FailedJob, StepInfo};

    fn details() -> RunDetails {
        RunDetails {
            conclusion: Some("failure".to_string()),
            failed_jobs: vec![FailedJob {
                id: 7,
                name: "test".to_string(),
                conclusion: Some("failure".to_string()),
                steps: vec![StepInfo {
                    name: "cargo test".to_string(),
                    conclusion: Some("failure".to_string()),
                    number: 4,
                }],
            }],
        }
    }

    #[test]
    fn test_error_context_lists_jobs_steps_and_logs() {
        let context = build_error_context(
            99,
            &details(),
            &[],
            &[JobLog {
                job_name: "test".to_string(),
                log: "error[E0425]: cannot find value `x`\n".to_string(),
            }],
        );

        assert_eq!(
            context,
            "Workflow run 99 concluded with failure.\n\
             \n\
             Failed job: test (failure)\n  \
             Step 4: cargo test (failure)\n\
             \n\
             --- Log tail for job \"test\" ---\n\
             error[E0425]: cannot find value `x`\n\
             --- End of log ---\n"
        );
    }

    #[test]
    fn test_error_context_falls_back_to_known_jobs() {
        let empty = RunDetails {
            conclusion: None,
            failed_jobs: vec![],
        };
        let context = build_error_context(1, &empty, &["lint".to_string()], &[]);
        assert!(context.contains("Reported failing: lint"));
        assert!(!context.contains("No failed jobs"));
    }

    #[test]
    fn test_referenced_paths_extracts_file_like_tokens() {
        let text = "error: src/lib.rs:10:5 failed\n  --> ./tests/api.rs:3\nsee src/lib.rs again.";
        assert_eq!(referenced_paths(text), vec!["src/lib.rs", "tests/api.rs"]);
    }

    #[test]
    fn test_contained_rejects_escapes() {
        let root = Path::new("/repo");
        assert_eq!(contained(root, "src/a.rs"), Some(PathBuf::from("src/a.rs")));
        assert_eq!(
            contained(root, "/repo/src/a.rs"),
            Some(PathBuf::from("src/a.rs"))
        );
        assert_eq!(contained(root, "../etc/passwd"), None);
        assert_eq!(contained(root, "/etc/passwd"), None);
    }

    #[tokio::test]
    async fn test_collect_referenced_files_reads_existing_files_within_limits() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "pub fn x() {}").unwrap();
        std::fs::write(dir.path().join("big.txt"), "x".repeat(200)).unwrap();

        let files = collect_referenced_files(
            dir.path(),
            "src/lib.rs:1 broke, also big.txt and missing.rs and ../secret.txt",
            FileLimits {
                max_files: 10,
                max_file_bytes: 100,
                max_total_bytes: 1_000,
            },
        )
        .await;

        assert_eq!(files.len(), 1);
        assert_eq!(files["src/lib.rs"], "pub fn x() {}");
    }

    #[tokio::test]
    async fn test_collect_referenced_files_caps_file_count() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.rs", "b.rs", "c.rs"] {
            std::fs::write(dir.path().join(name), name).unwrap();
        }
        let files = collect_referenced_files(
            dir.path(),
            "a.rs b.rs c.rs",
            FileLimits {
                max_files: 2,
                ..FileLimits::default()
            },
        )
        .await;
        assert_eq!(files.keys().collect::<Vec<_>>(), vec!["a.rs", "b.rs"]);
    }
}
