//! Fix-suggestion data model and the `FixSuggester` capability.
//!
//! A fix suggestion is the structured answer of the fix-generation model:
//! an analysis of the failure, the root cause, a list of whole-file changes
//! and a self-reported confidence between 0 and 1.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Scope used in commit messages when no file was changed.
pub const DEFAULT_SCOPE: &str = "core";

/// What a suggested change does to its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FixAction {
    Create,
    Modify,
    Delete,
}

impl fmt::Display for FixAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FixAction::Create => write!(f, "create"),
            FixAction::Modify => write!(f, "modify"),
            FixAction::Delete => write!(f, "delete"),
        }
    }
}

/// One whole-file change proposed by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixChange {
    pub path: String,
    pub action: FixAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestedFix {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub files: Vec<FixChange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixSuggestion {
    #[serde(default)]
    pub analysis: String,
    #[serde(default)]
    pub root_cause: String,
    pub suggested_fix: SuggestedFix,
    pub confidence: f64,
}

impl FixSuggestion {
    /// Confidence as a whole percentage, e.g. `0.8` -> `80`.
    pub fn confidence_percent(&self) -> u32 {
        confidence_percent(self.confidence)
    }
}

/// Capability of turning a failure description into a fix suggestion.
///
/// Implemented once per model provider; the concrete provider is chosen at
/// start-up (see [`crate::provider::create_fix_suggester`]).
#[async_trait]
pub trait FixSuggester: Send + Sync {
    async fn generate_fix(
        &self,
        error_message: &str,
        file_contents: &BTreeMap<String, String>,
        context: Option<&str>,
    ) -> Result<FixSuggestion>;

    /// Short provider name for logs.
    fn name(&self) -> &'static str;
}

/// Parse a model reply into a [`FixSuggestion`].
///
/// Accepts bare JSON or JSON wrapped in prose or a Markdown code fence.
/// Confidence is clamped into `[0, 1]`; a NaN confidence is treated as 0.
pub fn parse_fix_suggestion(text: &str) -> Result<FixSuggestion> {
    let start = text
        .find('{')
        .ok_or_else(|| anyhow!("Fix response contains no JSON object"))?;
    let end = text
        .rfind('}')
        .ok_or_else(|| anyhow!("Fix response contains no JSON object"))?;
    if end < start {
        return Err(anyhow!("Fix response contains no JSON object"));
    }

    let mut suggestion: FixSuggestion = serde_json::from_str(&text[start..=end])
        .context("Failed to parse fix suggestion JSON")?;

    suggestion.confidence = if suggestion.confidence.is_nan() {
        0.0
    } else {
        suggestion.confidence.clamp(0.0, 1.0)
    };

    Ok(suggestion)
}

pub fn confidence_percent(confidence: f64) -> u32 {
    (confidence.clamp(0.0, 1.0) * 100.0).round() as u32
}

/// Commit scope: the first path segment of `first_changed`, relative to
/// `repo_root`, or [`DEFAULT_SCOPE`] when nothing changed.
pub fn derive_scope(first_changed: Option<&Path>, repo_root: &Path) -> String {
    let Some(path) = first_changed else {
        return DEFAULT_SCOPE.to_string();
    };

    let relative = path.strip_prefix(repo_root).unwrap_or(path);

    relative
        .components()
        .find_map(|component| match component {
            Component::Normal(segment) => Some(segment.to_string_lossy().into_owned()),
            _ => None,
        })
        .unwrap_or_else(|| DEFAULT_SCOPE.to_string())
}

/// Commit message recorded for an automated repair.
pub fn commit_message(scope: &str, root_cause: &str, confidence: f64) -> String {
    format!(
        "fix({}): auto-heal pipeline failure\n\n{}\n\nAuto-generated fix with {}% confidence.",
        scope,
        root_cause.trim(),
        confidence_percent(confidence)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::path::PathBuf;

    #[test]
    fn test_parse_bare_json() {
        let text = r#"{
            "analysis": "The test imports a missing module",
            "rootCause": "utils/format.ts was renamed",
            "suggestedFix": {
                "description": "Update the import",
                "files": [
                    {"path": "src/app.ts", "action": "modify", "content": "import x from './x';"},
                    {"path": "old.ts", "action": "delete"}
                ]
            },
            "confidence": 0.8
        }"#;

        let suggestion = parse_fix_suggestion(text).unwrap();

        assert_eq!(suggestion.root_cause, "utils/format.ts was renamed");
        assert_eq!(suggestion.suggested_fix.files.len(), 2);
        assert_eq!(suggestion.suggested_fix.files[0].action, FixAction::Modify);
        assert_eq!(suggestion.suggested_fix.files[1].action, FixAction::Delete);
        assert_eq!(suggestion.suggested_fix.files[1].content, None);
        assert_eq!(suggestion.confidence_percent(), 80);
    }

    #[test]
    fn test_parse_fenced_json_with_prose() {
        let text = "Here is the fix:\n```json\n{\"analysis\":\"a\",\"rootCause\":\"b\",\"suggestedFix\":{\"description\":\"c\",\"files\":[]},\"confidence\":0.3}\n```\n";
        let suggestion = parse_fix_suggestion(text).unwrap();
        assert!(suggestion.suggested_fix.files.is_empty());
        assert_eq!(suggestion.confidence, 0.3);
    }

    #[test]
    fn test_parse_clamps_confidence() {
        let text = r#"{"suggestedFix":{"files":[]},"confidence":1.7}"#;
        assert_eq!(parse_fix_suggestion(text).unwrap().confidence, 1.0);

        let text = r#"{"suggestedFix":{"files":[]},"confidence":-2}"#;
        assert_eq!(parse_fix_suggestion(text).unwrap().confidence, 0.0);
    }

    #[test]
    fn test_parse_rejects_non_json() {
        assert!(parse_fix_suggestion("I could not find a fix.").is_err());
        assert!(parse_fix_suggestion("} nothing {").is_err());
    }

    #[test]
    fn test_commit_message_template() {
        let message = commit_message("src", "Missing import of `HashMap`", 0.8);

        insta::assert_snapshot!(message, @r"
        fix(src): auto-heal pipeline failure

        Missing import of `HashMap`

        Auto-generated fix with 80% confidence.
        ");
    }

    #[test]
    fn test_scope_is_first_segment_relative_to_root() {
        let root = PathBuf::from("/work/repo");
        assert_eq!(
            derive_scope(Some(Path::new("/work/repo/packages/api/index.ts")), &root),
            "packages"
        );
        assert_eq!(derive_scope(Some(Path::new("./src/main.rs")), &root), "src");
        assert_eq!(derive_scope(Some(Path::new("Cargo.toml")), &root), "Cargo.toml");
    }

    #[test]
    fn test_scope_falls_back_to_core() {
        let root = PathBuf::from("/work/repo");
        assert_eq!(derive_scope(None, &root), DEFAULT_SCOPE);
        assert_eq!(derive_scope(Some(Path::new("/work/repo")), &root), DEFAULT_SCOPE);
    }

    proptest! {
        #[test]
        fn prop_scope_is_top_level_segment(
            top in "[a-z][a-z0-9_-]{0,10}",
            rest in proptest::collection::vec("[a-z][a-z0-9_.-]{0,10}", 0..4),
        ) {
            let root = PathBuf::from("/repo");
            let mut path = root.join(&top);
            for segment in &rest {
                path.push(segment);
            }
            prop_assert_eq!(derive_scope(Some(&path), &root), top);
        }

        #[test]
        fn prop_confidence_percent_in_range(confidence in -5.0f64..5.0) {
            let percent = confidence_percent(confidence);
            prop_assert!(percent <= 100);
        }
    }
}
