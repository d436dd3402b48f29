use anyhow::{anyhow, bail, Context, Result};
use autoheal_core::{FixProvider, ProviderConfig};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::context::FileLimits;
use crate::git::{GitConfig, DEFAULT_AUTHOR_EMAIL, DEFAULT_AUTHOR_NAME};
use crate::orchestrator::HealConfig;

/// File name of the SQLite database inside `STATE_DIR`.
pub const STATE_DB_FILE: &str = "autoheal-state.db";

#[derive(Clone)]
pub struct GitHubAppConfig {
    pub app_id: u64,
    pub private_key: String,
}

#[derive(Clone)]
pub struct Config {
    github_app: Option<GitHubAppConfig>,
    github_webhook_secret: Option<String>,
    pub fix_provider: FixProvider,
    fix_api_key: Option<String>,
    pub fix_model: Option<String>,
    pub heal: HealConfig,
    pub git: GitConfig,
    pub port: u16,
    pub recording_enabled: bool,
    pub recording_log_path: String,
    /// Directory for persistent state (SQLite database).
    /// Defaults to current working directory.
    pub state_dir: PathBuf,
    /// Optional bearer token for /status endpoint authentication.
    /// If not set, /status endpoint is disabled (returns 403 Forbidden).
    pub status_auth_token: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    ///
    /// Credentials are optional here so the CLI can load the same
    /// configuration without a GitHub App; the accessors below fail with a
    /// descriptive error when a component needs a value that is missing.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let github_app = match lookup("GITHUB_APP_ID") {
            Some(app_id) => {
                let app_id = app_id
                    .parse::<u64>()
                    .context("GITHUB_APP_ID must be a valid number")?;
                let private_key = lookup("GITHUB_PRIVATE_KEY")
                    .context("GITHUB_PRIVATE_KEY is required when GITHUB_APP_ID is set")?
                    .replace("\\n", "\n");
                Some(GitHubAppConfig {
                    app_id,
                    private_key,
                })
            }
            None => None,
        };

        let github_webhook_secret = lookup("GITHUB_WEBHOOK_SECRET").filter(|s| !s.is_empty());

        let fix_provider = match lookup("FIX_PROVIDER") {
            Some(provider) => provider.parse::<FixProvider>()?,
            None => FixProvider::OpenAi,
        };
        let fix_api_key = match fix_provider {
            FixProvider::OpenAi => lookup("OPENAI_API_KEY"),
            FixProvider::Anthropic => lookup("ANTHROPIC_API_KEY"),
        }
        .filter(|s| !s.trim().is_empty());
        let fix_model = lookup("FIX_MODEL").filter(|s| !s.trim().is_empty());

        let min_confidence = parse_or(&lookup, "MIN_CONFIDENCE", 0.5_f64)?;
        if !(0.0..=1.0).contains(&min_confidence) {
            bail!("MIN_CONFIDENCE must be between 0 and 1, got {}", min_confidence);
        }

        let heal = HealConfig {
            max_retries: parse_or(&lookup, "MAX_RETRIES", 3_u32)?,
            min_confidence,
            auto_apply: parse_or(&lookup, "AUTO_APPLY", true)?,
            dry_run: parse_or(&lookup, "DRY_RUN", false)?,
            include_logs: parse_or(&lookup, "INCLUDE_LOGS", true)?,
            repo_dir: lookup("REPO_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            ci_timeout: Duration::from_secs(parse_or(&lookup, "LOG_DOWNLOAD_TIMEOUT_SECS", 60)?),
            fix_timeout: Duration::from_secs(parse_or(&lookup, "FIX_TIMEOUT_SECS", 300)?),
            file_limits: FileLimits::default(),
        };

        let git = GitConfig {
            remote: lookup("GIT_REMOTE").unwrap_or_else(|| "origin".to_string()),
            branch: lookup("GIT_BRANCH").filter(|s| !s.trim().is_empty()),
            author_name: lookup("GIT_AUTHOR_NAME").unwrap_or_else(|| DEFAULT_AUTHOR_NAME.to_string()),
            author_email: lookup("GIT_AUTHOR_EMAIL")
                .unwrap_or_else(|| DEFAULT_AUTHOR_EMAIL.to_string()),
            timeout: Duration::from_secs(parse_or(&lookup, "GIT_TIMEOUT_SECS", 120)?),
        };

        let port = parse_or(&lookup, "PORT", 3000_u16)?;

        let recording_enabled = lookup("RECORDING_ENABLED")
            .and_then(|v| v.parse::<bool>().ok())
            .unwrap_or(false);

        let recording_log_path =
            lookup("RECORDING_LOG_PATH").unwrap_or_else(|| "recordings.jsonl".to_string());

        let state_dir = lookup("STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        let status_auth_token = parse_status_auth_token(lookup("STATUS_AUTH_TOKEN"));

        Ok(Config {
            github_app,
            github_webhook_secret,
            fix_provider,
            fix_api_key,
            fix_model,
            heal,
            git,
            port,
            recording_enabled,
            recording_log_path,
            state_dir,
            status_auth_token,
        })
    }

    pub fn github_app(&self) -> Result<&GitHubAppConfig> {
        self.github_app
            .as_ref()
            .ok_or_else(|| anyhow!("GITHUB_APP_ID environment variable is required"))
    }

    pub fn webhook_secret(&self) -> Result<&str> {
        self.github_webhook_secret
            .as_deref()
            .ok_or_else(|| anyhow!("GITHUB_WEBHOOK_SECRET environment variable is required"))
    }

    pub fn provider_config(&self) -> Result<ProviderConfig> {
        let key_var = match self.fix_provider {
            FixProvider::OpenAi => "OPENAI_API_KEY",
            FixProvider::Anthropic => "ANTHROPIC_API_KEY",
        };
        let api_key = self.fix_api_key.clone().ok_or_else(|| {
            anyhow!(
                "{} environment variable is required for the {} provider",
                key_var,
                self.fix_provider
            )
        })?;
        Ok(ProviderConfig {
            provider: self.fix_provider,
            api_key,
            model: self.fix_model.clone(),
        })
    }

    pub fn state_db_path(&self) -> PathBuf {
        self.state_dir.join(STATE_DB_FILE)
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("{} has an invalid value '{}'", key, value)),
        None => Ok(default),
    }
}

/// Parse STATUS_AUTH_TOKEN from an optional string value.
///
/// Returns None if the value is missing, empty, or contains only whitespace,
/// so a blank token can never authorize a request.
pub fn parse_status_auth_token(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.heal.max_retries, 3);
        assert_eq!(config.heal.min_confidence, 0.5);
        assert!(config.heal.auto_apply);
        assert!(!config.heal.dry_run);
        assert_eq!(config.heal.fix_timeout, Duration::from_secs(300));
        assert_eq!(config.git.remote, "origin");
        assert_eq!(config.git.author_name, "autoheal[bot]");
        assert_eq!(config.port, 3000);
        assert_eq!(config.fix_provider, FixProvider::OpenAi);
        assert_eq!(config.state_db_path(), PathBuf::from("./autoheal-state.db"));
        assert!(config.github_app().is_err());
        assert!(config.webhook_secret().is_err());
        assert!(config.provider_config().is_err());
    }

    #[test]
    fn test_github_app_and_private_key_escapes() {
        let config = config_from(&[
            ("GITHUB_APP_ID", "1234"),
            ("GITHUB_PRIVATE_KEY", "-----BEGIN-----\\nabc\\n-----END-----"),
            ("GITHUB_WEBHOOK_SECRET", "shh"),
        ])
        .unwrap();
        let app = config.github_app().unwrap();
        assert_eq!(app.app_id, 1234);
        assert_eq!(app.private_key, "-----BEGIN-----\nabc\n-----END-----");
        assert_eq!(config.webhook_secret().unwrap(), "shh");
    }

    #[test]
    fn test_app_id_without_key_is_rejected() {
        assert!(config_from(&[("GITHUB_APP_ID", "1")]).is_err());
        assert!(config_from(&[("GITHUB_APP_ID", "abc"), ("GITHUB_PRIVATE_KEY", "k")]).is_err());
    }

    #[test]
    fn test_provider_selection() {
        let config = config_from(&[
            ("FIX_PROVIDER", "anthropic"),
            ("ANTHROPIC_API_KEY", "sk-ant"),
            ("OPENAI_API_KEY", "sk-openai"),
            ("FIX_MODEL", "claude-sonnet-4-5"),
        ])
        .unwrap();
        let provider = config.provider_config().unwrap();
        assert_eq!(provider.provider, FixProvider::Anthropic);
        assert_eq!(provider.api_key, "sk-ant");
        assert_eq!(provider.model.as_deref(), Some("claude-sonnet-4-5"));

        assert!(config_from(&[("FIX_PROVIDER", "gemini")]).is_err());
    }

    #[test]
    fn test_heal_overrides() {
        let config = config_from(&[
            ("MAX_RETRIES", "5"),
            ("MIN_CONFIDENCE", "0.8"),
            ("AUTO_APPLY", "false"),
            ("DRY_RUN", "true"),
            ("REPO_DIR", "/srv/checkout"),
            ("GIT_BRANCH", "main"),
            ("GIT_TIMEOUT_SECS", "30"),
        ])
        .unwrap();
        assert_eq!(config.heal.max_retries, 5);
        assert_eq!(config.heal.min_confidence, 0.8);
        assert!(!config.heal.auto_apply);
        assert!(config.heal.dry_run);
        assert_eq!(config.heal.repo_dir, PathBuf::from("/srv/checkout"));
        assert_eq!(config.git.branch.as_deref(), Some("main"));
        assert_eq!(config.git.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_numbers_are_rejected() {
        assert!(config_from(&[("MAX_RETRIES", "-1")]).is_err());
        assert!(config_from(&[("MIN_CONFIDENCE", "1.5")]).is_err());
        assert!(config_from(&[("MIN_CONFIDENCE", "high")]).is_err());
        assert!(config_from(&[("PORT", "99999")]).is_err());
        assert!(config_from(&[("AUTO_APPLY", "yes")]).is_err());
    }

    #[test]
    fn test_parse_status_auth_token_none() {
        assert_eq!(parse_status_auth_token(None), None);
    }

    #[test]
    fn test_parse_status_auth_token_empty_string() {
        // Empty string should be treated as unset (None)
        assert_eq!(parse_status_auth_token(Some("".to_string())), None);
    }

    #[test]
    fn test_parse_status_auth_token_whitespace_only() {
        assert_eq!(parse_status_auth_token(Some("   ".to_string())), None);
        assert_eq!(parse_status_auth_token(Some("\t\n".to_string())), None);
    }

    #[test]
    fn test_parse_status_auth_token_with_surrounding_whitespace() {
        // The filter only checks if there's non-whitespace content
        assert_eq!(
            parse_status_auth_token(Some("  token  ".to_string())),
            Some("  token  ".to_string())
        );
    }
}
