//! Selection of the fix-suggestion provider.
//!
//! The provider is resolved once when the service starts; callers hold an
//! `Arc<dyn FixSuggester>` and never re-resolve it per request.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tracing::info;

use crate::anthropic::AnthropicFixSuggester;
use crate::fix::FixSuggester;
use crate::openai::OpenAiFixSuggester;
use crate::recording::RecordingLogger;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixProvider {
    OpenAi,
    Anthropic,
}

impl FromStr for FixProvider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(FixProvider::OpenAi),
            "anthropic" => Ok(FixProvider::Anthropic),
            other => Err(anyhow!(
                "Unknown fix provider '{}': expected 'openai' or 'anthropic'",
                other
            )),
        }
    }
}

impl fmt::Display for FixProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FixProvider::OpenAi => write!(f, "openai"),
            FixProvider::Anthropic => write!(f, "anthropic"),
        }
    }
}

#[derive(Clone)]
pub struct ProviderConfig {
    pub provider: FixProvider,
    pub api_key: String,
    pub model: Option<String>,
}

pub fn create_fix_suggester(
    config: ProviderConfig,
    recording_logger: Option<RecordingLogger>,
) -> Result<Arc<dyn FixSuggester>> {
    info!("Using fix provider: {}", config.provider);

    let suggester: Arc<dyn FixSuggester> = match config.provider {
        FixProvider::OpenAi => Arc::new(OpenAiFixSuggester::new(
            config.api_key,
            config.model,
            recording_logger,
        )?),
        FixProvider::Anthropic => Arc::new(AnthropicFixSuggester::new(
            config.api_key,
            config.model,
            recording_logger,
        )?),
    };

    Ok(suggester)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_parsing() {
        assert_eq!("openai".parse::<FixProvider>().unwrap(), FixProvider::OpenAi);
        assert_eq!(
            " Anthropic ".parse::<FixProvider>().unwrap(),
            FixProvider::Anthropic
        );
        assert!("gemini".parse::<FixProvider>().is_err());
    }

    #[test]
    fn test_create_selects_requested_provider() {
        let suggester = create_fix_suggester(
            ProviderConfig {
                provider: FixProvider::Anthropic,
                api_key: "key".to_string(),
                model: None,
            },
            None,
        )
        .unwrap();
        assert_eq!(suggester.name(), "anthropic");

        let suggester = create_fix_suggester(
            ProviderConfig {
                provider: FixProvider::OpenAi,
                api_key: "key".to_string(),
                model: Some("gpt-4.1-mini".to_string()),
            },
            None,
        )
        .unwrap();
        assert_eq!(suggester.name(), "openai");
    }
}
