use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest_middleware::ClientWithMiddleware;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::fix::{parse_fix_suggestion, FixSuggester, FixSuggestion};
use crate::prompt::{create_user_prompt, get_system_prompt};
use crate::recording::middleware::create_http_client;
use crate::recording::{RecordingLogger, ServiceType};

pub const DEFAULT_ANTHROPIC_MODEL: &str = "claude-sonnet-4-20250514";

const MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 8192;

/// Fix suggester backed by the Anthropic messages API.
#[derive(Clone)]
pub struct AnthropicFixSuggester {
    client: ClientWithMiddleware,
    api_key: String,
    model: String,
}

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    system: String,
    messages: Vec<Message>,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
}

impl AnthropicFixSuggester {
    pub fn new(
        api_key: String,
        model: Option<String>,
        recording_logger: Option<RecordingLogger>,
    ) -> Result<Self> {
        let client = create_http_client(
            concat!("autoheal/", env!("CARGO_PKG_VERSION")),
            recording_logger,
            ServiceType::Anthropic,
        )?;

        Ok(Self {
            client,
            api_key,
            model: model.unwrap_or_else(|| DEFAULT_ANTHROPIC_MODEL.to_string()),
        })
    }
}

/// Concatenate the text blocks of a messages reply.
fn reply_text(response: MessagesResponse) -> String {
    response
        .content
        .into_iter()
        .filter(|block| block.block_type == "text")
        .filter_map(|block| block.text)
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl FixSuggester for AnthropicFixSuggester {
    async fn generate_fix(
        &self,
        error_message: &str,
        file_contents: &BTreeMap<String, String>,
        context: Option<&str>,
    ) -> Result<FixSuggestion> {
        let request = MessagesRequest {
            model: self.model.clone(),
            max_tokens: MAX_TOKENS,
            system: get_system_prompt(),
            messages: vec![Message {
                role: "user".to_string(),
                content: create_user_prompt(error_message, file_contents, context),
            }],
        };

        info!(
            "Requesting fix from Anthropic model {} ({} files attached)",
            self.model,
            file_contents.len()
        );

        let response = self
            .client
            .post(MESSAGES_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .body(serde_json::to_string(&request)?)
            .send()
            .await
            .context("Failed to send messages request")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .context("Failed to read error response body")?;
            return Err(anyhow!(
                "Anthropic Messages API error: {} - {}",
                status,
                error_text
            ));
        }

        let reply: MessagesResponse = response
            .json()
            .await
            .context("Failed to parse messages response")?;

        let text = reply_text(reply);
        if text.trim().is_empty() {
            return Err(anyhow!("Anthropic returned no text content"));
        }

        parse_fix_suggestion(&text)
    }

    fn name(&self) -> &'static str {
        "anthropic"
    }
}
