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

pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4.1";

const CHAT_COMPLETIONS_URL: &str = "https://api.openai.com/v1/chat/completions";

/// Fix suggester backed by the OpenAI chat completions API.
#[derive(Clone)]
pub struct OpenAiFixSuggester {
    client: ClientWithMiddleware,
    api_key: String,
    model: String,
}

#[derive(Debug, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
pub struct ResponseFormat {
    #[serde(rename = "type")]
    pub format_type: String,
    pub json_schema: JsonSchema,
}

#[derive(Debug, Serialize)]
pub struct JsonSchema {
    pub name: String,
    pub strict: bool,
    pub schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
    refusal: Option<String>,
}

impl OpenAiFixSuggester {
    pub fn new(
        api_key: String,
        model: Option<String>,
        recording_logger: Option<RecordingLogger>,
    ) -> Result<Self> {
        let client = create_http_client(
            concat!("autoheal/", env!("CARGO_PKG_VERSION")),
            recording_logger,
            ServiceType::OpenAi,
        )?;

        Ok(Self {
            client,
            api_key,
            model: model.unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string()),
        })
    }

    /// Strict structured-output schema matching [`FixSuggestion`].
    ///
    /// Strict mode requires every property to be listed in `required`, so the
    /// optional file `content` is expressed as a nullable string.
    pub fn create_response_format() -> ResponseFormat {
        let file_schema = serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "action": { "type": "string", "enum": ["create", "modify", "delete"] },
                "content": { "type": ["string", "null"] }
            },
            "required": ["path", "action", "content"],
            "additionalProperties": false
        });

        ResponseFormat {
            format_type: "json_schema".to_string(),
            json_schema: JsonSchema {
                name: "AutoHealFix".to_string(),
                strict: true,
                schema: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "analysis": { "type": "string" },
                        "rootCause": { "type": "string" },
                        "suggestedFix": {
                            "type": "object",
                            "properties": {
                                "description": { "type": "string" },
                                "files": { "type": "array", "items": file_schema }
                            },
                            "required": ["description", "files"],
                            "additionalProperties": false
                        },
                        "confidence": { "type": "number" }
                    },
                    "required": ["analysis", "rootCause", "suggestedFix", "confidence"],
                    "additionalProperties": false
                }),
            },
        }
    }
}

#[async_trait]
impl FixSuggester for OpenAiFixSuggester {
    async fn generate_fix(
        &self,
        error_message: &str,
        file_contents: &BTreeMap<String, String>,
        context: Option<&str>,
    ) -> Result<FixSuggestion> {
        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: get_system_prompt(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: create_user_prompt(error_message, file_contents, context),
                },
            ],
            response_format: Self::create_response_format(),
        };

        info!(
            "Requesting fix from OpenAI model {} ({} files attached)",
            self.model,
            file_contents.len()
        );

        let response = self
            .client
            .post(CHAT_COMPLETIONS_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .body(serde_json::to_string(&request)?)
            .send()
            .await
            .context("Failed to send chat completion request")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .context("Failed to read error response body")?;
            return Err(anyhow!(
                "OpenAI Chat Completions API error: {} - {}",
                status,
                error_text
            ));
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .context("Failed to parse chat completion response")?;

        let message = completion
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message)
            .ok_or_else(|| anyhow!("OpenAI returned no choices"))?;

        if let Some(refusal) = message.refusal {
            return Err(anyhow!("OpenAI refused to suggest a fix: {}", refusal));
        }

        let content = message
            .content
            .ok_or_else(|| anyhow!("OpenAI returned an empty message"))?;

        parse_fix_suggestion(&content)
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}
