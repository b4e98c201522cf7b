//! AnthropicAgent -- [`AgentPromptExecutor`] backed by the Anthropic Messages API.
//!
//! Each prompt is sent as a single user message to `/v1/messages`. Node
//! options choose the model and add the working directory to the system
//! prompt. The API key is wrapped in [`SecretString`] and only exposed when
//! building request headers.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use stepwise_core::workflow::agent::{
    AgentError, AgentPromptExecutor, AgentPromptOptions, AgentPromptResponse, BoxFuture,
};
use stepwise_types::config::AgentConfig;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct Message {
    role: &'static str,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
struct Usage {
    input_tokens: u64,
    output_tokens: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Clone, Deserialize)]
struct ErrorBody {
    message: String,
}

// ---------------------------------------------------------------------------
// AnthropicAgent
// ---------------------------------------------------------------------------

/// Agent prompt executor for Anthropic Claude.
///
/// Deliberately not `Debug`: it holds the API key.
pub struct AnthropicAgent {
    client: reqwest::Client,
    api_key: SecretString,
    base_url: String,
    model: String,
    max_tokens: u32,
}

impl AnthropicAgent {
    /// The Anthropic API version header value.
    const API_VERSION: &'static str = "2023-06-01";

    pub fn new(api_key: SecretString, config: &AgentConfig) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| AgentError::Request(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        })
    }

    /// Read the key from the environment variable named by `config.api_key_env`.
    pub fn from_env(config: &AgentConfig) -> Result<Self, AgentError> {
        let key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| AgentError::MissingApiKey(config.api_key_env.clone()))?;
        Self::new(SecretString::from(key), config)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn build_request(&self, prompt: &str, options: &AgentPromptOptions) -> MessagesRequest {
        let system = options
            .working_directory
            .as_ref()
            .map(|dir| format!("You are executing a workflow node. Working directory: {dir}"));

        MessagesRequest {
            model: options.model.clone().unwrap_or_else(|| self.model.clone()),
            max_tokens: self.max_tokens,
            messages: vec![Message {
                role: "user",
                content: prompt.to_string(),
            }],
            system,
        }
    }

    async fn send(
        &self,
        prompt: &str,
        options: &AgentPromptOptions,
    ) -> Result<AgentPromptResponse, AgentError> {
        let body = self.build_request(prompt, options);
        tracing::debug!(
            model = body.model.as_str(),
            prompt_chars = prompt.len(),
            max_turns = ?options.max_turns,
            "sending agent prompt"
        );

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", Self::API_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::Request(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| AgentError::Request(format!("failed to read response body: {e}")))?;

        if !status.is_success() {
            return Err(AgentError::Api {
                status: status.as_u16(),
                message: api_error_message(&text),
            });
        }
        parse_response(&text)
    }
}

impl AgentPromptExecutor for AnthropicAgent {
    fn execute_agent_prompt<'a>(
        &'a self,
        prompt: &'a str,
        options: &'a AgentPromptOptions,
    ) -> BoxFuture<'a, Result<AgentPromptResponse, AgentError>> {
        Box::pin(self.send(prompt, options))
    }
}

/// Concatenate text blocks and pick up token usage.
fn parse_response(body: &str) -> Result<AgentPromptResponse, AgentError> {
    let parsed: MessagesResponse = serde_json::from_str(body)
        .map_err(|e| AgentError::InvalidResponse(format!("failed to parse response: {e}")))?;

    let content = parsed
        .content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(text.as_str()),
            ContentBlock::Other => None,
        })
        .collect::<Vec<_>>()
        .join("");

    Ok(AgentPromptResponse {
        content,
        prompt_tokens: parsed.usage.as_ref().map(|u| u.input_tokens),
        completion_tokens: parsed.usage.as_ref().map(|u| u.output_tokens),
    })
}

fn api_error_message(body: &str) -> String {
    serde_json::from_str::<ErrorEnvelope>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| body.to_string())
}
