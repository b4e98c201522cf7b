//! Agent prompt executor port.
//!
//! Nodes that need model work (`agent_step`, tool-like dispatch, compensation)
//! call through [`AgentPromptExecutor`]. The trait returns boxed futures so it
//! stays object safe and can be shared as `Arc<dyn AgentPromptExecutor>`; the
//! infra layer provides the Anthropic-backed implementation.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

/// A pinned, boxed, `Send` future.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Per-call options forwarded from node configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentPromptOptions {
    #[serde(default, alias = "workingDirectory", skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, alias = "maxTurns", skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u32>,
}

/// Completion returned by the agent backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentPromptResponse {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u64>,
}

/// Errors from an agent backend. The engine treats all of them as node failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AgentError {
    #[error("agent API key not configured (set {0})")]
    MissingApiKey(String),

    #[error("agent request failed: {0}")]
    Request(String),

    #[error("agent API returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("invalid agent response: {0}")]
    InvalidResponse(String),

    #[error("{0}")]
    Other(String),
}

/// Executes a single prompt against an agent backend.
pub trait AgentPromptExecutor: Send + Sync {
    fn execute_agent_prompt<'a>(
        &'a self,
        prompt: &'a str,
        options: &'a AgentPromptOptions,
    ) -> BoxFuture<'a, Result<AgentPromptResponse, AgentError>>;
}

/// Backend used when no agent is configured: every call fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredAgent;

impl AgentPromptExecutor for UnconfiguredAgent {
    fn execute_agent_prompt<'a>(
        &'a self,
        _prompt: &'a str,
        _options: &'a AgentPromptOptions,
    ) -> BoxFuture<'a, Result<AgentPromptResponse, AgentError>> {
        Box::pin(async {
            Err(AgentError::Other(
                "no agent backend configured".to_string(),
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn unconfigured_agent_fails() {
        let agent = UnconfiguredAgent;
        let err = agent
            .execute_agent_prompt("hi", &AgentPromptOptions::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no agent backend"));
    }

    #[test]
    fn options_accept_camel_case_aliases() {
        let opts: AgentPromptOptions = serde_json::from_value(json!({
            "workingDirectory": "/tmp/work",
            "maxTurns": 3,
            "model": "claude-haiku-4"
        }))
        .unwrap();
        assert_eq!(opts.working_directory.as_deref(), Some("/tmp/work"));
        assert_eq!(opts.max_turns, Some(3));
    }
}
