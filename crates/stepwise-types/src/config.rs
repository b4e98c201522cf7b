//! Global configuration types for Stepwise.
//!
//! `EngineConfig` represents the top-level `config.toml` that controls engine
//! defaults (retry profile, timeouts), the agent backend, and tracing export.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the Stepwise engine.
///
/// Loaded from `~/.stepwise/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Retry profile used when neither the node nor the definition names one.
    #[serde(default = "default_retry_profile")]
    pub default_retry_profile: String,

    /// Per-node timeout when the definition does not set one.
    #[serde(default = "default_node_timeout_ms")]
    pub node_timeout_ms: u64,

    /// Per-session wall-clock budget when the definition does not set one.
    #[serde(default = "default_max_run_time_ms")]
    pub max_run_time_ms: u64,

    /// How long a driver's claim on a run stays valid without a heartbeat.
    #[serde(default = "default_lease_ttl_ms")]
    pub lease_ttl_ms: u64,

    /// Capacity of the in-process event broadcast channel.
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,

    /// Export spans to OpenTelemetry (stdout exporter).
    #[serde(default)]
    pub enable_otel: bool,

    /// Agent backend settings.
    #[serde(default)]
    pub agent: AgentConfig,
}

fn default_retry_profile() -> String {
    "balanced".to_string()
}

fn default_node_timeout_ms() -> u64 {
    300_000
}

fn default_max_run_time_ms() -> u64 {
    1_800_000
}

fn default_lease_ttl_ms() -> u64 {
    30_000
}

fn default_event_bus_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_retry_profile: default_retry_profile(),
            node_timeout_ms: default_node_timeout_ms(),
            max_run_time_ms: default_max_run_time_ms(),
            lease_ttl_ms: default_lease_ttl_ms(),
            event_bus_capacity: default_event_bus_capacity(),
            enable_otel: false,
            agent: AgentConfig::default(),
        }
    }
}

/// Settings for the Anthropic-backed agent prompt executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Model used when a node does not name one.
    #[serde(default = "default_model")]
    pub model: String,
    /// API base URL (override for proxies).
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Maximum output tokens per completion.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

fn default_base_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_api_key_env() -> String {
    "ANTHROPIC_API_KEY".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            base_url: default_base_url(),
            max_tokens: default_max_tokens(),
            api_key_env: default_api_key_env(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.default_retry_profile, "balanced");
        assert_eq!(config.node_timeout_ms, 300_000);
        assert_eq!(config.max_run_time_ms, 1_800_000);
        assert_eq!(config.lease_ttl_ms, 30_000);
        assert_eq!(config.event_bus_capacity, 1024);
        assert!(!config.enable_otel);
        assert_eq!(config.agent.api_key_env, "ANTHROPIC_API_KEY");
    }

    #[test]
    fn test_engine_config_deserialize_with_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.default_retry_profile, "balanced");
        assert_eq!(config.agent.max_tokens, 4096);
    }

    #[test]
    fn test_engine_config_deserialize_with_values() {
        let toml_str = r#"
default_retry_profile = "strict_enterprise"
node_timeout_ms = 60000
lease_ttl_ms = 5000
enable_otel = true

[agent]
model = "claude-haiku-4"
base_url = "http://localhost:8080"
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.default_retry_profile, "strict_enterprise");
        assert_eq!(config.node_timeout_ms, 60_000);
        assert_eq!(config.lease_ttl_ms, 5_000);
        assert_eq!(config.max_run_time_ms, 1_800_000);
        assert!(config.enable_otel);
        assert_eq!(config.agent.model, "claude-haiku-4");
        assert_eq!(config.agent.base_url, "http://localhost:8080");
        assert_eq!(config.agent.api_key_env, "ANTHROPIC_API_KEY");
    }
}
