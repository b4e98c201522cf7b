//! Application state wiring the engine to its concrete adapters.
//!
//! The engine is generic over its store; AppState pins it to the SQLite
//! repository and picks the agent backend from configuration.

use std::path::PathBuf;
use std::sync::Arc;

use stepwise_core::event::bus::EventBus;
use stepwise_core::workflow::agent::{AgentPromptExecutor, UnconfiguredAgent};
use stepwise_core::workflow::engine::WorkflowEngine;
use stepwise_infra::agent::AnthropicAgent;
use stepwise_infra::sqlite::pool::DatabasePool;
use stepwise_infra::sqlite::workflow::SqliteWorkflowRepository;
use stepwise_types::config::EngineConfig;

/// Engine pinned to the SQLite store.
pub type ConcreteEngine = WorkflowEngine<SqliteWorkflowRepository>;

/// Shared state used by every command handler.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ConcreteEngine>,
}

impl AppState {
    /// Open the database under `data_dir` and wire the engine.
    ///
    /// A missing API key is not fatal: commands that never reach an agent
    /// node still work, and agent nodes fail with a clear error.
    pub async fn init(data_dir: PathBuf, config: EngineConfig) -> anyhow::Result<Self> {
        let agent: Arc<dyn AgentPromptExecutor> = match AnthropicAgent::from_env(&config.agent) {
            Ok(agent) => {
                tracing::debug!(model = agent.model(), "using Anthropic agent backend");
                Arc::new(agent)
            }
            Err(err) => {
                tracing::warn!("{err}; agent nodes will fail");
                Arc::new(UnconfiguredAgent)
            }
        };
        Self::with_agent(data_dir, config, agent).await
    }

    pub async fn with_agent(
        data_dir: PathBuf,
        config: EngineConfig,
        agent: Arc<dyn AgentPromptExecutor>,
    ) -> anyhow::Result<Self> {
        let pool = DatabasePool::open_in(&data_dir).await.map_err(|e| {
            anyhow::anyhow!("failed to open database in {}: {e}", data_dir.display())
        })?;
        let repo = Arc::new(SqliteWorkflowRepository::new(pool));
        let event_bus = EventBus::new(config.event_bus_capacity);
        let engine = WorkflowEngine::new(repo, agent, event_bus, config)
            .map_err(|e| anyhow::anyhow!("{e}"))?;

        Ok(Self {
            engine: Arc::new(engine),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn with_agent_creates_database_in_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("nested");

        let state = AppState::with_agent(
            data_dir.clone(),
            EngineConfig::default(),
            Arc::new(UnconfiguredAgent),
        )
        .await
        .unwrap();

        assert!(data_dir.join(stepwise_infra::sqlite::pool::DATABASE_FILE).exists());
        assert_eq!(state.engine.config().default_retry_profile, "balanced");
        assert!(state.engine.definitions().list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn with_agent_rejects_unknown_retry_profile() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            default_retry_profile: "turbo".to_string(),
            ..EngineConfig::default()
        };

        let err = AppState::with_agent(dir.path().to_path_buf(), config, Arc::new(UnconfiguredAgent))
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("default_retry_profile"));
    }
}
