//! Durable checkpoint manager for workflow runs.
//!
//! Wraps the run repository with the operations the engine needs at each
//! node transition: appending node-run attempts, applying their single
//! terminal transition, and writing the `__runtime.checkpoint` pointer that
//! makes resume idempotent. Every write carries the driver's lease version.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use stepwise_types::error::RepositoryError;
use stepwise_types::workflow::{
    Checkpoint, NodeRun, NodeRunCompletion, NodeRunStatus, RunPatch, WorkflowRun, CHECKPOINT_KEY,
    NODE_OUTPUTS_KEY, RUNTIME_KEY,
};
use uuid::Uuid;

use crate::repository::workflow::WorkflowRunRepository;

/// Error recorded on node-runs a crashed driver left in `running`.
pub const INTERRUPTED_ATTEMPT_ERROR: &str = "attempt interrupted before completion";

// ---------------------------------------------------------------------------
// Output document helpers
// ---------------------------------------------------------------------------

fn ensure_object(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("value was just replaced with an object"),
    }
}

/// Store a node's output under `node_outputs.<node_id>`.
pub fn write_node_output(output: &mut Value, node_id: &str, node_output: Value) {
    let root = ensure_object(output);
    let outputs = root
        .entry(NODE_OUTPUTS_KEY.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    ensure_object(outputs).insert(node_id.to_string(), node_output);
}

/// Store the checkpoint under `__runtime.checkpoint`.
pub fn write_checkpoint(output: &mut Value, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
    let encoded = serde_json::to_value(checkpoint)
        .map_err(|e| CheckpointError::Serialization(e.to_string()))?;
    let root = ensure_object(output);
    let runtime = root
        .entry(RUNTIME_KEY.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    ensure_object(runtime).insert(CHECKPOINT_KEY.to_string(), encoded);
    Ok(())
}

/// Node outputs as a JSON map (for building execution contexts).
pub fn node_outputs_map(output: &Value) -> Map<String, Value> {
    output
        .get(NODE_OUTPUTS_KEY)
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

/// Next attempt number for a node: one past the highest recorded attempt.
pub fn next_attempt(node_runs: &[NodeRun], node_id: &str) -> u32 {
    node_runs
        .iter()
        .filter(|n| n.node_id == node_id)
        .map(|n| n.attempt)
        .max()
        .unwrap_or(0)
        + 1
}

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Manages durable execution checkpoints for workflow runs.
///
/// Generic over `R: WorkflowRunRepository` so it works with any storage
/// backend. Every transition is persisted before the engine moves forward.
pub struct CheckpointManager<R> {
    repo: Arc<R>,
}

impl<R: WorkflowRunRepository> CheckpointManager<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self { repo }
    }

    pub fn repo(&self) -> &R {
        &self.repo
    }

    // -----------------------------------------------------------------------
    // Node-run attempts
    // -----------------------------------------------------------------------

    /// Append a `running` node-run row for a new attempt.
    pub async fn start_node_run(
        &self,
        run_id: Uuid,
        lease_version: u64,
        node_id: &str,
        attempt: u32,
        input: Value,
    ) -> Result<NodeRun, CheckpointError> {
        let node_run = NodeRun {
            id: Uuid::now_v7(),
            run_id,
            node_id: node_id.to_string(),
            attempt,
            status: NodeRunStatus::Running,
            input,
            output: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
        };
        self.repo.create_node_run(&node_run, lease_version).await?;

        tracing::debug!(
            run_id = %run_id,
            node_id,
            attempt,
            node_run_id = %node_run.id,
            "checkpointed node start"
        );
        Ok(node_run)
    }

    /// Apply the terminal transition of an attempt.
    pub async fn finish_node_run(
        &self,
        lease_version: u64,
        node_run: &NodeRun,
        status: NodeRunStatus,
        output: Option<Value>,
        error: Option<String>,
    ) -> Result<NodeRunCompletion, CheckpointError> {
        let completed_at = Utc::now();
        let duration_ms = (completed_at - node_run.started_at)
            .num_milliseconds()
            .max(0) as u64;
        let completion = NodeRunCompletion {
            status,
            output,
            error,
            completed_at,
            duration_ms,
        };
        self.repo
            .complete_node_run(&node_run.id, lease_version, &completion)
            .await?;

        tracing::debug!(
            run_id = %node_run.run_id,
            node_id = node_run.node_id.as_str(),
            attempt = node_run.attempt,
            status = %status,
            duration_ms,
            "checkpointed node finish"
        );
        Ok(completion)
    }

    /// Close attempts left `running` by a driver that died mid-node.
    ///
    /// Returns the refreshed node-run history.
    pub async fn close_interrupted_attempts(
        &self,
        run_id: Uuid,
        lease_version: u64,
    ) -> Result<Vec<NodeRun>, CheckpointError> {
        let node_runs = self.repo.list_node_runs(&run_id).await?;
        let interrupted: Vec<&NodeRun> = node_runs
            .iter()
            .filter(|n| n.status == NodeRunStatus::Running)
            .collect();
        if interrupted.is_empty() {
            return Ok(node_runs);
        }

        for node_run in interrupted {
            tracing::warn!(
                run_id = %run_id,
                node_id = node_run.node_id.as_str(),
                attempt = node_run.attempt,
                "closing interrupted node attempt"
            );
            self.finish_node_run(
                lease_version,
                node_run,
                NodeRunStatus::Failed,
                None,
                Some(INTERRUPTED_ATTEMPT_ERROR.to_string()),
            )
            .await?;
        }
        Ok(self.repo.list_node_runs(&run_id).await?)
    }

    // -----------------------------------------------------------------------
    // Run-level checkpoints
    // -----------------------------------------------------------------------

    /// Write a checkpoint into `output` and persist it with the new cursor.
    pub async fn record_checkpoint(
        &self,
        run_id: Uuid,
        lease_version: u64,
        output: &mut Value,
        checkpoint: &Checkpoint,
    ) -> Result<(), CheckpointError> {
        write_checkpoint(output, checkpoint)?;
        self.repo
            .update_claimed_run(
                &run_id,
                lease_version,
                &RunPatch {
                    output: Some(output.clone()),
                    current_node_id: Some(checkpoint.next_node_id.clone()),
                    ..RunPatch::default()
                },
            )
            .await?;

        tracing::debug!(
            run_id = %run_id,
            step = checkpoint.step,
            completed = checkpoint.completed_node_id.as_str(),
            next = ?checkpoint.next_node_id,
            "recorded checkpoint"
        );
        Ok(())
    }

    /// Load a run or fail with `RunNotFound`.
    pub async fn load_run(&self, run_id: Uuid) -> Result<WorkflowRun, CheckpointError> {
        self.repo
            .get_run(&run_id)
            .await?
            .ok_or(CheckpointError::RunNotFound(run_id))
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("workflow run not found: {0}")]
    RunNotFound(Uuid),

    #[error("checkpoint serialization error: {0}")]
    Serialization(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
