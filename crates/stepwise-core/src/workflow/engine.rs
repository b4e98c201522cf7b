//! Workflow engine: sequential graph walk with durable checkpoints.
//!
//! `WorkflowEngine` drives one run at a time per run id. Each node attempt is
//! appended as a node-run row before it executes and closed exactly once
//! afterwards. Every terminal node transition writes a checkpoint
//! `{step, completed_node_id, next_node_id, node_run_id}` into the run output;
//! on resume the checkpoint's `next_node_id` is authoritative and the
//! completed node is never executed again.
//!
//! # Execution flow
//!
//! 1. Load the run, register it as active, claim its lease.
//! 2. Resolve and compile the pinned definition version.
//! 3. Close attempts a crashed driver left `running`.
//! 4. Pick the resume point (checkpoint, cursor, or `start`). An attempt that
//!    succeeded after the last checkpoint is adopted, not run again.
//! 5. Per node: attempt, retry with compensation, checkpoint, pick the next edge.
//! 6. Stop on pause, cancellation, run-time budget, or the end of the walk.
//!
//! # Leases
//!
//! A claim records this engine as the run's lease holder until an expiry that a
//! background heartbeat keeps pushing forward. Other engines are refused while
//! the lease is live. Every run and node-run write is fenced on the claimed
//! lease version, so a driver whose lease moved stops with `LeaseLost` instead
//! of overwriting its successor.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::{json, Map, Value};
use stepwise_types::config::EngineConfig;
use stepwise_types::error::RepositoryError;
use stepwise_types::event::{WorkflowEvent, WorkflowEventType, RESUME_REASON_CHECKPOINT};
use stepwise_types::workflow::{
    Checkpoint, CompensationConfig, CompensationStrategy, LeaseClaim, NodeRun, NodeRunStatus,
    NodeType, RunPatch, WorkflowNode, WorkflowRun, WorkflowRunStatus,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::bus::EventBus;
use crate::repository::workflow::WorkflowStore;

use super::agent::{AgentPromptExecutor, AgentPromptOptions};
use super::checkpoint::{
    next_attempt, node_outputs_map, write_node_output, CheckpointError, CheckpointManager,
};
use super::definition::{EdgeOutcome, ResolvedDefinition, WorkflowError};
use super::node_runner::{NodeError, NodeExecutionContext, NodeRunner};
use super::retry::{compute_retry_delay, get_profile, RetryHandler, RetryPolicyError};
use super::template::render_template;
use super::versioning::{DefinitionService, VersionTarget};

/// Resume reason when no checkpoint exists but a cursor was persisted.
pub const RESUME_REASON_CURSOR: &str = "current_node_pointer";

/// Resume reason when a started run has neither checkpoint nor cursor.
pub const RESUME_REASON_RESTART: &str = "restart_without_checkpoint";

/// Longest accepted `lease_ttl_ms`.
pub const MAX_LEASE_TTL_MS: u64 = 86_400_000;

// ---------------------------------------------------------------------------
// Requests and results
// ---------------------------------------------------------------------------

/// Parameters for creating a run.
#[derive(Debug, Clone, Default)]
pub struct CreateRunRequest {
    pub workflow_id: Uuid,
    /// Run-level context; must be a JSON object (or null for `{}`).
    pub input: Value,
    pub target: VersionTarget,
    pub correlation_id: Option<String>,
}

/// Where a paused run is waiting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PausedAt {
    pub node_id: String,
    pub reason: String,
}

/// Result of one `execute` session.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub run_id: Uuid,
    /// Persisted run status when the session ended. Paused runs stay `running`.
    pub status: WorkflowRunStatus,
    pub paused: Option<PausedAt>,
    pub error: Option<String>,
    /// Node ids executed in this session, in order (one entry per node visit).
    pub executed_nodes: Vec<String>,
}

impl ExecutionResult {
    fn from_run(run: &WorkflowRun) -> Self {
        Self {
            run_id: run.id,
            status: run.status,
            paused: None,
            error: run.error.clone(),
            executed_nodes: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Internal driver state
// ---------------------------------------------------------------------------

struct Session {
    run: WorkflowRun,
    lease_version: u64,
    resolved: ResolvedDefinition,
    output: Value,
    step: u64,
    node_runs: Vec<NodeRun>,
    token: CancellationToken,
    started: Instant,
    max_run_time: Duration,
    executed: Vec<String>,
}

impl Session {
    fn result(&self, status: WorkflowRunStatus) -> ExecutionResult {
        ExecutionResult {
            run_id: self.run.id,
            status,
            paused: None,
            error: None,
            executed_nodes: self.executed.clone(),
        }
    }
}

enum NodeResolution {
    Succeeded { node_run: NodeRun, output: Value },
    Paused { node_run: NodeRun, reason: String },
    Failed { node_run: NodeRun, error: String },
    Cancelled,
}

/// Removes the in-process registration when the driver exits.
struct ActiveRunGuard<'a> {
    runs: &'a DashMap<Uuid, CancellationToken>,
    run_id: Uuid,
}

impl<'a> ActiveRunGuard<'a> {
    fn register(
        runs: &'a DashMap<Uuid, CancellationToken>,
        run_id: Uuid,
        token: CancellationToken,
    ) -> Result<Self, ExecutorError> {
        match runs.entry(run_id) {
            Entry::Occupied(_) => Err(ExecutorError::AlreadyRunning(run_id)),
            Entry::Vacant(slot) => {
                slot.insert(token);
                Ok(Self { runs, run_id })
            }
        }
    }
}

impl Drop for ActiveRunGuard<'_> {
    fn drop(&mut self) {
        self.runs.remove(&self.run_id);
    }
}

fn lease_expiry(now: DateTime<Utc>, ttl_ms: u64) -> DateTime<Utc> {
    now + TimeDelta::milliseconds(ttl_ms.min(MAX_LEASE_TTL_MS) as i64)
}

/// Renews a claimed lease every third of its TTL until dropped.
struct LeaseHeartbeat {
    handle: JoinHandle<()>,
}

impl LeaseHeartbeat {
    fn start<R: WorkflowStore + 'static>(
        repo: Arc<R>,
        run_id: Uuid,
        lease_version: u64,
        ttl_ms: u64,
    ) -> Self {
        let period = Duration::from_millis((ttl_ms / 3).max(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let expires_at = lease_expiry(Utc::now(), ttl_ms);
                if let Err(e) = repo.renew_lease(&run_id, lease_version, expires_at).await {
                    tracing::warn!(run_id = %run_id, lease_version, error = %e, "lease heartbeat stopped");
                    break;
                }
                tracing::trace!(run_id = %run_id, lease_version, "renewed run lease");
            }
        });
        Self { handle }
    }
}

impl Drop for LeaseHeartbeat {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// The latest attempt of `node_id`, if it succeeded after `checkpoint` was recorded.
///
/// That is the state a driver leaves when it dies between closing the attempt
/// and writing the checkpoint past it.
fn succeeded_past_checkpoint<'a>(
    node_runs: &'a [NodeRun],
    node_id: &str,
    checkpoint: Option<&Checkpoint>,
) -> Option<&'a NodeRun> {
    let latest = node_runs
        .iter()
        .filter(|n| n.node_id == node_id)
        .max_by_key(|n| n.attempt)?;
    let after_checkpoint = checkpoint
        .is_none_or(|cp| latest.id != cp.node_run_id && latest.started_at >= cp.recorded_at);
    (latest.status == NodeRunStatus::Succeeded && after_checkpoint).then_some(latest)
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Durable, single-writer-per-run workflow engine.
pub struct WorkflowEngine<R: WorkflowStore> {
    repo: Arc<R>,
    checkpoint: CheckpointManager<R>,
    definitions: DefinitionService<R>,
    runner: NodeRunner,
    event_bus: EventBus,
    config: EngineConfig,
    /// Lease holder id of this engine instance.
    holder: String,
    /// Cancellation tokens of runs driven by this process, keyed by run id.
    active_runs: DashMap<Uuid, CancellationToken>,
}

impl<R: WorkflowStore + 'static> WorkflowEngine<R> {
    /// Build an engine, rejecting an unknown default retry profile or a lease
    /// TTL outside `1..=MAX_LEASE_TTL_MS`.
    pub fn new(
        repo: Arc<R>,
        agent: Arc<dyn AgentPromptExecutor>,
        event_bus: EventBus,
        config: EngineConfig,
    ) -> Result<Self, ExecutorError> {
        get_profile(&config.default_retry_profile)
            .map_err(|e| ExecutorError::InvalidConfig(format!("default_retry_profile: {e}")))?;
        if !(1..=MAX_LEASE_TTL_MS).contains(&config.lease_ttl_ms) {
            return Err(ExecutorError::InvalidConfig(format!(
                "lease_ttl_ms must be within 1..={MAX_LEASE_TTL_MS}, got {}",
                config.lease_ttl_ms
            )));
        }

        Ok(Self {
            checkpoint: CheckpointManager::new(Arc::clone(&repo)),
            definitions: DefinitionService::new(
                Arc::clone(&repo),
                config.default_retry_profile.clone(),
            ),
            runner: NodeRunner::new(agent),
            event_bus,
            config,
            holder: format!("engine-{}", Uuid::now_v7()),
            active_runs: DashMap::new(),
            repo,
        })
    }

    pub fn repo(&self) -> &R {
        &self.repo
    }

    pub fn definitions(&self) -> &DefinitionService<R> {
        &self.definitions
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Lease holder id this engine claims runs under.
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Whether this process is currently driving `run_id`.
    pub fn is_active(&self, run_id: &Uuid) -> bool {
        self.active_runs.contains_key(run_id)
    }

    // -----------------------------------------------------------------------
    // Run lifecycle commands
    // -----------------------------------------------------------------------

    /// Create a `queued` run pinned to the alias' current version.
    pub async fn create_run(&self, request: CreateRunRequest) -> Result<WorkflowRun, ExecutorError> {
        let version = self
            .definitions
            .current_version(&request.workflow_id, request.target)
            .await?;
        // Refuse to queue a run against a version that no longer compiles.
        self.definitions.resolve(&request.workflow_id, version).await?;

        let input = match request.input {
            Value::Null => json!({}),
            obj @ Value::Object(_) => obj,
            other => {
                return Err(ExecutorError::InvalidInput(format!(
                    "run input must be a JSON object, got {other}"
                )));
            }
        };

        let now = Utc::now();
        let run_id = Uuid::now_v7();
        let run = WorkflowRun {
            id: run_id,
            workflow_id: request.workflow_id,
            workflow_version: version,
            status: WorkflowRunStatus::Queued,
            current_node_id: None,
            input,
            output: json!({}),
            correlation_id: request
                .correlation_id
                .unwrap_or_else(|| Uuid::now_v7().to_string()),
            error: None,
            lease_version: 0,
            lease_holder: None,
            lease_expires_at: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        };
        self.repo.create_run(&run).await?;

        tracing::info!(
            run_id = %run_id,
            workflow_id = %run.workflow_id,
            version,
            "created workflow run"
        );
        Ok(run)
    }

    /// Record `approvals[node_id] = true` on a non-terminal run.
    pub async fn approve(&self, run_id: Uuid, node_id: &str) -> Result<WorkflowRun, ExecutorError> {
        let mut run = self.checkpoint.load_run(run_id).await?;
        if run.status.is_terminal() {
            return Err(ExecutorError::RunTerminal {
                run_id,
                status: run.status,
            });
        }

        let definition = self
            .definitions
            .get(&run.workflow_id, run.workflow_version)
            .await?;
        let node = definition
            .node(node_id)
            .ok_or_else(|| ExecutorError::NodeNotFound(node_id.to_string()))?;
        if node.node_type != NodeType::Approval {
            return Err(ExecutorError::InvalidInput(format!(
                "node '{node_id}' is a {} node, not an approval gate",
                node.node_type
            )));
        }

        let mut input = match run.input {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let mut approvals = match input.remove("approvals") {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        approvals.insert(node_id.to_string(), Value::Bool(true));
        input.insert("approvals".to_string(), Value::Object(approvals));
        run.input = Value::Object(input);

        self.repo
            .update_run(
                &run_id,
                &RunPatch {
                    input: Some(run.input.clone()),
                    ..RunPatch::default()
                },
            )
            .await?;

        tracing::info!(run_id = %run_id, node_id, "approval recorded");
        Ok(run)
    }

    /// Mark a non-terminal run cancelled and stop its active driver at the next boundary.
    pub async fn cancel(&self, run_id: Uuid) -> Result<(), ExecutorError> {
        let run = self.checkpoint.load_run(run_id).await?;
        if run.status.is_terminal() {
            return Err(ExecutorError::RunTerminal {
                run_id,
                status: run.status,
            });
        }

        self.repo
            .update_run(
                &run_id,
                &RunPatch {
                    status: Some(WorkflowRunStatus::Cancelled),
                    error: Some(Some("cancelled by user".to_string())),
                    completed_at: Some(Utc::now()),
                    ..RunPatch::default()
                },
            )
            .await?;
        self.emit(
            run_id,
            WorkflowEventType::RunCancelled,
            json!({
                "previous_status": run.status,
                "current_node_id": run.current_node_id,
            }),
        )
        .await?;

        if let Some(token) = self.active_runs.get(&run_id) {
            token.cancel();
        }
        tracing::info!(run_id = %run_id, "workflow run cancelled");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // execute
    // -----------------------------------------------------------------------

    /// Drive a run until it completes, fails, pauses, or is cancelled.
    ///
    /// Node failures are recorded, not returned. Errors escape only for
    /// missing runs/definitions, lease conflicts, resume-integrity
    /// violations, and storage failures.
    pub async fn execute(&self, run_id: Uuid) -> Result<ExecutionResult, ExecutorError> {
        let run = self.checkpoint.load_run(run_id).await?;
        if run.status.is_terminal() {
            tracing::info!(run_id = %run_id, status = %run.status, "run already terminal");
            return Ok(ExecutionResult::from_run(&run));
        }

        let token = CancellationToken::new();
        let _guard = ActiveRunGuard::register(&self.active_runs, run_id, token.clone())?;

        let lease_version = self.claim(&run).await?;
        let heartbeat = LeaseHeartbeat::start(
            Arc::clone(&self.repo),
            run_id,
            lease_version,
            self.config.lease_ttl_ms,
        );
        let outcome = self.execute_claimed(run, lease_version, token).await;
        drop(heartbeat);

        if let Err(e) = self.repo.release_lease(&run_id, lease_version).await {
            tracing::warn!(run_id = %run_id, lease_version, error = %e, "failed to release run lease");
        }
        outcome
    }

    /// Take the run's lease for this engine.
    async fn claim(&self, run: &WorkflowRun) -> Result<u64, ExecutorError> {
        let now = Utc::now();
        let claim = LeaseClaim {
            expected: run.lease_version,
            holder: self.holder.clone(),
            now,
            expires_at: lease_expiry(now, self.config.lease_ttl_ms),
        };
        match self.repo.claim_run(&run.id, &claim).await {
            Ok(version) => Ok(version),
            Err(RepositoryError::Conflict(reason)) => {
                tracing::warn!(run_id = %run.id, reason = reason.as_str(), "run lease is held elsewhere");
                Err(ExecutorError::LeaseConflict(run.id))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn execute_claimed(
        &self,
        mut run: WorkflowRun,
        lease_version: u64,
        token: CancellationToken,
    ) -> Result<ExecutionResult, ExecutorError> {
        let run_id = run.id;
        run.lease_version = lease_version;
        let resolved = self
            .definitions
            .resolve(&run.workflow_id, run.workflow_version)
            .await?;
        let node_runs = self
            .checkpoint
            .close_interrupted_attempts(run_id, lease_version)
            .await?;

        // Resume point, validated before anything is written.
        let checkpoint = run.checkpoint();
        let (cursor, resume_reason) = match &checkpoint {
            Some(cp) => (cp.next_node_id.clone(), Some(RESUME_REASON_CHECKPOINT)),
            None => match &run.current_node_id {
                Some(node_id) => (Some(node_id.clone()), Some(RESUME_REASON_CURSOR)),
                None if run.status == WorkflowRunStatus::Queued => {
                    (Some(resolved.compiled.start_node_id.clone()), None)
                }
                None => (
                    Some(resolved.compiled.start_node_id.clone()),
                    Some(RESUME_REASON_RESTART),
                ),
            },
        };
        if let Some(node_id) = &cursor {
            if resolved.definition.node(node_id).is_none() {
                tracing::error!(run_id = %run_id, node_id = node_id.as_str(), "resume target missing from definition");
                return Err(ExecutorError::ResumeIntegrity {
                    run_id,
                    node_id: node_id.clone(),
                });
            }
        }
        let adopted = cursor
            .as_deref()
            .and_then(|node_id| succeeded_past_checkpoint(&node_runs, node_id, checkpoint.as_ref()))
            .cloned();

        self.repo
            .update_claimed_run(
                &run_id,
                lease_version,
                &RunPatch {
                    status: Some(WorkflowRunStatus::Running),
                    started_at: run.started_at.is_none().then(Utc::now),
                    error: Some(None),
                    ..RunPatch::default()
                },
            )
            .await?;

        match resume_reason {
            Some(reason) => {
                tracing::info!(
                    run_id = %run_id,
                    reason,
                    next = ?cursor,
                    lease_version,
                    "resuming workflow run"
                );
                self.emit(
                    run_id,
                    WorkflowEventType::RunResumed,
                    json!({
                        "reason": reason,
                        "step": checkpoint.as_ref().map(|cp| cp.step),
                        "completed_node_id": checkpoint.as_ref().map(|cp| cp.completed_node_id.clone()),
                        "next_node_id": cursor,
                        "adopted_node_run_id": adopted.as_ref().map(|n| n.id),
                        "lease_version": lease_version,
                    }),
                )
                .await?;
            }
            None => {
                tracing::info!(
                    run_id = %run_id,
                    workflow = resolved.definition.name.as_str(),
                    version = run.workflow_version,
                    "starting workflow run"
                );
                self.emit(
                    run_id,
                    WorkflowEventType::RunStarted,
                    json!({
                        "workflow_id": run.workflow_id,
                        "workflow_version": run.workflow_version,
                        "start_node_id": resolved.compiled.start_node_id,
                        "correlation_id": run.correlation_id,
                    }),
                )
                .await?;
            }
        }

        let max_run_time_ms = resolved
            .definition
            .defaults
            .max_run_time_ms
            .unwrap_or(self.config.max_run_time_ms);
        let mut session = Session {
            output: run.output.clone(),
            step: checkpoint.as_ref().map(|cp| cp.step).unwrap_or(0),
            run,
            lease_version,
            resolved,
            node_runs,
            token,
            started: Instant::now(),
            max_run_time: Duration::from_millis(max_run_time_ms),
            executed: Vec::new(),
        };

        if let Some(node_run) = adopted {
            return match self.adopt_succeeded(&mut session, node_run).await? {
                Some(next) => self.drive(&mut session, next).await,
                None => self.finish_completed(&mut session).await,
            };
        }
        match cursor {
            Some(node_id) => self.drive(&mut session, node_id).await,
            None => self.finish_from_checkpoint(&mut session, checkpoint).await,
        }
    }

    /// Take over an attempt that succeeded after the last checkpoint.
    ///
    /// Its recorded output and the checkpoint past it are rebuilt; the node is
    /// not executed again. Returns the next node, if any.
    async fn adopt_succeeded(
        &self,
        session: &mut Session,
        node_run: NodeRun,
    ) -> Result<Option<String>, ExecutorError> {
        let node = session
            .resolved
            .definition
            .node(&node_run.node_id)
            .cloned()
            .ok_or_else(|| ExecutorError::ResumeIntegrity {
                run_id: session.run.id,
                node_id: node_run.node_id.clone(),
            })?;
        tracing::info!(
            run_id = %session.run.id,
            node_id = node.id.as_str(),
            attempt = node_run.attempt,
            "adopting attempt that finished after the last checkpoint"
        );
        let output = node_run.output.clone().unwrap_or_else(|| json!({}));
        self.complete_node(session, &node, &node_run, output).await
    }

    /// The graph walk had already ended before the driver stopped; settle the run status.
    async fn finish_from_checkpoint(
        &self,
        session: &mut Session,
        checkpoint: Option<Checkpoint>,
    ) -> Result<ExecutionResult, ExecutorError> {
        let Some(cp) = checkpoint else {
            return self.finish_completed(session).await;
        };
        let last = session.node_runs.iter().find(|n| n.id == cp.node_run_id);
        let critical = session
            .resolved
            .definition
            .node(&cp.completed_node_id)
            .is_none_or(|n| n.is_critical());

        match last {
            Some(node_run) if node_run.status == NodeRunStatus::Failed && critical => {
                let error = format!(
                    "node '{}' failed: {}",
                    cp.completed_node_id,
                    node_run.error.clone().unwrap_or_default()
                );
                self.finish_failed(session, error).await
            }
            _ => self.finish_completed(session).await,
        }
    }

    // -----------------------------------------------------------------------
    // Driver loop
    // -----------------------------------------------------------------------

    async fn drive(
        &self,
        session: &mut Session,
        mut cursor: String,
    ) -> Result<ExecutionResult, ExecutorError> {
        let run_id = session.run.id;
        loop {
            if self.is_cancelled(session).await? {
                return Ok(self.cancelled_result(session));
            }
            if session.started.elapsed() >= session.max_run_time {
                let error = format!(
                    "run exceeded max run time of {}ms",
                    session.max_run_time.as_millis()
                );
                return self.finish_failed(session, error).await;
            }

            let node = session
                .resolved
                .definition
                .node(&cursor)
                .cloned()
                .ok_or_else(|| ExecutorError::ResumeIntegrity {
                    run_id,
                    node_id: cursor.clone(),
                })?;

            self.repo
                .update_claimed_run(
                    &run_id,
                    session.lease_version,
                    &RunPatch {
                        current_node_id: Some(Some(node.id.clone())),
                        ..RunPatch::default()
                    },
                )
                .await?;
            session.executed.push(node.id.clone());

            match self.run_node(session, &node).await? {
                NodeResolution::Cancelled => return Ok(self.cancelled_result(session)),

                NodeResolution::Paused { node_run, reason } => {
                    self.emit(
                        run_id,
                        WorkflowEventType::NodePaused,
                        json!({
                            "node_id": node.id,
                            "node_run_id": node_run.id,
                            "attempt": node_run.attempt,
                            "reason": reason,
                        }),
                    )
                    .await?;
                    self.emit(
                        run_id,
                        WorkflowEventType::RunPaused,
                        json!({ "node_id": node.id, "reason": reason }),
                    )
                    .await?;
                    tracing::info!(run_id = %run_id, node_id = node.id.as_str(), reason = reason.as_str(), "workflow run paused");

                    let mut result = session.result(WorkflowRunStatus::Running);
                    result.paused = Some(PausedAt {
                        node_id: node.id.clone(),
                        reason,
                    });
                    return Ok(result);
                }

                NodeResolution::Succeeded { node_run, output } => {
                    match self.complete_node(session, &node, &node_run, output).await? {
                        Some(next) => cursor = next,
                        None => return self.finish_completed(session).await,
                    }
                }

                NodeResolution::Failed { node_run, error } => {
                    write_node_output(
                        &mut session.output,
                        &node.id,
                        json!({ "failed": true, "error": error }),
                    );
                    let ctx = self.context_for(session, node_run.attempt).template_context();
                    let compiled = &session.resolved.compiled;
                    let edge = compiled
                        .select_edge(&node.id, EdgeOutcome::Failure, &ctx)
                        .or_else(|| {
                            (!node.is_critical())
                                .then(|| compiled.select_edge(&node.id, EdgeOutcome::Success, &ctx))
                                .flatten()
                        });
                    let next = edge.map(|e| e.to.clone());
                    self.checkpoint_node(session, &node.id, &node_run, next.clone())
                        .await?;

                    match next {
                        Some(next) => {
                            tracing::warn!(
                                run_id = %run_id,
                                node_id = node.id.as_str(),
                                next = next.as_str(),
                                "continuing after node failure"
                            );
                            cursor = next;
                        }
                        None if !node.is_critical() => return self.finish_completed(session).await,
                        None => {
                            let message = format!("node '{}' failed: {error}", node.id);
                            return self.finish_failed(session, message).await;
                        }
                    }
                }
            }
        }
    }

    /// Store a succeeded node's output, checkpoint past it, and pick the next node.
    async fn complete_node(
        &self,
        session: &mut Session,
        node: &WorkflowNode,
        node_run: &NodeRun,
        output: Value,
    ) -> Result<Option<String>, ExecutorError> {
        write_node_output(&mut session.output, &node.id, output);
        let next = if node.node_type == NodeType::End {
            None
        } else {
            let ctx = self.context_for(session, node_run.attempt).template_context();
            session
                .resolved
                .compiled
                .select_edge(&node.id, EdgeOutcome::Success, &ctx)
                .map(|edge| edge.to.clone())
        };
        self.checkpoint_node(session, &node.id, node_run, next.clone())
            .await?;
        self.emit(
            session.run.id,
            WorkflowEventType::NodeSucceeded,
            json!({
                "node_id": node.id,
                "node_run_id": node_run.id,
                "attempt": node_run.attempt,
                "next_node_id": next,
            }),
        )
        .await?;
        Ok(next)
    }

    /// Execute one node with its retry policy. Each attempt is its own node-run.
    async fn run_node(
        &self,
        session: &mut Session,
        node: &WorkflowNode,
    ) -> Result<NodeResolution, ExecutorError> {
        let run_id = session.run.id;
        let defaults = &session.resolved.definition.defaults;
        let policy =
            RetryHandler::policy_for_node(defaults, node, &self.config.default_retry_profile)?;
        let timeout_ms = node
            .timeout_ms
            .or(defaults.node_timeout_ms)
            .unwrap_or(self.config.node_timeout_ms);
        let compensation = node
            .compensation()
            .map_err(|e| {
                WorkflowError::ValidationError(format!(
                    "node '{}': invalid compensation block: {e}",
                    node.id
                ))
            })?
            .filter(|c| c.enabled && c.strategy == CompensationStrategy::BeforeRetry);
        let first_attempt = next_attempt(&session.node_runs, &node.id);

        let mut session_attempt = 1u32;
        loop {
            let attempt = first_attempt + session_attempt - 1;
            let node_run = self
                .checkpoint
                .start_node_run(
                    run_id,
                    session.lease_version,
                    &node.id,
                    attempt,
                    Value::Object(node.config.clone()),
                )
                .await?;
            session.node_runs.push(node_run.clone());
            self.emit(
                run_id,
                WorkflowEventType::NodeStarted,
                json!({
                    "node_id": node.id,
                    "node_type": node.node_type.as_str(),
                    "node_run_id": node_run.id,
                    "attempt": attempt,
                }),
            )
            .await?;

            let ctx = self.context_for(session, attempt);
            let result = match tokio::time::timeout(
                Duration::from_millis(timeout_ms),
                self.runner.run(node, &ctx),
            )
            .await
            {
                Ok(result) => result,
                Err(_elapsed) => Err(NodeError::Timeout {
                    node_id: node.id.clone(),
                    timeout_ms,
                }),
            };

            let err = match result {
                Ok(output) if output.pause_requested() => {
                    let reason = output.pause_reason.clone().unwrap_or_default();
                    self.checkpoint
                        .finish_node_run(
                            session.lease_version,
                            &node_run,
                            NodeRunStatus::Paused,
                            Some(output.value),
                            None,
                        )
                        .await?;
                    return Ok(NodeResolution::Paused { node_run, reason });
                }
                Ok(output) => {
                    let value = annotate_missing_paths(output.value, &output.missing_paths);
                    self.checkpoint
                        .finish_node_run(
                            session.lease_version,
                            &node_run,
                            NodeRunStatus::Succeeded,
                            Some(value.clone()),
                            None,
                        )
                        .await?;
                    return Ok(NodeResolution::Succeeded {
                        node_run,
                        output: value,
                    });
                }
                Err(err) => err,
            };

            let error = err.to_string();
            let will_retry =
                !err.is_permanent() && RetryHandler::should_retry(&policy, session_attempt);

            let compensation_record = match (&compensation, will_retry) {
                (Some(config), true) => Some(
                    self.compensate(session, node, config, attempt, &error, timeout_ms)
                        .await?,
                ),
                _ => None,
            };
            let compensation_applied = compensation_record
                .as_ref()
                .and_then(|c| c.get("applied"))
                .and_then(Value::as_bool)
                .unwrap_or(false);

            self.checkpoint
                .finish_node_run(
                    session.lease_version,
                    &node_run,
                    NodeRunStatus::Failed,
                    compensation_record.map(|c| json!({ "compensation": c })),
                    Some(error.clone()),
                )
                .await?;
            self.emit(
                run_id,
                WorkflowEventType::NodeFailed,
                json!({
                    "node_id": node.id,
                    "node_run_id": node_run.id,
                    "attempt": attempt,
                    "error": error,
                    "will_retry": will_retry,
                    "compensation_applied": compensation_applied,
                }),
            )
            .await?;

            if !will_retry {
                return Ok(NodeResolution::Failed { node_run, error });
            }

            let delay_ms = compute_retry_delay(&policy, session_attempt);
            tracing::warn!(
                run_id = %run_id,
                node_id = node.id.as_str(),
                attempt,
                delay_ms,
                error = error.as_str(),
                "node attempt failed, retrying"
            );
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                _ = session.token.cancelled() => return Ok(NodeResolution::Cancelled),
            }
            if self.is_cancelled(session).await? {
                return Ok(NodeResolution::Cancelled);
            }
            session_attempt += 1;
        }
    }

    /// Run the compensation prompt for a failed attempt. Failures are recorded, not raised.
    async fn compensate(
        &self,
        session: &Session,
        node: &WorkflowNode,
        config: &CompensationConfig,
        attempt: u32,
        error: &str,
        timeout_ms: u64,
    ) -> Result<Value, ExecutorError> {
        let run_id = session.run.id;
        let mut ctx = self.context_for(session, attempt);
        ctx.extra.insert(
            "compensation".to_string(),
            json!({
                "node_id": node.id,
                "node_name": node.name,
                "attempt": attempt,
                "error": error,
            }),
        );
        let template = config
            .prompt_template
            .as_deref()
            .unwrap_or(RetryHandler::default_compensation_prompt());
        let prompt = render_template(template, &ctx.template_context()).value;

        let options = AgentPromptOptions {
            max_turns: config.max_turns,
            ..serde_json::from_value(Value::Object(node.config.clone())).unwrap_or_default()
        };

        let outcome = if prompt.trim().is_empty() {
            Err("compensation prompt resolved empty".to_string())
        } else {
            match tokio::time::timeout(
                Duration::from_millis(timeout_ms),
                self.runner.agent().execute_agent_prompt(&prompt, &options),
            )
            .await
            {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_elapsed) => Err(format!("compensation timed out after {timeout_ms}ms")),
            }
        };

        match outcome {
            Ok(response) => {
                tracing::info!(run_id = %run_id, node_id = node.id.as_str(), attempt, "compensation applied");
                Ok(json!({
                    "applied": true,
                    "strategy": "before_retry",
                    "attempt": attempt,
                    "text": response.content,
                }))
            }
            Err(message) => {
                tracing::warn!(
                    run_id = %run_id,
                    node_id = node.id.as_str(),
                    attempt,
                    error = message.as_str(),
                    "compensation failed"
                );
                self.emit(
                    run_id,
                    WorkflowEventType::CompensationFailed,
                    json!({ "node_id": node.id, "attempt": attempt, "error": message }),
                )
                .await?;
                Ok(json!({
                    "applied": false,
                    "strategy": "before_retry",
                    "attempt": attempt,
                    "error": message,
                }))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn context_for(&self, session: &Session, attempt: u32) -> NodeExecutionContext {
        let definition = &session.resolved.definition;
        NodeExecutionContext {
            run_id: session.run.id,
            workflow_id: definition.id,
            workflow_version: definition.version,
            workflow_name: definition.name.clone(),
            correlation_id: session.run.correlation_id.clone(),
            attempt,
            run_context: session.run.input.clone(),
            node_outputs: node_outputs_map(&session.output),
            permissions_profile: definition.permissions_profile.clone(),
            extra: Map::new(),
        }
    }

    async fn checkpoint_node(
        &self,
        session: &mut Session,
        node_id: &str,
        node_run: &NodeRun,
        next_node_id: Option<String>,
    ) -> Result<(), ExecutorError> {
        session.step += 1;
        let checkpoint = Checkpoint {
            step: session.step,
            completed_node_id: node_id.to_string(),
            next_node_id,
            node_run_id: node_run.id,
            recorded_at: Utc::now(),
        };
        self.checkpoint
            .record_checkpoint(
                session.run.id,
                session.lease_version,
                &mut session.output,
                &checkpoint,
            )
            .await?;
        Ok(())
    }

    /// Cancellation via this process' token or a persisted `cancelled` status.
    async fn is_cancelled(&self, session: &Session) -> Result<bool, ExecutorError> {
        if session.token.is_cancelled() {
            return Ok(true);
        }
        let current = self.checkpoint.load_run(session.run.id).await?;
        Ok(current.status == WorkflowRunStatus::Cancelled)
    }

    fn cancelled_result(&self, session: &Session) -> ExecutionResult {
        tracing::info!(run_id = %session.run.id, "driver stopped: run cancelled");
        let mut result = session.result(WorkflowRunStatus::Cancelled);
        result.error = Some("cancelled by user".to_string());
        result
    }

    async fn finish_completed(&self, session: &mut Session) -> Result<ExecutionResult, ExecutorError> {
        if self.is_cancelled(session).await? {
            return Ok(self.cancelled_result(session));
        }
        let run_id = session.run.id;
        self.repo
            .update_claimed_run(
                &run_id,
                session.lease_version,
                &RunPatch {
                    status: Some(WorkflowRunStatus::Completed),
                    current_node_id: Some(None),
                    error: Some(None),
                    completed_at: Some(Utc::now()),
                    ..RunPatch::default()
                },
            )
            .await?;
        self.emit(
            run_id,
            WorkflowEventType::RunCompleted,
            json!({
                "executed_nodes": session.executed,
                "duration_ms": session.started.elapsed().as_millis() as u64,
            }),
        )
        .await?;
        tracing::info!(run_id = %run_id, nodes = session.executed.len(), "workflow run completed");
        Ok(session.result(WorkflowRunStatus::Completed))
    }

    async fn finish_failed(
        &self,
        session: &mut Session,
        error: String,
    ) -> Result<ExecutionResult, ExecutorError> {
        if self.is_cancelled(session).await? {
            return Ok(self.cancelled_result(session));
        }
        let run_id = session.run.id;
        self.repo
            .update_claimed_run(
                &run_id,
                session.lease_version,
                &RunPatch {
                    status: Some(WorkflowRunStatus::Failed),
                    error: Some(Some(error.clone())),
                    completed_at: Some(Utc::now()),
                    ..RunPatch::default()
                },
            )
            .await?;
        self.emit(
            run_id,
            WorkflowEventType::RunFailed,
            json!({ "error": error, "executed_nodes": session.executed }),
        )
        .await?;
        tracing::info!(run_id = %run_id, error = error.as_str(), "workflow run failed");

        let mut result = session.result(WorkflowRunStatus::Failed);
        result.error = Some(error);
        Ok(result)
    }

    /// Persist an event and publish it on the bus.
    async fn emit(
        &self,
        run_id: Uuid,
        event_type: WorkflowEventType,
        payload: Value,
    ) -> Result<(), ExecutorError> {
        let event = WorkflowEvent::new(run_id, event_type, payload);
        self.repo.append_event(&event).await?;
        self.event_bus.publish(event);
        Ok(())
    }
}

/// Attach unresolved template paths to an object output as diagnostics.
fn annotate_missing_paths(value: Value, missing_paths: &[String]) -> Value {
    match value {
        Value::Object(mut map) if !missing_paths.is_empty() && !map.contains_key("missing_paths") => {
            map.insert("missing_paths".to_string(), json!(missing_paths));
            Value::Object(map)
        }
        other => other,
    }
}

// ---------------------------------------------------------------------------
// ExecutorError
// ---------------------------------------------------------------------------

/// Errors that escape `execute()` and the run lifecycle commands.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("checkpoint error: {0}")]
    Checkpoint(CheckpointError),

    #[error("retry policy error: {0}")]
    RetryPolicy(#[from] RetryPolicyError),

    #[error("repository error: {0}")]
    Repository(RepositoryError),

    /// The checkpoint or cursor points at a node the pinned definition lacks.
    #[error("run {run_id} cannot resume: node '{node_id}' does not exist in the pinned definition")]
    ResumeIntegrity { run_id: Uuid, node_id: String },

    /// Another driver holds a live lease on the run.
    #[error("run {0} was claimed by another driver")]
    LeaseConflict(Uuid),

    /// The lease moved while this driver was working; its writes were refused.
    #[error("run {run_id} lost lease {lease_version} to another driver")]
    LeaseLost { run_id: Uuid, lease_version: u64 },

    #[error("invalid engine configuration: {0}")]
    InvalidConfig(String),

    #[error("run {0} is already being executed by this process")]
    AlreadyRunning(Uuid),

    #[error("run {run_id} is already {status}")]
    RunTerminal {
        run_id: Uuid,
        status: WorkflowRunStatus,
    },

    #[error("node '{0}' not found in workflow definition")]
    NodeNotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl From<RepositoryError> for ExecutorError {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::LeaseLost {
                run_id,
                lease_version,
            } => ExecutorError::LeaseLost {
                run_id,
                lease_version,
            },
            other => ExecutorError::Repository(other),
        }
    }
}

impl From<CheckpointError> for ExecutorError {
    fn from(e: CheckpointError) -> Self {
        match e {
            CheckpointError::Repository(inner @ RepositoryError::LeaseLost { .. }) => inner.into(),
            other => ExecutorError::Checkpoint(other),
        }
    }
}

impl ExecutorError {
    /// Missing run, workflow, or workflow version.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ExecutorError::Checkpoint(CheckpointError::RunNotFound(_))
                | ExecutorError::Workflow(WorkflowError::NotFound { .. })
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
