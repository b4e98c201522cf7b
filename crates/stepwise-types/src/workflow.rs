//! Workflow domain types for Stepwise.
//!
//! Defines the canonical graph representation of a workflow (`WorkflowDefinition`
//! with nodes and edges), the retry and compensation configuration attached to
//! nodes, and the execution tracking types (`WorkflowRun`, `NodeRun`,
//! `Checkpoint`) that make resume deterministic.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Key in a run's output object holding engine-private state.
pub const RUNTIME_KEY: &str = "__runtime";

/// Key under [`RUNTIME_KEY`] holding the latest [`Checkpoint`].
pub const CHECKPOINT_KEY: &str = "checkpoint";

/// Key in a run's output object accumulating node outputs by node id.
pub const NODE_OUTPUTS_KEY: &str = "node_outputs";

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A versioned workflow graph.
///
/// Immutable once stored: edits produce a new version. The `(id, version)`
/// pair is the storage key; a [`WorkflowAlias`] tracks which version is the
/// current draft and which is the current published one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Stable workflow ID shared by all versions. Assigned on first parse.
    #[serde(default = "Uuid::now_v7")]
    pub id: Uuid,
    /// Monotonic version number per workflow ID (1-based).
    #[serde(default = "default_version")]
    pub version: u32,
    /// Lifecycle status of this version.
    #[serde(default)]
    pub status: DefinitionStatus,
    /// Human-readable workflow name.
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Free-form tags for grouping.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Trigger declarations. Stored for callers; the engine does not dispatch them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggers: Vec<TriggerConfig>,
    /// Graph nodes. IDs are unique within a definition.
    pub nodes: Vec<WorkflowNode>,
    /// Graph edges, evaluated in declaration order.
    #[serde(default)]
    pub edges: Vec<WorkflowEdge>,
    /// Definition-wide defaults (timeouts, retry policy).
    #[serde(default)]
    pub defaults: WorkflowDefaults,
    /// Permissions profile name handed to tool nodes.
    #[serde(
        default,
        alias = "permissionsProfile",
        skip_serializing_if = "Option::is_none"
    )]
    pub permissions_profile: Option<String>,
}

fn default_version() -> u32 {
    1
}

impl WorkflowDefinition {
    /// Look up a node by ID.
    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// Lifecycle status of a stored definition version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionStatus {
    #[default]
    Draft,
    Published,
    Archived,
}

impl fmt::Display for DefinitionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DefinitionStatus::Draft => "draft",
            DefinitionStatus::Published => "published",
            DefinitionStatus::Archived => "archived",
        };
        f.write_str(s)
    }
}

/// Pointer record tracking the current draft and published versions of a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowAlias {
    pub workflow_id: Uuid,
    /// Name of the latest version (denormalized for listing).
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draft_version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_version: Option<u32>,
    pub updated_at: DateTime<Utc>,
}

/// Definition-wide execution defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowDefaults {
    /// Wall-clock budget for one driver session over the run.
    #[serde(
        default,
        alias = "maxRunTimeMs",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_run_time_ms: Option<u64>,
    /// Per-node execution timeout.
    #[serde(
        default,
        alias = "nodeTimeoutMs",
        skip_serializing_if = "Option::is_none"
    )]
    pub node_timeout_ms: Option<u64>,
    /// Default retry policy (profile plus overrides) for nodes without their own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryOverride>,
}

/// How a workflow can be triggered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerConfig {
    /// Started explicitly via CLI or API.
    Manual {},
    /// Cron schedule.
    Schedule {
        cron: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timezone: Option<String>,
    },
    /// Incoming webhook.
    Webhook { path: String },
    /// Named application event.
    Event { event_type: String },
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// A single node in the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    /// Unique within the definition.
    pub id: String,
    /// Declared behavior of the node.
    #[serde(rename = "type")]
    pub node_type: NodeType,
    /// Human-readable node name.
    pub name: String,
    /// Free-form configuration interpreted per node type.
    #[serde(default)]
    pub config: serde_json::Map<String, Value>,
    /// Node-level retry override (profile and/or explicit fields).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryOverride>,
    /// Remedial action run before retrying a failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation: Option<CompensationConfig>,
    /// Whether a permanent failure of this node fails the run (default true).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critical: Option<bool>,
    /// Node-level timeout override.
    #[serde(default, alias = "timeoutMs", skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl WorkflowNode {
    /// Compensation settings, from the node block or from `config.compensation`.
    ///
    /// A `config.compensation` value that does not parse is an error, not `None`.
    pub fn compensation(&self) -> Result<Option<CompensationConfig>, serde_json::Error> {
        if let Some(c) = &self.compensation {
            return Ok(Some(c.clone()));
        }
        self.config
            .get("compensation")
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
    }

    /// Whether a permanent failure should fail the run.
    pub fn is_critical(&self) -> bool {
        self.critical.unwrap_or(true)
    }
}

/// The closed set of node behaviors.
///
/// Unknown type strings deserialize into [`NodeType::Unsupported`] so the
/// definition can still be stored; executing such a node fails.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Start,
    End,
    Wait,
    Condition,
    Approval,
    AgentStep,
    Tool,
    McpTool,
    ConnectorTool,
    MemoryRead,
    MemoryWrite,
    Notification,
    Subworkflow,
    Parallel,
    Loop,
    #[serde(untagged)]
    Unsupported(String),
}

impl NodeType {
    /// The wire name of this node type.
    pub fn as_str(&self) -> &str {
        match self {
            NodeType::Start => "start",
            NodeType::End => "end",
            NodeType::Wait => "wait",
            NodeType::Condition => "condition",
            NodeType::Approval => "approval",
            NodeType::AgentStep => "agent_step",
            NodeType::Tool => "tool",
            NodeType::McpTool => "mcp_tool",
            NodeType::ConnectorTool => "connector_tool",
            NodeType::MemoryRead => "memory_read",
            NodeType::MemoryWrite => "memory_write",
            NodeType::Notification => "notification",
            NodeType::Subworkflow => "subworkflow",
            NodeType::Parallel => "parallel",
            NodeType::Loop => "loop",
            NodeType::Unsupported(name) => name,
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Edges
// ---------------------------------------------------------------------------

/// A directed edge between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEdge {
    pub id: String,
    pub from: String,
    pub to: String,
    /// When this edge may be taken. Defaults to `success`.
    #[serde(default)]
    pub condition: EdgeCondition,
}

/// Edge guard: a structural outcome or a condition-DSL expression.
///
/// Serialized as a plain string: `"success"`, `"failure"`, `"always"`, or any
/// other string, which is treated as an expression.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EdgeCondition {
    #[default]
    Success,
    Failure,
    Always,
    Expression(String),
}

impl From<String> for EdgeCondition {
    fn from(value: String) -> Self {
        match value.trim() {
            "success" => EdgeCondition::Success,
            "failure" => EdgeCondition::Failure,
            "always" => EdgeCondition::Always,
            _ => EdgeCondition::Expression(value),
        }
    }
}

impl From<EdgeCondition> for String {
    fn from(value: EdgeCondition) -> Self {
        match value {
            EdgeCondition::Success => "success".to_string(),
            EdgeCondition::Failure => "failure".to_string(),
            EdgeCondition::Always => "always".to_string(),
            EdgeCondition::Expression(expr) => expr,
        }
    }
}

// ---------------------------------------------------------------------------
// Retry and compensation
// ---------------------------------------------------------------------------

/// A concrete retry policy.
///
/// Invariants: `max_attempts >= 1`, `max_backoff_ms >= backoff_ms`,
/// `jitter_ratio` in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter_ratio: f64,
}

/// Partial retry configuration: an optional profile name plus field overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    #[serde(default, alias = "maxAttempts", skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, alias = "backoffMs", skip_serializing_if = "Option::is_none")]
    pub backoff_ms: Option<u64>,
    #[serde(default, alias = "maxBackoffMs", skip_serializing_if = "Option::is_none")]
    pub max_backoff_ms: Option<u64>,
    #[serde(default, alias = "jitterRatio", skip_serializing_if = "Option::is_none")]
    pub jitter_ratio: Option<f64>,
}

/// Compensation block attached to a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompensationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub strategy: CompensationStrategy,
    /// Prompt template; `{{ compensation.node_id }}` and `{{ compensation.error }}` are available.
    #[serde(
        default,
        alias = "promptTemplate",
        skip_serializing_if = "Option::is_none"
    )]
    pub prompt_template: Option<String>,
    #[serde(default, alias = "maxTurns", skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u32>,
}

/// When compensation runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationStrategy {
    #[default]
    BeforeRetry,
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

/// Overall status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowRunStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowRunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowRunStatus::Completed | WorkflowRunStatus::Failed | WorkflowRunStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowRunStatus::Queued => "queued",
            WorkflowRunStatus::Running => "running",
            WorkflowRunStatus::Completed => "completed",
            WorkflowRunStatus::Failed => "failed",
            WorkflowRunStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for WorkflowRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution instance of a pinned workflow version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_version: u32,
    pub status: WorkflowRunStatus,
    /// Node the driver is positioned at (about to run, or paused on).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_node_id: Option<String>,
    /// Run-level context: caller input, including `approvals`.
    pub input: Value,
    /// Accumulated node outputs plus the `__runtime.checkpoint` pointer.
    pub output: Value,
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Optimistic single-writer marker, bumped by every successful claim.
    #[serde(default)]
    pub lease_version: u64,
    /// Driver currently holding the lease; cleared when it lets go.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_holder: Option<String>,
    /// The holder's lease is live until this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    /// The persisted checkpoint, if any.
    pub fn checkpoint(&self) -> Option<Checkpoint> {
        self.output
            .get(RUNTIME_KEY)
            .and_then(|rt| rt.get(CHECKPOINT_KEY))
            .and_then(|cp| serde_json::from_value(cp.clone()).ok())
    }

    /// Node outputs accumulated so far, keyed by node id.
    pub fn node_outputs(&self) -> HashMap<String, Value> {
        self.output
            .get(NODE_OUTPUTS_KEY)
            .and_then(Value::as_object)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    /// Whether `input.approvals[node_id]` is `true`.
    pub fn is_approved(&self, node_id: &str) -> bool {
        self.input
            .get("approvals")
            .and_then(|a| a.get(node_id))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// A driver's request to take a run's lease.
///
/// Granted only while `lease_version` still equals `expected` and no other
/// holder's lease is live at `now`.
#[derive(Debug, Clone)]
pub struct LeaseClaim {
    pub expected: u64,
    pub holder: String,
    pub now: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Partial update applied to a run. `None` fields are left unchanged.
#[derive(Debug, Clone, Default)]
pub struct RunPatch {
    pub status: Option<WorkflowRunStatus>,
    /// `Some(None)` clears the pointer.
    pub current_node_id: Option<Option<String>>,
    pub input: Option<Value>,
    pub output: Option<Value>,
    /// `Some(None)` clears the error.
    pub error: Option<Option<String>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunPatch {
    pub fn status(status: WorkflowRunStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

/// Durable marker of the last definitely-completed node of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Monotonic counter, one per terminal node transition.
    pub step: u64,
    pub completed_node_id: String,
    /// Where the driver continues. `None` once the graph walk has finished.
    #[serde(default)]
    pub next_node_id: Option<String>,
    pub node_run_id: Uuid,
    pub recorded_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Node runs
// ---------------------------------------------------------------------------

/// Status of one node attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRunStatus {
    Running,
    Succeeded,
    Failed,
    /// Attempt stopped at a gate waiting for out-of-band input.
    Paused,
}

impl NodeRunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, NodeRunStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRunStatus::Running => "running",
            NodeRunStatus::Succeeded => "succeeded",
            NodeRunStatus::Failed => "failed",
            NodeRunStatus::Paused => "paused",
        }
    }
}

impl fmt::Display for NodeRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attempt of one node within a run. Retries append new rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRun {
    pub id: Uuid,
    pub run_id: Uuid,
    pub node_id: String,
    /// 1-based, strictly increasing per `(run_id, node_id)`.
    pub attempt: u32,
    pub status: NodeRunStatus,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// The single terminal transition of a node-run.
#[derive(Debug, Clone)]
pub struct NodeRunCompletion {
    pub status: NodeRunStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}
