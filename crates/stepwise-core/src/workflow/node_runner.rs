//! Node runner for every workflow node type.
//!
//! `NodeRunner` dispatches on the closed `NodeType` set. Each handler reads a
//! typed view of the node's free-form config, resolves templates against the
//! execution context, and returns a `NodeOutput`. Approval gates return a
//! pause signal instead of failing.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Map, Value};
use stepwise_types::workflow::{NodeType, WorkflowNode};
use uuid::Uuid;

use super::agent::{AgentError, AgentPromptExecutor, AgentPromptOptions};
use super::expression::{evaluate_expression, is_truthy, ExpressionError};
use super::template::{render_template, resolve_template_value};

// ---------------------------------------------------------------------------
// NodeExecutionContext
// ---------------------------------------------------------------------------

/// Everything a node can see while it runs.
#[derive(Debug, Clone, Default)]
pub struct NodeExecutionContext {
    pub run_id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_version: u32,
    pub workflow_name: String,
    pub correlation_id: String,
    pub attempt: u32,
    /// The run's input object (includes `approvals`).
    pub run_context: Value,
    /// Outputs of previously completed nodes, keyed by node id.
    pub node_outputs: Map<String, Value>,
    pub permissions_profile: Option<String>,
    /// Additional top-level template keys (e.g. `compensation`).
    pub extra: Map<String, Value>,
}

impl NodeExecutionContext {
    /// Build the JSON object templates and expressions resolve against.
    ///
    /// Run input fields are exposed at the top level and under `input`; node
    /// outputs under `nodes.<id>` and `steps.<id>.output`; run metadata under
    /// `run`. Reserved keys shadow input fields of the same name.
    pub fn template_context(&self) -> Value {
        let mut root = match &self.run_context {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };

        let steps: Map<String, Value> = self
            .node_outputs
            .iter()
            .map(|(id, output)| (id.clone(), json!({ "output": output })))
            .collect();

        root.insert("input".to_string(), self.run_context.clone());
        root.insert("nodes".to_string(), Value::Object(self.node_outputs.clone()));
        root.insert("steps".to_string(), Value::Object(steps));
        root.insert(
            "run".to_string(),
            json!({
                "id": self.run_id,
                "workflow_id": self.workflow_id,
                "workflow_version": self.workflow_version,
                "workflow_name": self.workflow_name,
                "correlation_id": self.correlation_id,
                "attempt": self.attempt,
            }),
        );
        for (key, value) in &self.extra {
            root.insert(key.clone(), value.clone());
        }
        Value::Object(root)
    }

    /// Whether `approvals[node_id]` is `true` in the run context.
    pub fn is_approved(&self, node_id: &str) -> bool {
        self.run_context
            .get("approvals")
            .and_then(|a| a.get(node_id))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// NodeOutput
// ---------------------------------------------------------------------------

/// Result of one node execution.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeOutput {
    pub value: Value,
    pub missing_paths: Vec<String>,
    /// Set when the node asks the driver to stop advancing.
    pub pause_reason: Option<String>,
}

impl NodeOutput {
    fn value(value: Value) -> Self {
        Self {
            value,
            missing_paths: Vec::new(),
            pause_reason: None,
        }
    }

    fn with_missing(mut self, missing_paths: Vec<String>) -> Self {
        self.missing_paths = missing_paths;
        self
    }

    pub fn pause_requested(&self) -> bool {
        self.pause_reason.is_some()
    }
}

// ---------------------------------------------------------------------------
// NodeError
// ---------------------------------------------------------------------------

/// Errors raised by a node execution. All of them are node-level failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum NodeError {
    #[error("unsupported node type '{0}'")]
    UnsupportedNodeType(String),

    #[error("invalid config for node '{node_id}': {message}")]
    InvalidConfig { node_id: String, message: String },

    #[error("node '{0}' resolved an empty prompt")]
    EmptyPrompt(String),

    #[error("condition error: {0}")]
    Expression(#[from] ExpressionError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("node '{node_id}' timed out after {timeout_ms}ms")]
    Timeout { node_id: String, timeout_ms: u64 },
}

impl NodeError {
    /// Failures that another attempt cannot fix. These skip the retry loop.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            NodeError::UnsupportedNodeType(_)
                | NodeError::InvalidConfig { .. }
                | NodeError::EmptyPrompt(_)
                | NodeError::Expression(_)
        )
    }

    fn config(node: &WorkflowNode, message: impl Into<String>) -> Self {
        NodeError::InvalidConfig {
            node_id: node.id.clone(),
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Typed config views
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct WaitConfig {
    #[serde(default, alias = "durationMs")]
    duration_ms: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct ConditionConfig {
    #[serde(default)]
    expression: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ApprovalConfig {
    #[serde(default, alias = "autoApprove")]
    auto_approve: Option<Value>,
    #[serde(default, alias = "pauseReason", alias = "message")]
    reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AgentStepConfig {
    #[serde(default, alias = "promptTemplate")]
    prompt_template: Option<String>,
    #[serde(default)]
    prompt: Option<String>,
    #[serde(flatten)]
    options: AgentPromptOptions,
}

fn config_view<T>(node: &WorkflowNode) -> Result<T, NodeError>
where
    T: for<'de> Deserialize<'de>,
{
    serde_json::from_value(Value::Object(node.config.clone()))
        .map_err(|e| NodeError::config(node, e.to_string()))
}

// ---------------------------------------------------------------------------
// NodeRunner
// ---------------------------------------------------------------------------

/// Executes individual nodes by dispatching to type-specific handlers.
#[derive(Clone)]
pub struct NodeRunner {
    agent: Arc<dyn AgentPromptExecutor>,
}

impl NodeRunner {
    pub fn new(agent: Arc<dyn AgentPromptExecutor>) -> Self {
        Self { agent }
    }

    pub fn agent(&self) -> &Arc<dyn AgentPromptExecutor> {
        &self.agent
    }

    /// Run a node and return its output.
    pub async fn run(
        &self,
        node: &WorkflowNode,
        ctx: &NodeExecutionContext,
    ) -> Result<NodeOutput, NodeError> {
        match &node.node_type {
            NodeType::Start | NodeType::End => Ok(NodeOutput::value(json!({ "ok": true }))),
            NodeType::Wait => self.run_wait(node, ctx).await,
            NodeType::Condition => self.run_condition(node, ctx),
            NodeType::Approval => self.run_approval(node, ctx),
            NodeType::AgentStep => self.run_agent_step(node, ctx).await,
            NodeType::Tool
            | NodeType::McpTool
            | NodeType::ConnectorTool
            | NodeType::MemoryRead
            | NodeType::MemoryWrite
            | NodeType::Notification
            | NodeType::Subworkflow => self.run_dispatch(node, ctx).await,
            NodeType::Parallel | NodeType::Loop => Ok(Self::run_passthrough(node)),
            NodeType::Unsupported(name) => Err(NodeError::UnsupportedNodeType(name.clone())),
        }
    }

    // -- wait: resolve duration, sleep --

    async fn run_wait(
        &self,
        node: &WorkflowNode,
        ctx: &NodeExecutionContext,
    ) -> Result<NodeOutput, NodeError> {
        let config: WaitConfig = config_view(node)?;
        let raw = config
            .duration_ms
            .ok_or_else(|| NodeError::config(node, "wait requires duration_ms"))?;

        let resolved = resolve_template_value(&raw, &ctx.template_context());
        let waited_ms = duration_from_value(&resolved.value).ok_or_else(|| {
            NodeError::config(
                node,
                format!("duration_ms did not resolve to a number: {}", resolved.value),
            )
        })?;

        tracing::debug!(node_id = node.id.as_str(), waited_ms, "waiting");
        tokio::time::sleep(Duration::from_millis(waited_ms)).await;

        Ok(NodeOutput::value(json!({ "waited_ms": waited_ms })).with_missing(resolved.missing_paths))
    }

    // -- condition: evaluate the DSL --

    fn run_condition(
        &self,
        node: &WorkflowNode,
        ctx: &NodeExecutionContext,
    ) -> Result<NodeOutput, NodeError> {
        let config: ConditionConfig = config_view(node)?;
        let expression = config
            .expression
            .ok_or_else(|| NodeError::config(node, "condition requires expression"))?;

        let evaluation = evaluate_expression(&expression, &ctx.template_context())?;
        tracing::debug!(
            node_id = node.id.as_str(),
            expression = expression.as_str(),
            result = evaluation.result,
            "condition evaluated"
        );

        Ok(NodeOutput::value(json!({
            "expression": expression,
            "result": evaluation.result,
        }))
        .with_missing(evaluation.missing_paths))
    }

    // -- approval: pass if auto-approved or approved out-of-band, else pause --

    fn run_approval(
        &self,
        node: &WorkflowNode,
        ctx: &NodeExecutionContext,
    ) -> Result<NodeOutput, NodeError> {
        let config: ApprovalConfig = config_view(node)?;
        let auto_approve = match &config.auto_approve {
            Some(Value::Bool(b)) => *b,
            Some(other) => is_truthy(&resolve_template_value(other, &ctx.template_context()).value),
            None => false,
        };

        if auto_approve || ctx.is_approved(&node.id) {
            return Ok(NodeOutput::value(json!({
                "approved": true,
                "auto_approved": auto_approve,
            })));
        }

        let reason = config
            .reason
            .unwrap_or_else(|| format!("approval required for node '{}'", node.id));
        Ok(NodeOutput {
            value: json!({
                "approved": false,
                "pause_requested": true,
                "pause_reason": reason,
            }),
            missing_paths: Vec::new(),
            pause_reason: Some(reason),
        })
    }

    // -- agent_step: resolve prompt, call the agent --

    async fn run_agent_step(
        &self,
        node: &WorkflowNode,
        ctx: &NodeExecutionContext,
    ) -> Result<NodeOutput, NodeError> {
        let config: AgentStepConfig = config_view(node)?;
        let template = config
            .prompt_template
            .or(config.prompt)
            .unwrap_or_default();

        let rendered = render_template(&template, &ctx.template_context());
        if rendered.value.trim().is_empty() {
            return Err(NodeError::EmptyPrompt(node.id.clone()));
        }
        if !rendered.missing_paths.is_empty() {
            tracing::warn!(
                node_id = node.id.as_str(),
                missing = ?rendered.missing_paths,
                "prompt template has unresolved paths"
            );
        }

        let response = self
            .agent
            .execute_agent_prompt(&rendered.value, &config.options)
            .await?;

        Ok(NodeOutput::value(json!({
            "text": response.content,
            "prompt_tokens": response.prompt_tokens,
            "completion_tokens": response.completion_tokens,
            "missing_paths": rendered.missing_paths,
        }))
        .with_missing(rendered.missing_paths))
    }

    // -- tool-like nodes: resolve config, synthesize an instruction, delegate --

    async fn run_dispatch(
        &self,
        node: &WorkflowNode,
        ctx: &NodeExecutionContext,
    ) -> Result<NodeOutput, NodeError> {
        let resolved = resolve_template_value(&Value::Object(node.config.clone()), &ctx.template_context());
        let options: AgentPromptOptions = serde_json::from_value(resolved.value.clone())
            .map_err(|e| NodeError::config(node, e.to_string()))?;

        let instruction = build_dispatch_instruction(node, &resolved.value, ctx.permissions_profile.as_deref());
        tracing::debug!(
            node_id = node.id.as_str(),
            node_type = %node.node_type,
            "dispatching node to agent"
        );

        let response = self.agent.execute_agent_prompt(&instruction, &options).await?;

        Ok(NodeOutput::value(json!({
            "text": response.content,
            "missing_paths": resolved.missing_paths,
        }))
        .with_missing(resolved.missing_paths))
    }

    // -- parallel/loop: compatibility marker only --

    fn run_passthrough(node: &WorkflowNode) -> NodeOutput {
        tracing::warn!(
            node_id = node.id.as_str(),
            node_type = %node.node_type,
            "composite node runs in pass-through mode"
        );
        NodeOutput::value(json!({
            "passthrough": true,
            "node_type": node.node_type.as_str(),
            "note": format!(
                "{} nodes are not executed yet; the node passes through without branching or iterating",
                node.node_type
            ),
        }))
    }
}

/// Accept a non-negative integer or a numeric string; negative values clamp to zero.
fn duration_from_value(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().map(|f| f.max(0.0).round() as u64)),
        Value::String(s) => s.trim().parse::<f64>().ok().map(|f| f.max(0.0).round() as u64),
        _ => None,
    }
}

/// Natural-language instruction describing a tool-like node.
pub fn build_dispatch_instruction(
    node: &WorkflowNode,
    resolved_config: &Value,
    permissions_profile: Option<&str>,
) -> String {
    let action = match node.node_type {
        NodeType::Tool => "Invoke the tool described by the configuration.",
        NodeType::McpTool => "Call the MCP server tool named in the configuration with the given arguments.",
        NodeType::ConnectorTool => "Use the configured connector to perform the requested operation.",
        NodeType::MemoryRead => "Read the requested entries from memory and return them.",
        NodeType::MemoryWrite => "Write the given content to memory.",
        NodeType::Notification => "Send the notification described by the configuration.",
        NodeType::Subworkflow => "Run the referenced sub-workflow with the given input and report its result.",
        _ => "Carry out the operation described by the configuration.",
    };

    let config_text =
        serde_json::to_string_pretty(resolved_config).unwrap_or_else(|_| resolved_config.to_string());

    let mut out = format!(
        "## Workflow Node: {name}\n\nNode id: {id}\nNode type: {kind}\n",
        name = node.name,
        id = node.id,
        kind = node.node_type,
    );
    if let Some(profile) = permissions_profile {
        out.push_str(&format!("Permissions profile: {profile}\n"));
    }
    out.push_str(&format!(
        "\n{action}\n\n**Configuration:**\n```json\n{config_text}\n```\n\nReply with a concise summary of the result."
    ));
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
