//! Workflow definition parsing, validation, and compilation.
//!
//! Converts YAML/JSON documents into the canonical `WorkflowDefinition`,
//! validates graph structure, and compiles it into a `CompiledWorkflow` with
//! pre-parsed edge guards and per-node outgoing edge lists kept in
//! declaration order.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use petgraph::graph::DiGraph;
use petgraph::visit::Dfs;
use serde_json::Value;
use stepwise_types::error::RepositoryError;
use stepwise_types::workflow::{EdgeCondition, NodeType, WorkflowDefinition, WorkflowEdge};
use thiserror::Error;
use uuid::Uuid;

use super::expression::{parse_expression, Expr};
use super::retry::RetryHandler;
use super::template::validate_template;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from definition loading, validation, and versioning.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// No stored definition for the requested id/version.
    #[error("workflow {id} not found{}", .version.map(|v| format!(" at version {v}")).unwrap_or_default())]
    NotFound { id: Uuid, version: Option<u32> },

    /// The workflow has no draft to publish or run.
    #[error("workflow {0} has no draft version")]
    NoDraft(Uuid),

    /// The workflow has never been published.
    #[error("workflow {0} has no published version")]
    NotPublished(Uuid),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML document into a `WorkflowDefinition` (not yet validated).
pub fn parse_definition_yaml(yaml: &str) -> Result<WorkflowDefinition, WorkflowError> {
    serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))
}

/// Parse a JSON document into a `WorkflowDefinition` (not yet validated).
pub fn parse_definition_json(json: &str) -> Result<WorkflowDefinition, WorkflowError> {
    serde_json::from_str(json).map_err(|e| WorkflowError::ParseError(e.to_string()))
}

/// Serialize a definition to YAML.
pub fn serialize_definition_yaml(def: &WorkflowDefinition) -> Result<String, WorkflowError> {
    serde_yaml_ng::to_string(def).map_err(|e| WorkflowError::ParseError(e.to_string()))
}

/// Load a definition file, choosing the format from its extension.
///
/// `.json` is parsed as JSON; everything else as YAML.
pub fn load_definition_file(path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));
    if is_json {
        parse_definition_json(&content)
    } else {
        parse_definition_yaml(&content)
    }
}

// ---------------------------------------------------------------------------
// Compiled form
// ---------------------------------------------------------------------------

/// Outcome of a node attempt, used to match structural edge conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeOutcome {
    Success,
    Failure,
}

/// Pre-parsed edge condition.
#[derive(Debug, Clone)]
enum Guard {
    Success,
    Failure,
    Always,
    Expression(Expr),
}

#[derive(Debug, Clone)]
struct CompiledEdge {
    edge: WorkflowEdge,
    guard: Guard,
}

/// A validated graph ready for execution.
#[derive(Debug, Clone)]
pub struct CompiledWorkflow {
    pub start_node_id: String,
    outgoing: HashMap<String, Vec<CompiledEdge>>,
    /// Non-fatal findings (e.g. unreachable nodes).
    pub warnings: Vec<String>,
}

impl CompiledWorkflow {
    /// Outgoing edges of a node in declaration order.
    pub fn outgoing(&self, node_id: &str) -> Vec<&WorkflowEdge> {
        self.outgoing
            .get(node_id)
            .map(|edges| edges.iter().map(|e| &e.edge).collect())
            .unwrap_or_default()
    }

    /// First outgoing edge, in declaration order, whose condition matches.
    ///
    /// `success` matches a successful outcome, `failure` a failed one, `always`
    /// either. Expression edges are only considered after a success and are
    /// evaluated against `context`.
    pub fn select_edge(
        &self,
        node_id: &str,
        outcome: EdgeOutcome,
        context: &Value,
    ) -> Option<&WorkflowEdge> {
        self.outgoing.get(node_id)?.iter().find_map(|compiled| {
            let matched = match (&compiled.guard, outcome) {
                (Guard::Always, _) => true,
                (Guard::Success, EdgeOutcome::Success) => true,
                (Guard::Failure, EdgeOutcome::Failure) => true,
                (Guard::Expression(expr), EdgeOutcome::Success) => {
                    expr.evaluate(context).result
                }
                _ => false,
            };
            matched.then_some(&compiled.edge)
        })
    }
}

/// A stored definition plus its compiled graph.
#[derive(Debug, Clone)]
pub struct ResolvedDefinition {
    pub definition: WorkflowDefinition,
    pub compiled: CompiledWorkflow,
}

// ---------------------------------------------------------------------------
// Compilation
// ---------------------------------------------------------------------------

/// Validate a definition and build its compiled form.
///
/// Checks:
/// - Name is non-empty and at least one node exists
/// - Node IDs and edge IDs are unique and non-empty
/// - Every edge references existing nodes
/// - Exactly one `start` node
/// - Retry profiles and overrides are valid, with `default_retry_profile` as
///   the baseline for nodes and definitions that name none
/// - Compensation blocks parse
/// - Condition-node expressions and expression edges parse
/// - `agent_step` prompt templates are well-formed
///
/// Nodes unreachable from `start` are reported as warnings, not errors.
pub fn compile_definition(
    def: &WorkflowDefinition,
    default_retry_profile: &str,
) -> Result<CompiledWorkflow, WorkflowError> {
    if def.name.trim().is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow name must not be empty".to_string(),
        ));
    }
    if def.nodes.is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow must have at least one node".to_string(),
        ));
    }

    // Unique node IDs
    let mut node_ids = HashSet::new();
    for node in &def.nodes {
        if node.id.trim().is_empty() {
            return Err(WorkflowError::ValidationError(
                "node ID must not be empty".to_string(),
            ));
        }
        if !node_ids.insert(node.id.as_str()) {
            return Err(WorkflowError::ValidationError(format!(
                "duplicate node ID: '{}'",
                node.id
            )));
        }
    }

    // Exactly one start node
    let starts: Vec<&str> = def
        .nodes
        .iter()
        .filter(|n| n.node_type == NodeType::Start)
        .map(|n| n.id.as_str())
        .collect();
    let start_node_id = match starts.as_slice() {
        [only] => only.to_string(),
        [] => {
            return Err(WorkflowError::ValidationError(
                "workflow must have exactly one start node, found none".to_string(),
            ));
        }
        many => {
            return Err(WorkflowError::ValidationError(format!(
                "workflow must have exactly one start node, found {}: {}",
                many.len(),
                many.join(", ")
            )));
        }
    };

    // Per-node configuration
    for node in &def.nodes {
        RetryHandler::policy_for_node(&def.defaults, node, default_retry_profile).map_err(|e| {
            WorkflowError::ValidationError(format!("node '{}': {e}", node.id))
        })?;
        node.compensation().map_err(|e| {
            WorkflowError::ValidationError(format!(
                "node '{}': invalid compensation block: {e}",
                node.id
            ))
        })?;

        match node.node_type {
            NodeType::Condition => {
                let expression = node
                    .config
                    .get("expression")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        WorkflowError::ValidationError(format!(
                            "condition node '{}' requires a string 'expression'",
                            node.id
                        ))
                    })?;
                parse_expression(expression).map_err(|e| {
                    WorkflowError::ValidationError(format!("condition node '{}': {e}", node.id))
                })?;
            }
            NodeType::AgentStep => {
                let template = node
                    .config
                    .get("prompt_template")
                    .or_else(|| node.config.get("promptTemplate"))
                    .or_else(|| node.config.get("prompt"))
                    .and_then(Value::as_str);
                if let Some(template) = template {
                    validate_template(template).map_err(|e| {
                        WorkflowError::ValidationError(format!("agent_step '{}': {e}", node.id))
                    })?;
                }
            }
            _ => {}
        }
    }

    // Edges
    let mut edge_ids = HashSet::new();
    let mut outgoing: HashMap<String, Vec<CompiledEdge>> = HashMap::new();
    for edge in &def.edges {
        if !edge_ids.insert(edge.id.as_str()) {
            return Err(WorkflowError::ValidationError(format!(
                "duplicate edge ID: '{}'",
                edge.id
            )));
        }
        for endpoint in [&edge.from, &edge.to] {
            if !node_ids.contains(endpoint.as_str()) {
                return Err(WorkflowError::ValidationError(format!(
                    "edge '{}' references unknown node '{}'",
                    edge.id, endpoint
                )));
            }
        }
        let guard = match &edge.condition {
            EdgeCondition::Success => Guard::Success,
            EdgeCondition::Failure => Guard::Failure,
            EdgeCondition::Always => Guard::Always,
            EdgeCondition::Expression(src) => {
                Guard::Expression(parse_expression(src).map_err(|e| {
                    WorkflowError::ValidationError(format!("edge '{}': {e}", edge.id))
                })?)
            }
        };
        outgoing
            .entry(edge.from.clone())
            .or_default()
            .push(CompiledEdge {
                edge: edge.clone(),
                guard,
            });
    }

    let warnings = unreachable_nodes(def, &start_node_id)
        .into_iter()
        .map(|id| format!("node '{id}' is unreachable from start"))
        .collect::<Vec<_>>();
    for warning in &warnings {
        tracing::warn!(workflow = %def.name, "{warning}");
    }

    Ok(CompiledWorkflow {
        start_node_id,
        outgoing,
        warnings,
    })
}

/// Node IDs not reachable from `start_id`, in declaration order.
fn unreachable_nodes<'a>(def: &'a WorkflowDefinition, start_id: &str) -> Vec<&'a str> {
    let mut graph = DiGraph::<&str, ()>::new();
    let indices: HashMap<&str, _> = def
        .nodes
        .iter()
        .map(|n| (n.id.as_str(), graph.add_node(n.id.as_str())))
        .collect();
    for edge in &def.edges {
        if let (Some(&from), Some(&to)) = (
            indices.get(edge.from.as_str()),
            indices.get(edge.to.as_str()),
        ) {
            graph.add_edge(from, to, ());
        }
    }

    let Some(&start) = indices.get(start_id) else {
        return def.nodes.iter().map(|n| n.id.as_str()).collect();
    };
    let mut reached = HashSet::new();
    let mut dfs = Dfs::new(&graph, start);
    while let Some(idx) = dfs.next(&graph) {
        reached.insert(graph[idx]);
    }

    def.nodes
        .iter()
        .map(|n| n.id.as_str())
        .filter(|id| !reached.contains(id))
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const DIGEST_YAML: &str = r#"
name: daily-digest
tags: [reports]
triggers:
  - type: schedule
    cron: "0 8 * * *"
defaults:
  node_timeout_ms: 60000
  retry:
    profile: fast_safe
nodes:
  - id: start
    type: start
    name: Start
  - id: check
    type: condition
    name: Anything new?
    config:
      expression: "contains({{ input.sources }}, 'rss')"
  - id: summarize
    type: agent_step
    name: Summarize
    config:
      promptTemplate: "Summarize {{ input.sources }}"
    retry:
      maxAttempts: 4
  - id: end
    type: end
    name: End
edges:
  - { id: e1, from: start, to: check }
  - { id: e2, from: check, to: summarize, condition: "eq({{ nodes.check.result }}, true)" }
  - { id: e3, from: check, to: end, condition: always }
  - { id: e4, from: summarize, to: end }
"#;

    fn def_from(value: Value) -> WorkflowDefinition {
        serde_json::from_value(value).unwrap()
    }

    fn minimal(nodes: Value, edges: Value) -> WorkflowDefinition {
        def_from(json!({ "name": "wf", "nodes": nodes, "edges": edges }))
    }

    #[test]
    fn parse_and_compile_yaml() {
        let def = parse_definition_yaml(DIGEST_YAML).unwrap();
        assert_eq!(def.nodes.len(), 4);
        assert_eq!(def.defaults.node_timeout_ms, Some(60_000));

        let compiled = compile_definition(&def, "balanced").unwrap();
        assert_eq!(compiled.start_node_id, "start");
        assert!(compiled.warnings.is_empty());
        let ids: Vec<&str> = compiled
            .outgoing("check")
            .iter()
            .map(|e| e.id.as_str())
            .collect();
        assert_eq!(ids, vec!["e2", "e3"]);
    }

    #[test]
    fn yaml_roundtrip_preserves_graph() {
        let def = parse_definition_yaml(DIGEST_YAML).unwrap();
        let yaml = serialize_definition_yaml(&def).unwrap();
        let again = parse_definition_yaml(&yaml).unwrap();
        assert_eq!(again.id, def.id);
        assert_eq!(again.edges.len(), 4);
        assert_eq!(again.edges[2].condition, EdgeCondition::Always);
    }

    #[test]
    fn select_edge_first_match_in_declaration_order() {
        let def = minimal(
            json!([
                { "id": "s", "type": "start", "name": "S" },
                { "id": "a", "type": "end", "name": "A" },
                { "id": "b", "type": "end", "name": "B" }
            ]),
            json!([
                { "id": "e1", "from": "s", "to": "a", "condition": "always" },
                { "id": "e2", "from": "s", "to": "b", "condition": "success" }
            ]),
        );
        let compiled = compile_definition(&def, "balanced").unwrap();
        for _ in 0..5 {
            let e = compiled
                .select_edge("s", EdgeOutcome::Success, &json!({}))
                .unwrap();
            assert_eq!(e.id, "e1");
        }
    }

    #[test]
    fn select_edge_by_outcome_and_expression() {
        let def = minimal(
            json!([
                { "id": "s", "type": "start", "name": "S" },
                { "id": "ok", "type": "end", "name": "Ok" },
                { "id": "hot", "type": "end", "name": "Hot" },
                { "id": "bad", "type": "end", "name": "Bad" }
            ]),
            json!([
                { "id": "e1", "from": "s", "to": "hot", "condition": "eq({{ nodes.s.temp }}, high)" },
                { "id": "e2", "from": "s", "to": "bad", "condition": "failure" },
                { "id": "e3", "from": "s", "to": "ok" }
            ]),
        );
        let compiled = compile_definition(&def, "balanced").unwrap();

        let hot = json!({ "nodes": { "s": { "temp": "high" } } });
        let cold = json!({ "nodes": { "s": { "temp": "low" } } });
        assert_eq!(compiled.select_edge("s", EdgeOutcome::Success, &hot).unwrap().to, "hot");
        assert_eq!(compiled.select_edge("s", EdgeOutcome::Success, &cold).unwrap().to, "ok");
        assert_eq!(compiled.select_edge("s", EdgeOutcome::Failure, &hot).unwrap().to, "bad");
        assert!(compiled.select_edge("ok", EdgeOutcome::Success, &hot).is_none());
    }

    #[test]
    fn rejects_structural_errors() {
        let no_start = minimal(json!([{ "id": "a", "type": "end", "name": "A" }]), json!([]));
        assert!(matches!(
            compile_definition(&no_start, "balanced"),
            Err(WorkflowError::ValidationError(m)) if m.contains("found none")
        ));

        let two_starts = minimal(
            json!([
                { "id": "a", "type": "start", "name": "A" },
                { "id": "b", "type": "start", "name": "B" }
            ]),
            json!([]),
        );
        assert!(compile_definition(&two_starts, "balanced").is_err());

        let dup = minimal(
            json!([
                { "id": "a", "type": "start", "name": "A" },
                { "id": "a", "type": "end", "name": "A2" }
            ]),
            json!([]),
        );
        assert!(matches!(
            compile_definition(&dup, "balanced"),
            Err(WorkflowError::ValidationError(m)) if m.contains("duplicate node")
        ));

        let dangling = minimal(
            json!([{ "id": "a", "type": "start", "name": "A" }]),
            json!([{ "id": "e", "from": "a", "to": "ghost" }]),
        );
        assert!(matches!(
            compile_definition(&dangling, "balanced"),
            Err(WorkflowError::ValidationError(m)) if m.contains("ghost")
        ));
    }

    #[test]
    fn rejects_bad_expressions_and_profiles() {
        let bad_edge = minimal(
            json!([
                { "id": "a", "type": "start", "name": "A" },
                { "id": "b", "type": "end", "name": "B" }
            ]),
            json!([{ "id": "e", "from": "a", "to": "b", "condition": "gt(1, 2)" }]),
        );
        assert!(compile_definition(&bad_edge, "balanced").is_err());

        let bad_condition = minimal(
            json!([
                { "id": "a", "type": "start", "name": "A" },
                { "id": "c", "type": "condition", "name": "C", "config": {} }
            ]),
            json!([]),
        );
        assert!(compile_definition(&bad_condition, "balanced").is_err());

        let bad_profile = minimal(
            json!([
                { "id": "a", "type": "start", "name": "A", "retry": { "profile": "reckless" } }
            ]),
            json!([]),
        );
        assert!(matches!(
            compile_definition(&bad_profile, "balanced"),
            Err(WorkflowError::ValidationError(m)) if m.contains("reckless")
        ));
    }

    #[test]
    fn compiles_against_the_given_default_profile() {
        let def = minimal(
            json!([
                { "id": "a", "type": "start", "name": "A" },
                { "id": "b", "type": "end", "name": "B", "retry": { "profile": "fast_safe" } }
            ]),
            json!([{ "id": "e", "from": "a", "to": "b" }]),
        );
        assert!(compile_definition(&def, "strict_enterprise").is_ok());
        assert!(matches!(
            compile_definition(&def, "turbo"),
            Err(WorkflowError::ValidationError(m)) if m.contains("node 'a'") && m.contains("turbo")
        ));
    }

    #[test]
    fn rejects_malformed_compensation_block() {
        let def = minimal(
            json!([
                { "id": "a", "type": "start", "name": "A" },
                { "id": "t", "type": "tool", "name": "T",
                  "config": { "compensation": { "enabled": true, "strategy": "before-retry" } } }
            ]),
            json!([{ "id": "e", "from": "a", "to": "t" }]),
        );
        assert!(matches!(
            compile_definition(&def, "balanced"),
            Err(WorkflowError::ValidationError(m)) if m.contains("node 't': invalid compensation block")
        ));
    }

    #[test]
    fn unreachable_nodes_are_warnings() {
        let def = minimal(
            json!([
                { "id": "s", "type": "start", "name": "S" },
                { "id": "e", "type": "end", "name": "E" },
                { "id": "orphan", "type": "notification", "name": "O" }
            ]),
            json!([{ "id": "e1", "from": "s", "to": "e" }]),
        );
        let compiled = compile_definition(&def, "balanced").unwrap();
        assert_eq!(compiled.warnings.len(), 1);
        assert!(compiled.warnings[0].contains("orphan"));
    }

    #[test]
    fn load_definition_file_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let yaml_path = dir.path().join("digest.yaml");
        std::fs::write(&yaml_path, DIGEST_YAML).unwrap();
        let def = load_definition_file(&yaml_path).unwrap();
        assert_eq!(def.name, "daily-digest");

        let json_path = dir.path().join("digest.json");
        std::fs::write(&json_path, serde_json::to_string(&def).unwrap()).unwrap();
        let again = load_definition_file(&json_path).unwrap();
        assert_eq!(again.id, def.id);

        assert!(matches!(
            load_definition_file(&dir.path().join("missing.yaml")),
            Err(WorkflowError::IoError(_))
        ));
    }
}
