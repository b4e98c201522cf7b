//! In-memory repository and scripted agent for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use stepwise_types::error::RepositoryError;
use stepwise_types::event::WorkflowEvent;
use chrono::{DateTime, Utc};
use stepwise_types::workflow::{
    DefinitionStatus, LeaseClaim, NodeRun, NodeRunCompletion, RunPatch, WorkflowAlias,
    WorkflowDefinition, WorkflowRun,
};
use uuid::Uuid;

use crate::repository::workflow::{
    WorkflowDefinitionRepository, WorkflowEventRepository, WorkflowRunRepository,
};
use crate::workflow::agent::{
    AgentError, AgentPromptExecutor, AgentPromptOptions, AgentPromptResponse, BoxFuture,
};

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct State {
    definitions: HashMap<(Uuid, u32), WorkflowDefinition>,
    aliases: HashMap<Uuid, WorkflowAlias>,
    runs: HashMap<Uuid, WorkflowRun>,
    node_runs: Vec<NodeRun>,
    events: Vec<WorkflowEvent>,
}

/// Shared in-memory store implementing every repository trait.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a run row directly (simulates state left by another process).
    pub fn put_run(&self, run: WorkflowRun) {
        self.state.lock().unwrap().runs.insert(run.id, run);
    }

    /// Insert a node-run row directly.
    pub fn put_node_run(&self, node_run: NodeRun) {
        self.state.lock().unwrap().node_runs.push(node_run);
    }
}

impl WorkflowDefinitionRepository for MemoryStore {
    async fn insert_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().unwrap();
        let key = (def.id, def.version);
        if state.definitions.contains_key(&key) {
            return Err(RepositoryError::Conflict(format!(
                "definition {} v{} exists",
                def.id, def.version
            )));
        }
        state.definitions.insert(key, def.clone());
        Ok(())
    }

    async fn get_definition(
        &self,
        id: &Uuid,
        version: u32,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self.state.lock().unwrap().definitions.get(&(*id, version)).cloned())
    }

    async fn latest_version(&self, id: &Uuid) -> Result<Option<u32>, RepositoryError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .definitions
            .keys()
            .filter(|(def_id, _)| def_id == id)
            .map(|(_, v)| *v)
            .max())
    }

    async fn update_definition_status(
        &self,
        id: &Uuid,
        version: u32,
        status: DefinitionStatus,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().unwrap();
        let def = state
            .definitions
            .get_mut(&(*id, version))
            .ok_or(RepositoryError::NotFound)?;
        def.status = status;
        Ok(())
    }

    async fn get_alias(&self, id: &Uuid) -> Result<Option<WorkflowAlias>, RepositoryError> {
        Ok(self.state.lock().unwrap().aliases.get(id).cloned())
    }

    async fn set_alias(&self, alias: &WorkflowAlias) -> Result<(), RepositoryError> {
        self.state
            .lock()
            .unwrap()
            .aliases
            .insert(alias.workflow_id, alias.clone());
        Ok(())
    }

    async fn list_aliases(&self) -> Result<Vec<WorkflowAlias>, RepositoryError> {
        let mut aliases: Vec<_> = self.state.lock().unwrap().aliases.values().cloned().collect();
        aliases.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(aliases)
    }
}

impl WorkflowRunRepository for MemoryStore {
    async fn create_run(&self, run: &WorkflowRun) -> Result<(), RepositoryError> {
        self.state.lock().unwrap().runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<WorkflowRun>, RepositoryError> {
        Ok(self.state.lock().unwrap().runs.get(run_id).cloned())
    }

    async fn update_run(&self, run_id: &Uuid, patch: &RunPatch) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().unwrap();
        let run = state.runs.get_mut(run_id).ok_or(RepositoryError::NotFound)?;
        apply_patch(run, patch);
        Ok(())
    }

    async fn update_claimed_run(
        &self,
        run_id: &Uuid,
        lease_version: u64,
        patch: &RunPatch,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().unwrap();
        let run = held_run(&mut state, run_id, lease_version)?;
        apply_patch(run, patch);
        Ok(())
    }

    async fn claim_run(&self, run_id: &Uuid, claim: &LeaseClaim) -> Result<u64, RepositoryError> {
        let mut state = self.state.lock().unwrap();
        let run = state.runs.get_mut(run_id).ok_or(RepositoryError::NotFound)?;
        if run.lease_version != claim.expected {
            return Err(RepositoryError::Conflict(format!(
                "lease moved from {} to {}",
                claim.expected, run.lease_version
            )));
        }
        let live_elsewhere = run.lease_holder.as_deref().is_some_and(|h| h != claim.holder)
            && run.lease_expires_at.is_some_and(|at| at > claim.now);
        if live_elsewhere {
            return Err(RepositoryError::Conflict(format!(
                "run {run_id} is leased by another driver"
            )));
        }
        run.lease_version += 1;
        run.lease_holder = Some(claim.holder.clone());
        run.lease_expires_at = Some(claim.expires_at);
        Ok(run.lease_version)
    }

    async fn renew_lease(
        &self,
        run_id: &Uuid,
        lease_version: u64,
        expires_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().unwrap();
        held_run(&mut state, run_id, lease_version)?.lease_expires_at = Some(expires_at);
        Ok(())
    }

    async fn release_lease(&self, run_id: &Uuid, lease_version: u64) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().unwrap();
        if let Some(run) = state.runs.get_mut(run_id) {
            if run.lease_version == lease_version {
                run.lease_holder = None;
                run.lease_expires_at = None;
            }
        }
        Ok(())
    }

    async fn list_runs(
        &self,
        workflow_id: Option<&Uuid>,
        limit: u32,
    ) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let mut runs: Vec<_> = self
            .state
            .lock()
            .unwrap()
            .runs
            .values()
            .filter(|r| workflow_id.is_none_or(|id| &r.workflow_id == id))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs.truncate(limit as usize);
        Ok(runs)
    }

    async fn create_node_run(
        &self,
        node_run: &NodeRun,
        lease_version: u64,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().unwrap();
        held_run(&mut state, &node_run.run_id, lease_version)?;
        let duplicate = state.node_runs.iter().any(|n| {
            n.run_id == node_run.run_id
                && n.node_id == node_run.node_id
                && n.attempt == node_run.attempt
        });
        if duplicate {
            return Err(RepositoryError::Conflict(format!(
                "node run {}#{} exists",
                node_run.node_id, node_run.attempt
            )));
        }
        state.node_runs.push(node_run.clone());
        Ok(())
    }

    async fn complete_node_run(
        &self,
        node_run_id: &Uuid,
        lease_version: u64,
        completion: &NodeRunCompletion,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().unwrap();
        let run_id = state
            .node_runs
            .iter()
            .find(|n| &n.id == node_run_id)
            .map(|n| n.run_id)
            .ok_or(RepositoryError::NotFound)?;
        held_run(&mut state, &run_id, lease_version)?;
        let row = state
            .node_runs
            .iter_mut()
            .find(|n| &n.id == node_run_id)
            .ok_or(RepositoryError::NotFound)?;
        if row.status.is_terminal() {
            return Err(RepositoryError::Conflict(format!(
                "node run {node_run_id} already {}",
                row.status
            )));
        }
        row.status = completion.status;
        row.output = completion.output.clone();
        row.error = completion.error.clone();
        row.completed_at = Some(completion.completed_at);
        row.duration_ms = Some(completion.duration_ms);
        Ok(())
    }

    async fn list_node_runs(&self, run_id: &Uuid) -> Result<Vec<NodeRun>, RepositoryError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .node_runs
            .iter()
            .filter(|n| &n.run_id == run_id)
            .cloned()
            .collect())
    }
}

fn apply_patch(run: &mut WorkflowRun, patch: &RunPatch) {
    if let Some(status) = patch.status {
        run.status = status;
    }
    if let Some(current) = &patch.current_node_id {
        run.current_node_id = current.clone();
    }
    if let Some(input) = &patch.input {
        run.input = input.clone();
    }
    if let Some(output) = &patch.output {
        run.output = output.clone();
    }
    if let Some(error) = &patch.error {
        run.error = error.clone();
    }
    if let Some(started_at) = patch.started_at {
        run.started_at = Some(started_at);
    }
    if let Some(completed_at) = patch.completed_at {
        run.completed_at = Some(completed_at);
    }
    run.updated_at = Utc::now();
}

/// The run, if its lease is still `lease_version`.
fn held_run<'a>(
    state: &'a mut State,
    run_id: &Uuid,
    lease_version: u64,
) -> Result<&'a mut WorkflowRun, RepositoryError> {
    let run = state.runs.get_mut(run_id).ok_or(RepositoryError::NotFound)?;
    if run.lease_version != lease_version {
        return Err(RepositoryError::LeaseLost {
            run_id: *run_id,
            lease_version,
        });
    }
    Ok(run)
}

impl WorkflowEventRepository for MemoryStore {
    async fn append_event(&self, event: &WorkflowEvent) -> Result<(), RepositoryError> {
        self.state.lock().unwrap().events.push(event.clone());
        Ok(())
    }

    async fn list_events(&self, run_id: &Uuid) -> Result<Vec<WorkflowEvent>, RepositoryError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .events
            .iter()
            .filter(|e| &e.run_id == run_id)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// ScriptedAgent
// ---------------------------------------------------------------------------

struct Rule {
    needle: String,
    responses: VecDeque<Result<String, String>>,
}

/// Agent double: the first rule whose needle occurs in the prompt and still has
/// scripted responses answers; otherwise it echoes a generic success.
#[derive(Default)]
pub struct ScriptedAgent {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<(String, AgentPromptOptions)>>,
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, needle: &str, responses: Vec<Result<&str, &str>>) -> Self {
        self.rules.lock().unwrap().push(Rule {
            needle: needle.to_string(),
            responses: responses
                .into_iter()
                .map(|r| r.map(str::to_string).map_err(str::to_string))
                .collect(),
        });
        self
    }

    pub fn calls(&self) -> Vec<(String, AgentPromptOptions)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.calls().into_iter().map(|(p, _)| p).collect()
    }

    pub fn count_containing(&self, needle: &str) -> usize {
        self.prompts().iter().filter(|p| p.contains(needle)).count()
    }
}

impl AgentPromptExecutor for ScriptedAgent {
    fn execute_agent_prompt<'a>(
        &'a self,
        prompt: &'a str,
        options: &'a AgentPromptOptions,
    ) -> BoxFuture<'a, Result<AgentPromptResponse, AgentError>> {
        self.calls
            .lock()
            .unwrap()
            .push((prompt.to_string(), options.clone()));

        let scripted = self
            .rules
            .lock()
            .unwrap()
            .iter_mut()
            .find(|r| prompt.contains(&r.needle) && !r.responses.is_empty())
            .and_then(|r| r.responses.pop_front());

        let result = match scripted {
            Some(Ok(content)) => Ok(content),
            Some(Err(message)) => Err(AgentError::Other(message)),
            None => Ok("done".to_string()),
        };

        Box::pin(async move {
            result.map(|content| AgentPromptResponse {
                content,
                prompt_tokens: Some(12),
                completion_tokens: Some(4),
            })
        })
    }
}
