//! SQLite workflow repository implementation.
//!
//! Implements the definition, run, and event repository traits from
//! `stepwise-core` using sqlx with split read/write pools. Definitions and run
//! documents are stored as JSON text; timestamps are RFC 3339 with fixed
//! microsecond precision so they sort lexically.
//!
//! Writes made by a driver are fenced: they carry the lease version the driver
//! claimed and touch nothing once the run's `lease_version` has moved on.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use stepwise_core::repository::workflow::{
    WorkflowDefinitionRepository, WorkflowEventRepository, WorkflowRunRepository,
};
use stepwise_types::error::RepositoryError;
use stepwise_types::event::WorkflowEvent;
use stepwise_types::workflow::{
    DefinitionStatus, LeaseClaim, NodeRun, NodeRunCompletion, RunPatch, WorkflowAlias,
    WorkflowDefinition, WorkflowRun,
};
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed store for definitions, runs, node-runs, and events.
#[derive(Clone)]
pub struct SqliteWorkflowRepository {
    pool: DatabasePool,
}

impl SqliteWorkflowRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Apply a run patch in one statement, fenced on `lease_version` when given.
    async fn patch_run(
        &self,
        run_id: &Uuid,
        lease_version: Option<u64>,
        patch: &RunPatch,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE workflow_runs SET
                 status = COALESCE(?, status),
                 current_node_id = CASE WHEN ? THEN ? ELSE current_node_id END,
                 input = COALESCE(?, input),
                 output = COALESCE(?, output),
                 error = CASE WHEN ? THEN ? ELSE error END,
                 started_at = COALESCE(?, started_at),
                 completed_at = COALESCE(?, completed_at),
                 updated_at = ?
               WHERE id = ? AND (? IS NULL OR lease_version = ?)"#,
        )
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.current_node_id.is_some())
        .bind(patch.current_node_id.clone().flatten())
        .bind(patch.input.as_ref().map(to_json).transpose()?)
        .bind(patch.output.as_ref().map(to_json).transpose()?)
        .bind(patch.error.is_some())
        .bind(patch.error.clone().flatten())
        .bind(patch.started_at.as_ref().map(format_datetime))
        .bind(patch.completed_at.as_ref().map(format_datetime))
        .bind(format_datetime(&Utc::now()))
        .bind(run_id.to_string())
        .bind(lease_version.map(|v| v as i64))
        .bind(lease_version.map(|v| v as i64))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 1 {
            return Ok(());
        }
        match lease_version {
            Some(version) => Err(self.fence_error(run_id, version).await?),
            None => Err(RepositoryError::NotFound),
        }
    }

    /// Why a write fenced on `lease_version` touched no row.
    async fn fence_error(
        &self,
        run_id: &Uuid,
        lease_version: u64,
    ) -> Result<RepositoryError, RepositoryError> {
        let exists: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM workflow_runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(query_err)?;
        Ok(match exists {
            Some(_) => {
                tracing::warn!(run_id = %run_id, lease_version, "write refused: lease moved");
                RepositoryError::LeaseLost {
                    run_id: *run_id,
                    lease_version,
                }
            }
            None => RepositoryError::NotFound,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn query_err(e: sqlx::Error) -> RepositoryError {
    match e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            RepositoryError::Conflict(db.message().to_string())
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => RepositoryError::Connection,
        other => RepositoryError::Query(other.to_string()),
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(format!("serialize: {e}")))
}

fn from_json<T: DeserializeOwned>(s: &str, what: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid {what} JSON: {e}")))
}

/// Parse a snake_case enum column through its serde representation.
fn parse_enum<T: DeserializeOwned>(s: &str, what: &str) -> Result<T, RepositoryError> {
    serde_json::from_value(Value::String(s.to_string()))
        .map_err(|_| RepositoryError::Query(format!("invalid {what}: {s}")))
}

fn get<'r, T>(row: &'r SqliteRow, column: &str) -> Result<T, RepositoryError>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(column).map_err(query_err)
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn definition_from_row(row: &SqliteRow) -> Result<WorkflowDefinition, RepositoryError> {
    let body: String = get(row, "definition")?;
    let status: String = get(row, "status")?;
    let mut def: WorkflowDefinition = from_json(&body, "workflow definition")?;
    // The status column is authoritative; archiving only touches the column.
    def.status = parse_enum(&status, "definition status")?;
    Ok(def)
}

fn alias_from_row(row: &SqliteRow) -> Result<WorkflowAlias, RepositoryError> {
    let workflow_id: String = get(row, "workflow_id")?;
    let draft: Option<i64> = get(row, "draft_version")?;
    let published: Option<i64> = get(row, "published_version")?;
    let updated_at: String = get(row, "updated_at")?;
    Ok(WorkflowAlias {
        workflow_id: parse_uuid(&workflow_id)?,
        name: get(row, "name")?,
        draft_version: draft.map(|v| v as u32),
        published_version: published.map(|v| v as u32),
        updated_at: parse_datetime(&updated_at)?,
    })
}

fn run_from_row(row: &SqliteRow) -> Result<WorkflowRun, RepositoryError> {
    let id: String = get(row, "id")?;
    let workflow_id: String = get(row, "workflow_id")?;
    let version: i64 = get(row, "workflow_version")?;
    let status: String = get(row, "status")?;
    let input: String = get(row, "input")?;
    let output: String = get(row, "output")?;
    let lease_version: i64 = get(row, "lease_version")?;
    let lease_expires_at: Option<String> = get(row, "lease_expires_at")?;
    let created_at: String = get(row, "created_at")?;
    let updated_at: String = get(row, "updated_at")?;
    let started_at: Option<String> = get(row, "started_at")?;
    let completed_at: Option<String> = get(row, "completed_at")?;

    Ok(WorkflowRun {
        id: parse_uuid(&id)?,
        workflow_id: parse_uuid(&workflow_id)?,
        workflow_version: version as u32,
        status: parse_enum(&status, "run status")?,
        current_node_id: get(row, "current_node_id")?,
        input: from_json(&input, "run input")?,
        output: from_json(&output, "run output")?,
        correlation_id: get(row, "correlation_id")?,
        error: get(row, "error")?,
        lease_version: lease_version.max(0) as u64,
        lease_holder: get(row, "lease_holder")?,
        lease_expires_at: lease_expires_at.as_deref().map(parse_datetime).transpose()?,
        created_at: parse_datetime(&created_at)?,
        updated_at: parse_datetime(&updated_at)?,
        started_at: started_at.as_deref().map(parse_datetime).transpose()?,
        completed_at: completed_at.as_deref().map(parse_datetime).transpose()?,
    })
}

fn node_run_from_row(row: &SqliteRow) -> Result<NodeRun, RepositoryError> {
    let id: String = get(row, "id")?;
    let run_id: String = get(row, "run_id")?;
    let attempt: i64 = get(row, "attempt")?;
    let status: String = get(row, "status")?;
    let input: String = get(row, "input")?;
    let output: Option<String> = get(row, "output")?;
    let started_at: String = get(row, "started_at")?;
    let completed_at: Option<String> = get(row, "completed_at")?;
    let duration_ms: Option<i64> = get(row, "duration_ms")?;

    Ok(NodeRun {
        id: parse_uuid(&id)?,
        run_id: parse_uuid(&run_id)?,
        node_id: get(row, "node_id")?,
        attempt: attempt as u32,
        status: parse_enum(&status, "node run status")?,
        input: from_json(&input, "node run input")?,
        output: output
            .as_deref()
            .map(|s| from_json(s, "node run output"))
            .transpose()?,
        error: get(row, "error")?,
        started_at: parse_datetime(&started_at)?,
        completed_at: completed_at.as_deref().map(parse_datetime).transpose()?,
        duration_ms: duration_ms.map(|d| d.max(0) as u64),
    })
}

fn event_from_row(row: &SqliteRow) -> Result<WorkflowEvent, RepositoryError> {
    let id: String = get(row, "id")?;
    let run_id: String = get(row, "run_id")?;
    let event_type: String = get(row, "event_type")?;
    let payload: String = get(row, "payload")?;
    let created_at: String = get(row, "created_at")?;
    Ok(WorkflowEvent {
        id: parse_uuid(&id)?,
        run_id: parse_uuid(&run_id)?,
        event_type: parse_enum(&event_type, "event type")?,
        payload: from_json(&payload, "event payload")?,
        created_at: parse_datetime(&created_at)?,
    })
}

const RUN_COLUMNS: &str = "id, workflow_id, workflow_version, status, current_node_id, input, output, \
     correlation_id, error, lease_version, lease_holder, lease_expires_at, created_at, updated_at, \
     started_at, completed_at";

const NODE_RUN_COLUMNS: &str =
    "id, run_id, node_id, attempt, status, input, output, error, started_at, completed_at, duration_ms";

// ---------------------------------------------------------------------------
// WorkflowDefinitionRepository impl
// ---------------------------------------------------------------------------

impl WorkflowDefinitionRepository for SqliteWorkflowRepository {
    async fn insert_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO workflow_definitions (id, version, name, status, definition, created_at)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(def.id.to_string())
        .bind(def.version as i64)
        .bind(&def.name)
        .bind(def.status.to_string())
        .bind(to_json(def)?)
        .bind(format_datetime(&Utc::now()))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;
        Ok(())
    }

    async fn get_definition(
        &self,
        id: &Uuid,
        version: u32,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query(
            "SELECT status, definition FROM workflow_definitions WHERE id = ? AND version = ?",
        )
        .bind(id.to_string())
        .bind(version as i64)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_err)?;

        row.as_ref().map(definition_from_row).transpose()
    }

    async fn latest_version(&self, id: &Uuid) -> Result<Option<u32>, RepositoryError> {
        let (max,): (Option<i64>,) =
            sqlx::query_as("SELECT MAX(version) FROM workflow_definitions WHERE id = ?")
                .bind(id.to_string())
                .fetch_one(&self.pool.reader)
                .await
                .map_err(query_err)?;
        Ok(max.map(|v| v as u32))
    }

    async fn update_definition_status(
        &self,
        id: &Uuid,
        version: u32,
        status: DefinitionStatus,
    ) -> Result<(), RepositoryError> {
        let result =
            sqlx::query("UPDATE workflow_definitions SET status = ? WHERE id = ? AND version = ?")
                .bind(status.to_string())
                .bind(id.to_string())
                .bind(version as i64)
                .execute(&self.pool.writer)
                .await
                .map_err(query_err)?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn get_alias(&self, id: &Uuid) -> Result<Option<WorkflowAlias>, RepositoryError> {
        let row = sqlx::query(
            "SELECT workflow_id, name, draft_version, published_version, updated_at \
             FROM workflow_aliases WHERE workflow_id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_err)?;

        row.as_ref().map(alias_from_row).transpose()
    }

    async fn set_alias(&self, alias: &WorkflowAlias) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO workflow_aliases (workflow_id, name, draft_version, published_version, updated_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(workflow_id) DO UPDATE SET
                 name = excluded.name,
                 draft_version = excluded.draft_version,
                 published_version = excluded.published_version,
                 updated_at = excluded.updated_at"#,
        )
        .bind(alias.workflow_id.to_string())
        .bind(&alias.name)
        .bind(alias.draft_version.map(i64::from))
        .bind(alias.published_version.map(i64::from))
        .bind(format_datetime(&alias.updated_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;
        Ok(())
    }

    async fn list_aliases(&self) -> Result<Vec<WorkflowAlias>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT workflow_id, name, draft_version, published_version, updated_at \
             FROM workflow_aliases ORDER BY updated_at DESC",
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        rows.iter().map(alias_from_row).collect()
    }
}

// ---------------------------------------------------------------------------
// WorkflowRunRepository impl
// ---------------------------------------------------------------------------

impl WorkflowRunRepository for SqliteWorkflowRepository {
    async fn create_run(&self, run: &WorkflowRun) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO workflow_runs
               (id, workflow_id, workflow_version, status, current_node_id, input, output,
                correlation_id, error, lease_version, lease_holder, lease_expires_at,
                created_at, updated_at, started_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(run.id.to_string())
        .bind(run.workflow_id.to_string())
        .bind(run.workflow_version as i64)
        .bind(run.status.as_str())
        .bind(&run.current_node_id)
        .bind(to_json(&run.input)?)
        .bind(to_json(&run.output)?)
        .bind(&run.correlation_id)
        .bind(&run.error)
        .bind(run.lease_version as i64)
        .bind(&run.lease_holder)
        .bind(run.lease_expires_at.as_ref().map(format_datetime))
        .bind(format_datetime(&run.created_at))
        .bind(format_datetime(&run.updated_at))
        .bind(run.started_at.as_ref().map(format_datetime))
        .bind(run.completed_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;
        Ok(())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<WorkflowRun>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {RUN_COLUMNS} FROM workflow_runs WHERE id = ?"))
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        row.as_ref().map(run_from_row).transpose()
    }

    async fn update_run(&self, run_id: &Uuid, patch: &RunPatch) -> Result<(), RepositoryError> {
        self.patch_run(run_id, None, patch).await
    }

    async fn update_claimed_run(
        &self,
        run_id: &Uuid,
        lease_version: u64,
        patch: &RunPatch,
    ) -> Result<(), RepositoryError> {
        self.patch_run(run_id, Some(lease_version), patch).await
    }

    async fn claim_run(&self, run_id: &Uuid, claim: &LeaseClaim) -> Result<u64, RepositoryError> {
        let now = format_datetime(&claim.now);
        let result = sqlx::query(
            r#"UPDATE workflow_runs SET
                 lease_version = lease_version + 1,
                 lease_holder = ?,
                 lease_expires_at = ?,
                 updated_at = ?
               WHERE id = ? AND lease_version = ?
                 AND (lease_holder IS NULL OR lease_holder = ?
                      OR lease_expires_at IS NULL OR lease_expires_at <= ?)"#,
        )
        .bind(&claim.holder)
        .bind(format_datetime(&claim.expires_at))
        .bind(&now)
        .bind(run_id.to_string())
        .bind(claim.expected as i64)
        .bind(&claim.holder)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 1 {
            let version = claim.expected + 1;
            tracing::debug!(
                run_id = %run_id,
                lease_version = version,
                holder = claim.holder.as_str(),
                "claimed run lease"
            );
            return Ok(version);
        }

        let current: Option<(i64, Option<String>, Option<String>)> = sqlx::query_as(
            "SELECT lease_version, lease_holder, lease_expires_at FROM workflow_runs WHERE id = ?",
        )
        .bind(run_id.to_string())
        .fetch_optional(&self.pool.writer)
        .await
        .map_err(query_err)?;
        match current {
            Some((version, _, _)) if version.max(0) as u64 != claim.expected => {
                Err(RepositoryError::Conflict(format!(
                    "lease for run {run_id} moved from {} to {version}",
                    claim.expected
                )))
            }
            Some((_, holder, expires_at)) => Err(RepositoryError::Conflict(format!(
                "run {run_id} is leased by {} until {}",
                holder.unwrap_or_default(),
                expires_at.unwrap_or_default()
            ))),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn renew_lease(
        &self,
        run_id: &Uuid,
        lease_version: u64,
        expires_at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE workflow_runs SET lease_expires_at = ? WHERE id = ? AND lease_version = ?",
        )
        .bind(format_datetime(&expires_at))
        .bind(run_id.to_string())
        .bind(lease_version as i64)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 1 {
            return Ok(());
        }
        Err(self.fence_error(run_id, lease_version).await?)
    }

    async fn release_lease(&self, run_id: &Uuid, lease_version: u64) -> Result<(), RepositoryError> {
        sqlx::query(
            "UPDATE workflow_runs SET lease_holder = NULL, lease_expires_at = NULL \
             WHERE id = ? AND lease_version = ?",
        )
        .bind(run_id.to_string())
        .bind(lease_version as i64)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;
        Ok(())
    }

    async fn list_runs(
        &self,
        workflow_id: Option<&Uuid>,
        limit: u32,
    ) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let rows = match workflow_id {
            Some(id) => {
                sqlx::query(&format!(
                    "SELECT {RUN_COLUMNS} FROM workflow_runs WHERE workflow_id = ? \
                     ORDER BY created_at DESC LIMIT ?"
                ))
                .bind(id.to_string())
                .bind(limit as i64)
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {RUN_COLUMNS} FROM workflow_runs ORDER BY created_at DESC LIMIT ?"
                ))
                .bind(limit as i64)
                .fetch_all(&self.pool.reader)
                .await
            }
        }
        .map_err(query_err)?;

        rows.iter().map(run_from_row).collect()
    }

    async fn create_node_run(
        &self,
        node_run: &NodeRun,
        lease_version: u64,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"INSERT INTO node_runs
               (id, run_id, node_id, attempt, status, input, output, error,
                started_at, completed_at, duration_ms)
               SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?
               WHERE EXISTS (SELECT 1 FROM workflow_runs WHERE id = ? AND lease_version = ?)"#,
        )
        .bind(node_run.id.to_string())
        .bind(node_run.run_id.to_string())
        .bind(&node_run.node_id)
        .bind(node_run.attempt as i64)
        .bind(node_run.status.as_str())
        .bind(to_json(&node_run.input)?)
        .bind(node_run.output.as_ref().map(to_json).transpose()?)
        .bind(&node_run.error)
        .bind(format_datetime(&node_run.started_at))
        .bind(node_run.completed_at.as_ref().map(format_datetime))
        .bind(node_run.duration_ms.map(|d| d as i64))
        .bind(node_run.run_id.to_string())
        .bind(lease_version as i64)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 1 {
            return Ok(());
        }
        Err(self.fence_error(&node_run.run_id, lease_version).await?)
    }

    async fn complete_node_run(
        &self,
        node_run_id: &Uuid,
        lease_version: u64,
        completion: &NodeRunCompletion,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE node_runs SET
                 status = ?, output = ?, error = ?, completed_at = ?, duration_ms = ?
               WHERE id = ? AND status = 'running'
                 AND EXISTS (SELECT 1 FROM workflow_runs r
                             WHERE r.id = node_runs.run_id AND r.lease_version = ?)"#,
        )
        .bind(completion.status.as_str())
        .bind(completion.output.as_ref().map(to_json).transpose()?)
        .bind(&completion.error)
        .bind(format_datetime(&completion.completed_at))
        .bind(completion.duration_ms as i64)
        .bind(node_run_id.to_string())
        .bind(lease_version as i64)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        let existing: Option<(String, String)> =
            sqlx::query_as("SELECT run_id, status FROM node_runs WHERE id = ?")
                .bind(node_run_id.to_string())
                .fetch_optional(&self.pool.writer)
                .await
                .map_err(query_err)?;
        let Some((run_id, status)) = existing else {
            return Err(RepositoryError::NotFound);
        };
        if status != "running" {
            return Err(RepositoryError::Conflict(format!(
                "node run {node_run_id} already {status}"
            )));
        }
        Err(self.fence_error(&parse_uuid(&run_id)?, lease_version).await?)
    }

    async fn list_node_runs(&self, run_id: &Uuid) -> Result<Vec<NodeRun>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {NODE_RUN_COLUMNS} FROM node_runs WHERE run_id = ? ORDER BY started_at ASC, attempt ASC"
        ))
        .bind(run_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        rows.iter().map(node_run_from_row).collect()
    }
}

// ---------------------------------------------------------------------------
// WorkflowEventRepository impl
// ---------------------------------------------------------------------------

impl WorkflowEventRepository for SqliteWorkflowRepository {
    async fn append_event(&self, event: &WorkflowEvent) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO workflow_events (id, run_id, event_type, payload, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(event.id.to_string())
        .bind(event.run_id.to_string())
        .bind(event.event_type.as_str())
        .bind(to_json(&event.payload)?)
        .bind(format_datetime(&event.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;
        Ok(())
    }

    async fn list_events(&self, run_id: &Uuid) -> Result<Vec<WorkflowEvent>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, run_id, event_type, payload, created_at FROM workflow_events \
             WHERE run_id = ? ORDER BY seq ASC",
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        rows.iter().map(event_from_row).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stepwise_types::event::WorkflowEventType;
    use stepwise_types::workflow::{NodeRunStatus, WorkflowRunStatus};

    async fn test_repo() -> SqliteWorkflowRepository {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        std::mem::forget(dir);
        SqliteWorkflowRepository::new(DatabasePool::new(&url).await.unwrap())
    }

    fn sample_definition(version: u32) -> WorkflowDefinition {
        let mut def: WorkflowDefinition = serde_json::from_value(json!({
            "name": "daily-digest",
            "description": "Gather and summarize news",
            "nodes": [
                { "id": "start", "type": "start", "name": "Start" },
                { "id": "gather", "type": "agent_step", "name": "Gather",
                  "config": { "prompt": "Find top 5 AI news" } },
                { "id": "end", "type": "end", "name": "End" }
            ],
            "edges": [
                { "id": "e1", "from": "start", "to": "gather" },
                { "id": "e2", "from": "gather", "to": "end" }
            ]
        }))
        .unwrap();
        def.version = version;
        def
    }

    fn sample_run(def: &WorkflowDefinition) -> WorkflowRun {
        let now = Utc::now();
        WorkflowRun {
            id: Uuid::now_v7(),
            workflow_id: def.id,
            workflow_version: def.version,
            status: WorkflowRunStatus::Queued,
            current_node_id: None,
            input: json!({ "topic": "ai" }),
            output: json!({}),
            correlation_id: "corr-1".to_string(),
            error: None,
            lease_version: 0,
            lease_holder: None,
            lease_expires_at: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    fn sample_node_run(run_id: Uuid, node_id: &str, attempt: u32) -> NodeRun {
        NodeRun {
            id: Uuid::now_v7(),
            run_id,
            node_id: node_id.to_string(),
            attempt,
            status: NodeRunStatus::Running,
            input: json!({ "prompt": "Find top 5 AI news" }),
            output: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
        }
    }

    async fn repo_with_run() -> (SqliteWorkflowRepository, WorkflowRun) {
        let repo = test_repo().await;
        let def = sample_definition(1);
        repo.insert_definition(&def).await.unwrap();
        let run = sample_run(&def);
        repo.create_run(&run).await.unwrap();
        (repo, run)
    }

    // -- Definitions --

    #[tokio::test]
    async fn test_insert_and_get_definition_versions() {
        let repo = test_repo().await;
        let v1 = sample_definition(1);
        let mut v2 = v1.clone();
        v2.version = 2;
        v2.status = DefinitionStatus::Published;

        repo.insert_definition(&v1).await.unwrap();
        repo.insert_definition(&v2).await.unwrap();

        let loaded = repo.get_definition(&v1.id, 1).await.unwrap().unwrap();
        assert_eq!(loaded.name, "daily-digest");
        assert_eq!(loaded.nodes.len(), 3);
        assert_eq!(loaded.status, DefinitionStatus::Draft);
        assert_eq!(
            repo.get_definition(&v1.id, 2).await.unwrap().unwrap().status,
            DefinitionStatus::Published
        );
        assert!(repo.get_definition(&v1.id, 3).await.unwrap().is_none());
        assert_eq!(repo.latest_version(&v1.id).await.unwrap(), Some(2));
        assert_eq!(repo.latest_version(&Uuid::now_v7()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_duplicate_definition_version_conflicts() {
        let repo = test_repo().await;
        let def = sample_definition(1);
        repo.insert_definition(&def).await.unwrap();
        assert!(matches!(
            repo.insert_definition(&def).await,
            Err(RepositoryError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_update_definition_status() {
        let repo = test_repo().await;
        let def = sample_definition(1);
        repo.insert_definition(&def).await.unwrap();

        repo.update_definition_status(&def.id, 1, DefinitionStatus::Archived)
            .await
            .unwrap();
        let loaded = repo.get_definition(&def.id, 1).await.unwrap().unwrap();
        assert_eq!(loaded.status, DefinitionStatus::Archived);

        assert!(matches!(
            repo.update_definition_status(&def.id, 7, DefinitionStatus::Archived)
                .await,
            Err(RepositoryError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_alias_upsert_and_list() {
        let repo = test_repo().await;
        let id = Uuid::now_v7();
        let mut alias = WorkflowAlias {
            workflow_id: id,
            name: "daily-digest".to_string(),
            draft_version: Some(1),
            published_version: None,
            updated_at: Utc::now(),
        };
        repo.set_alias(&alias).await.unwrap();

        alias.published_version = Some(2);
        alias.updated_at = Utc::now();
        repo.set_alias(&alias).await.unwrap();

        let loaded = repo.get_alias(&id).await.unwrap().unwrap();
        assert_eq!(loaded.draft_version, Some(1));
        assert_eq!(loaded.published_version, Some(2));
        assert_eq!(repo.list_aliases().await.unwrap().len(), 1);
        assert!(repo.get_alias(&Uuid::now_v7()).await.unwrap().is_none());
    }

    // -- Runs --

    #[tokio::test]
    async fn test_create_and_get_run() {
        let (repo, run) = repo_with_run().await;
        let loaded = repo.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, WorkflowRunStatus::Queued);
        assert_eq!(loaded.input["topic"], "ai");
        assert_eq!(loaded.correlation_id, "corr-1");
        assert_eq!(loaded.lease_version, 0);
        assert!(loaded.started_at.is_none());
    }

    #[tokio::test]
    async fn test_run_requires_existing_definition_version() {
        let repo = test_repo().await;
        let def = sample_definition(1);
        // Not inserted: the foreign key rejects the run.
        assert!(repo.create_run(&sample_run(&def)).await.is_err());
    }

    #[tokio::test]
    async fn test_update_run_patch_semantics() {
        let (repo, run) = repo_with_run().await;

        repo.update_run(
            &run.id,
            &RunPatch {
                status: Some(WorkflowRunStatus::Running),
                current_node_id: Some(Some("gather".to_string())),
                error: Some(Some("transient".to_string())),
                started_at: Some(Utc::now()),
                ..RunPatch::default()
            },
        )
        .await
        .unwrap();
        let loaded = repo.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, WorkflowRunStatus::Running);
        assert_eq!(loaded.current_node_id.as_deref(), Some("gather"));
        assert_eq!(loaded.error.as_deref(), Some("transient"));
        assert!(loaded.started_at.is_some());

        // Untouched fields stay; Some(None) clears.
        repo.update_run(
            &run.id,
            &RunPatch {
                output: Some(json!({ "node_outputs": { "gather": { "text": "ok" } } })),
                current_node_id: Some(None),
                error: Some(None),
                ..RunPatch::default()
            },
        )
        .await
        .unwrap();
        let loaded = repo.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, WorkflowRunStatus::Running);
        assert_eq!(loaded.current_node_id, None);
        assert_eq!(loaded.error, None);
        assert_eq!(loaded.output["node_outputs"]["gather"]["text"], "ok");
        assert_eq!(loaded.input["topic"], "ai");

        assert!(matches!(
            repo.update_run(&Uuid::now_v7(), &RunPatch::status(WorkflowRunStatus::Failed))
                .await,
            Err(RepositoryError::NotFound)
        ));
    }

    fn claim(expected: u64, holder: &str) -> LeaseClaim {
        let now = Utc::now();
        LeaseClaim {
            expected,
            holder: holder.to_string(),
            now,
            expires_at: now + chrono::TimeDelta::seconds(30),
        }
    }

    #[tokio::test]
    async fn test_claim_run_compare_and_swap() {
        let (repo, run) = repo_with_run().await;

        assert_eq!(repo.claim_run(&run.id, &claim(0, "a")).await.unwrap(), 1);
        assert!(matches!(
            repo.claim_run(&run.id, &claim(0, "a")).await,
            Err(RepositoryError::Conflict(_))
        ));
        // The same holder may re-claim its own live lease.
        assert_eq!(repo.claim_run(&run.id, &claim(1, "a")).await.unwrap(), 2);
        assert!(matches!(
            repo.claim_run(&Uuid::now_v7(), &claim(0, "a")).await,
            Err(RepositoryError::NotFound)
        ));

        let loaded = repo.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(loaded.lease_version, 2);
        assert_eq!(loaded.lease_holder.as_deref(), Some("a"));
        assert!(loaded.lease_expires_at.is_some());
    }

    #[tokio::test]
    async fn test_claim_refused_while_another_holder_is_live() {
        let (repo, run) = repo_with_run().await;
        repo.claim_run(&run.id, &claim(0, "a")).await.unwrap();

        let err = repo.claim_run(&run.id, &claim(1, "b")).await.unwrap_err();
        assert!(matches!(&err, RepositoryError::Conflict(msg) if msg.contains("leased by a")));
        assert_eq!(repo.get_run(&run.id).await.unwrap().unwrap().lease_version, 1);

        // Once released, anyone may claim.
        repo.release_lease(&run.id, 1).await.unwrap();
        assert_eq!(repo.claim_run(&run.id, &claim(1, "b")).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let (repo, run) = repo_with_run().await;
        let mut stale = claim(0, "a");
        stale.expires_at = stale.now - chrono::TimeDelta::seconds(1);
        repo.claim_run(&run.id, &stale).await.unwrap();

        assert_eq!(repo.claim_run(&run.id, &claim(1, "b")).await.unwrap(), 2);
        let loaded = repo.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(loaded.lease_holder.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_renew_and_release_follow_the_lease() {
        let (repo, run) = repo_with_run().await;
        repo.claim_run(&run.id, &claim(0, "a")).await.unwrap();

        let later = Utc::now() + chrono::TimeDelta::minutes(5);
        repo.renew_lease(&run.id, 1, later).await.unwrap();
        let loaded = repo.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(
            loaded.lease_expires_at.map(|t| t.timestamp_micros()),
            Some(later.timestamp_micros())
        );

        assert!(matches!(
            repo.renew_lease(&run.id, 7, later).await,
            Err(RepositoryError::LeaseLost { lease_version: 7, .. })
        ));
        // Releasing a stale version leaves the current holder alone.
        repo.release_lease(&run.id, 7).await.unwrap();
        assert_eq!(
            repo.get_run(&run.id).await.unwrap().unwrap().lease_holder.as_deref(),
            Some("a")
        );
        repo.release_lease(&run.id, 1).await.unwrap();
        let loaded = repo.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(loaded.lease_holder, None);
        assert_eq!(loaded.lease_expires_at, None);
    }

    #[tokio::test]
    async fn test_writes_under_a_moved_lease_are_refused() {
        let (repo, run) = repo_with_run().await;
        repo.claim_run(&run.id, &claim(0, "a")).await.unwrap();
        let node_run = sample_node_run(run.id, "gather", 1);
        repo.create_node_run(&node_run, 1).await.unwrap();

        // Another driver takes over after `a` expired.
        let mut takeover = claim(1, "b");
        takeover.now = Utc::now() + chrono::TimeDelta::minutes(1);
        repo.claim_run(&run.id, &takeover).await.unwrap();

        assert!(matches!(
            repo.update_claimed_run(&run.id, 1, &RunPatch::status(WorkflowRunStatus::Completed))
                .await,
            Err(RepositoryError::LeaseLost { lease_version: 1, .. })
        ));
        assert!(matches!(
            repo.create_node_run(&sample_node_run(run.id, "gather", 2), 1).await,
            Err(RepositoryError::LeaseLost { .. })
        ));
        let completion = NodeRunCompletion {
            status: NodeRunStatus::Succeeded,
            output: None,
            error: None,
            completed_at: Utc::now(),
            duration_ms: 1,
        };
        assert!(matches!(
            repo.complete_node_run(&node_run.id, 1, &completion).await,
            Err(RepositoryError::LeaseLost { .. })
        ));

        let loaded = repo.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, WorkflowRunStatus::Queued);
        let rows = repo.list_node_runs(&run.id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, NodeRunStatus::Running);

        // The new holder's writes go through.
        repo.complete_node_run(&node_run.id, 2, &completion).await.unwrap();
        repo.update_claimed_run(&run.id, 2, &RunPatch::status(WorkflowRunStatus::Completed))
            .await
            .unwrap();
        assert!(matches!(
            repo.update_claimed_run(&Uuid::now_v7(), 2, &RunPatch::default()).await,
            Err(RepositoryError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_list_runs() {
        let (repo, run) = repo_with_run().await;
        let def = repo.get_definition(&run.workflow_id, 1).await.unwrap().unwrap();
        for _ in 0..2 {
            repo.create_run(&sample_run(&def)).await.unwrap();
        }

        assert_eq!(repo.list_runs(Some(&def.id), 10).await.unwrap().len(), 3);
        assert_eq!(repo.list_runs(None, 2).await.unwrap().len(), 2);
        assert!(repo.list_runs(Some(&Uuid::now_v7()), 10).await.unwrap().is_empty());
    }

    // -- Node runs --

    #[tokio::test]
    async fn test_node_run_lifecycle() {
        let (repo, run) = repo_with_run().await;
        let node_run = sample_node_run(run.id, "gather", 1);
        repo.create_node_run(&node_run, 0).await.unwrap();

        let completion = NodeRunCompletion {
            status: NodeRunStatus::Succeeded,
            output: Some(json!({ "text": "5 stories" })),
            error: None,
            completed_at: Utc::now(),
            duration_ms: 42,
        };
        repo.complete_node_run(&node_run.id, 0, &completion).await.unwrap();

        let rows = repo.list_node_runs(&run.id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, NodeRunStatus::Succeeded);
        assert_eq!(rows[0].output.as_ref().unwrap()["text"], "5 stories");
        assert_eq!(rows[0].duration_ms, Some(42));

        // The terminal transition happens once.
        assert!(matches!(
            repo.complete_node_run(&node_run.id, 0, &completion).await,
            Err(RepositoryError::Conflict(_))
        ));
        assert!(matches!(
            repo.complete_node_run(&Uuid::now_v7(), 0, &completion).await,
            Err(RepositoryError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_node_run_attempt_key_is_unique() {
        let (repo, run) = repo_with_run().await;
        repo.create_node_run(&sample_node_run(run.id, "gather", 1), 0)
            .await
            .unwrap();
        assert!(matches!(
            repo.create_node_run(&sample_node_run(run.id, "gather", 1), 0).await,
            Err(RepositoryError::Conflict(_))
        ));
        repo.create_node_run(&sample_node_run(run.id, "gather", 2), 0)
            .await
            .unwrap();

        let attempts: Vec<u32> = repo
            .list_node_runs(&run.id)
            .await
            .unwrap()
            .iter()
            .map(|n| n.attempt)
            .collect();
        assert_eq!(attempts, vec![1, 2]);
    }

    // -- Events --

    #[tokio::test]
    async fn test_events_keep_append_order() {
        let (repo, run) = repo_with_run().await;
        let types = [
            WorkflowEventType::RunStarted,
            WorkflowEventType::NodeStarted,
            WorkflowEventType::NodeFailed,
            WorkflowEventType::RunFailed,
        ];
        for event_type in types {
            repo.append_event(&WorkflowEvent::new(run.id, event_type, json!({ "n": 1 })))
                .await
                .unwrap();
        }

        let events = repo.list_events(&run.id).await.unwrap();
        let loaded: Vec<_> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(loaded, types.to_vec());
        assert_eq!(events[0].payload["n"], 1);
        assert!(repo.list_events(&Uuid::now_v7()).await.unwrap().is_empty());
    }
}
