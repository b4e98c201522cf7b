//! Workflow repository trait definitions.
//!
//! Defines the storage interface for versioned definitions, runs, node-run
//! attempts, and the per-run event log. The infrastructure layer
//! (stepwise-infra) implements these traits with SQLite persistence.
//!
//! Writes made by a driver are fenced: they carry the lease version the driver
//! claimed and fail with `RepositoryError::LeaseLost` once the lease has moved.

use stepwise_types::error::RepositoryError;
use stepwise_types::event::WorkflowEvent;
use chrono::{DateTime, Utc};
use stepwise_types::workflow::{
    DefinitionStatus, LeaseClaim, NodeRun, NodeRunCompletion, RunPatch, WorkflowAlias,
    WorkflowDefinition, WorkflowRun,
};
use uuid::Uuid;

/// Storage for immutable definition versions and their alias pointers.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowDefinitionRepository: Send + Sync {
    /// Insert a new `(id, version)` row. Fails with `Conflict` if it already exists.
    fn insert_definition(
        &self,
        def: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Fetch one stored version.
    fn get_definition(
        &self,
        id: &Uuid,
        version: u32,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// Highest stored version number for a workflow id, if any.
    fn latest_version(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<u32>, RepositoryError>> + Send;

    /// Change the lifecycle status of a stored version.
    fn update_definition_status(
        &self,
        id: &Uuid,
        version: u32,
        status: DefinitionStatus,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get the draft/published pointer record for a workflow id.
    fn get_alias(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowAlias>, RepositoryError>> + Send;

    /// Upsert the pointer record.
    fn set_alias(
        &self,
        alias: &WorkflowAlias,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// All alias records, most recently updated first.
    fn list_aliases(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowAlias>, RepositoryError>> + Send;
}

/// Storage for runs and their append-only node-run history.
pub trait WorkflowRunRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Create a new run record.
    fn create_run(
        &self,
        run: &WorkflowRun,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a run by its UUID.
    fn get_run(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowRun>, RepositoryError>> + Send;

    /// Apply a partial update and bump `updated_at`. Fails with `NotFound` for unknown runs.
    ///
    /// Unfenced; used by out-of-band commands (approve, cancel).
    fn update_run(
        &self,
        run_id: &Uuid,
        patch: &RunPatch,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Like `update_run`, but only while the run's lease is still `lease_version`.
    fn update_claimed_run(
        &self,
        run_id: &Uuid,
        lease_version: u64,
        patch: &RunPatch,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Take the lease: bump `lease_version` and record the holder, but only if
    /// the version still equals `claim.expected` and no other holder's lease is
    /// live at `claim.now`. Returns the new lease version, or `Conflict`.
    fn claim_run(
        &self,
        run_id: &Uuid,
        claim: &LeaseClaim,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    /// Push the expiry of a held lease forward. `LeaseLost` if it moved.
    fn renew_lease(
        &self,
        run_id: &Uuid,
        lease_version: u64,
        expires_at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Clear the holder of a lease. A no-op if the lease already moved.
    fn release_lease(
        &self,
        run_id: &Uuid,
        lease_version: u64,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// List runs, optionally for one workflow, newest first.
    fn list_runs(
        &self,
        workflow_id: Option<&Uuid>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowRun>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Node runs
    // -----------------------------------------------------------------------

    /// Append a node-run row while the run's lease is `lease_version`.
    /// `(run_id, node_id, attempt)` must be unique.
    fn create_node_run(
        &self,
        node_run: &NodeRun,
        lease_version: u64,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Apply the single terminal transition of a node-run while the owning
    /// run's lease is `lease_version`.
    ///
    /// Fails with `Conflict` if the row is already terminal.
    fn complete_node_run(
        &self,
        node_run_id: &Uuid,
        lease_version: u64,
        completion: &NodeRunCompletion,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// All node-runs for a run, ordered by `started_at` then `attempt`.
    fn list_node_runs(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<NodeRun>, RepositoryError>> + Send;
}

/// Append-only per-run event log.
pub trait WorkflowEventRepository: Send + Sync {
    fn append_event(
        &self,
        event: &WorkflowEvent,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Events for a run in creation order.
    fn list_events(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowEvent>, RepositoryError>> + Send;
}

/// Convenience bound for a backend that provides all three stores.
pub trait WorkflowStore:
    WorkflowDefinitionRepository + WorkflowRunRepository + WorkflowEventRepository
{
}

impl<T> WorkflowStore for T where
    T: WorkflowDefinitionRepository + WorkflowRunRepository + WorkflowEventRepository
{
}
