//! Definition versioning: immutable versions plus draft/published alias pointers.
//!
//! Every save creates a new `(id, version)` row; nothing is edited in place.
//! The alias record per workflow id tracks which version is the current draft
//! and which is the current published one, so runs can pin either.

use std::sync::Arc;

use chrono::Utc;
use stepwise_types::workflow::{DefinitionStatus, WorkflowAlias, WorkflowDefinition};
use uuid::Uuid;

use crate::repository::workflow::WorkflowDefinitionRepository;

use super::definition::{compile_definition, CompiledWorkflow, ResolvedDefinition, WorkflowError};

/// Which alias pointer to follow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum VersionTarget {
    #[default]
    Published,
    Draft,
}

/// Stores, publishes, archives, and resolves definition versions.
///
/// Definitions are compiled against `default_retry_profile`, the same baseline
/// the engine resolves node policies with.
pub struct DefinitionService<R> {
    repo: Arc<R>,
    default_retry_profile: String,
}

impl<R> Clone for DefinitionService<R> {
    fn clone(&self) -> Self {
        Self {
            repo: Arc::clone(&self.repo),
            default_retry_profile: self.default_retry_profile.clone(),
        }
    }
}

impl<R: WorkflowDefinitionRepository> DefinitionService<R> {
    pub fn new(repo: Arc<R>, default_retry_profile: impl Into<String>) -> Self {
        Self {
            repo,
            default_retry_profile: default_retry_profile.into(),
        }
    }

    /// Validate and compile a definition without storing it.
    pub fn compile(&self, def: &WorkflowDefinition) -> Result<CompiledWorkflow, WorkflowError> {
        compile_definition(def, &self.default_retry_profile)
    }

    async fn next_version(&self, id: &Uuid) -> Result<u32, WorkflowError> {
        Ok(self.repo.latest_version(id).await?.unwrap_or(0) + 1)
    }

    /// Validate and store `def` as a new draft version; move the draft pointer.
    pub async fn save_draft(
        &self,
        mut def: WorkflowDefinition,
    ) -> Result<WorkflowDefinition, WorkflowError> {
        self.compile(&def)?;

        def.version = self.next_version(&def.id).await?;
        def.status = DefinitionStatus::Draft;
        self.repo.insert_definition(&def).await?;

        let alias = match self.repo.get_alias(&def.id).await? {
            Some(existing) => WorkflowAlias {
                name: def.name.clone(),
                draft_version: Some(def.version),
                updated_at: Utc::now(),
                ..existing
            },
            None => WorkflowAlias {
                workflow_id: def.id,
                name: def.name.clone(),
                draft_version: Some(def.version),
                published_version: None,
                updated_at: Utc::now(),
            },
        };
        self.repo.set_alias(&alias).await?;

        tracing::info!(
            workflow_id = %def.id,
            version = def.version,
            name = def.name.as_str(),
            "saved workflow draft"
        );
        Ok(def)
    }

    /// Copy the current draft into a new published version; move the published pointer.
    pub async fn publish(&self, id: &Uuid) -> Result<WorkflowDefinition, WorkflowError> {
        let alias = self
            .repo
            .get_alias(id)
            .await?
            .ok_or(WorkflowError::NotFound {
                id: *id,
                version: None,
            })?;
        let draft_version = alias.draft_version.ok_or(WorkflowError::NoDraft(*id))?;

        let mut def = self.get(id, draft_version).await?;
        self.compile(&def)?;
        def.version = self.next_version(id).await?;
        def.status = DefinitionStatus::Published;
        self.repo.insert_definition(&def).await?;

        let alias = WorkflowAlias {
            name: def.name.clone(),
            published_version: Some(def.version),
            updated_at: Utc::now(),
            ..alias
        };
        self.repo.set_alias(&alias).await?;

        tracing::info!(
            workflow_id = %id,
            version = def.version,
            from_draft = draft_version,
            "published workflow"
        );
        Ok(def)
    }

    /// Mark a version archived. The current draft and published versions cannot be archived.
    pub async fn archive(&self, id: &Uuid, version: u32) -> Result<(), WorkflowError> {
        let alias = self.repo.get_alias(id).await?;
        let is_current = alias.is_some_and(|a| {
            a.draft_version == Some(version) || a.published_version == Some(version)
        });
        if is_current {
            return Err(WorkflowError::ValidationError(format!(
                "version {version} is a current draft or published version and cannot be archived"
            )));
        }
        // Existence check so a typo surfaces as NotFound.
        self.get(id, version).await?;
        self.repo
            .update_definition_status(id, version, DefinitionStatus::Archived)
            .await?;
        tracing::info!(workflow_id = %id, version, "archived workflow version");
        Ok(())
    }

    /// Fetch one stored version.
    pub async fn get(&self, id: &Uuid, version: u32) -> Result<WorkflowDefinition, WorkflowError> {
        self.repo
            .get_definition(id, version)
            .await?
            .ok_or(WorkflowError::NotFound {
                id: *id,
                version: Some(version),
            })
    }

    /// The version number an alias pointer currently designates.
    pub async fn current_version(
        &self,
        id: &Uuid,
        target: VersionTarget,
    ) -> Result<u32, WorkflowError> {
        let alias = self
            .repo
            .get_alias(id)
            .await?
            .ok_or(WorkflowError::NotFound {
                id: *id,
                version: None,
            })?;
        match target {
            VersionTarget::Published => alias.published_version.ok_or(WorkflowError::NotPublished(*id)),
            VersionTarget::Draft => alias.draft_version.ok_or(WorkflowError::NoDraft(*id)),
        }
    }

    /// Fetch the version an alias pointer designates.
    pub async fn current(
        &self,
        id: &Uuid,
        target: VersionTarget,
    ) -> Result<WorkflowDefinition, WorkflowError> {
        let version = self.current_version(id, target).await?;
        self.get(id, version).await
    }

    /// Fetch and compile a pinned version.
    pub async fn resolve(&self, id: &Uuid, version: u32) -> Result<ResolvedDefinition, WorkflowError> {
        let definition = self.get(id, version).await?;
        let compiled = self.compile(&definition)?;
        Ok(ResolvedDefinition {
            definition,
            compiled,
        })
    }

    /// All workflows, most recently updated first.
    pub async fn list(&self) -> Result<Vec<WorkflowAlias>, WorkflowError> {
        Ok(self.repo.list_aliases().await?)
    }
}
