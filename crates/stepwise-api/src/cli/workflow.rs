//! CLI workflow definition subcommands.
//!
//! Provides create, publish, archive, list, and show operations over the
//! versioned definition store.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Subcommand;
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;

use stepwise_core::workflow::definition::load_definition_file;
use stepwise_core::workflow::versioning::VersionTarget;
use stepwise_types::workflow::{WorkflowAlias, WorkflowDefinition};

use super::{parse_id, short_id, truncate};
use crate::state::AppState;

/// Workflow definition subcommands.
#[derive(Subcommand)]
pub enum WorkflowCommand {
    /// Register a definition file (YAML or JSON) as a new draft version.
    Create {
        /// Path to the definition file.
        file: PathBuf,

        /// Publish the draft right away.
        #[arg(long)]
        publish: bool,
    },

    /// Publish the current draft as a new version.
    Publish {
        /// Workflow UUID.
        workflow_id: String,
    },

    /// Archive a version that is neither the current draft nor published.
    #[command(disable_version_flag = true)]
    Archive {
        /// Workflow UUID.
        workflow_id: String,

        /// Version number to archive.
        version: u32,
    },

    /// List registered workflows.
    #[command(alias = "ls")]
    List,

    /// Show a workflow definition (published version unless told otherwise).
    #[command(disable_version_flag = true)]
    Show {
        /// Workflow UUID.
        workflow_id: String,

        /// Show this exact version.
        #[arg(long, conflicts_with = "draft")]
        version: Option<u32>,

        /// Show the current draft.
        #[arg(long)]
        draft: bool,
    },
}

/// Handle a workflow subcommand.
pub async fn handle_workflow_command(
    cmd: WorkflowCommand,
    state: &AppState,
    json: bool,
) -> Result<()> {
    match cmd {
        WorkflowCommand::Create { file, publish } => handle_create(&file, publish, state, json).await,
        WorkflowCommand::Publish { workflow_id } => handle_publish(&workflow_id, state, json).await,
        WorkflowCommand::Archive {
            workflow_id,
            version,
        } => handle_archive(&workflow_id, version, state, json).await,
        WorkflowCommand::List => handle_list(state, json).await,
        WorkflowCommand::Show {
            workflow_id,
            version,
            draft,
        } => handle_show(&workflow_id, version, draft, state, json).await,
    }
}

// ---------------------------------------------------------------------------
// Create / publish / archive
// ---------------------------------------------------------------------------

async fn handle_create(file: &Path, publish: bool, state: &AppState, json: bool) -> Result<()> {
    let def = load_definition_file(file)
        .with_context(|| format!("Failed to load workflow file '{}'", file.display()))?;
    let definitions = state.engine.definitions();
    let compiled = definitions
        .compile(&def)
        .with_context(|| format!("Workflow '{}' is invalid", def.name))?;
    let draft = definitions
        .save_draft(def)
        .await
        .context("Failed to save workflow draft")?;
    let published = if publish {
        Some(
            definitions
                .publish(&draft.id)
                .await
                .context("Failed to publish workflow")?,
        )
    } else {
        None
    };

    if json {
        let out = serde_json::json!({
            "workflow_id": draft.id.to_string(),
            "name": draft.name,
            "draft_version": draft.version,
            "published_version": published.as_ref().map(|p| p.version),
            "nodes": draft.nodes.len(),
            "edges": draft.edges.len(),
            "warnings": compiled.warnings,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Registered workflow '{}' (draft v{})",
        style("*").green().bold(),
        style(&draft.name).cyan(),
        draft.version
    );
    println!("  ID: {}", draft.id);
    println!("  Nodes: {}  Edges: {}", draft.nodes.len(), draft.edges.len());
    if let Some(published) = &published {
        println!("  Published: v{}", published.version);
    }
    for warning in &compiled.warnings {
        println!("  {} {warning}", style("!").yellow().bold());
    }
    if published.is_none() {
        println!();
        println!(
            "  Publish with: {}",
            style(format!("stepwise workflow publish {}", draft.id)).dim()
        );
    }
    println!();

    Ok(())
}

async fn handle_publish(workflow_id: &str, state: &AppState, json: bool) -> Result<()> {
    let id = parse_id(workflow_id, "workflow")?;
    let def = state
        .engine
        .definitions()
        .publish(&id)
        .await
        .context("Failed to publish workflow")?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "workflow_id": def.id.to_string(),
                "published_version": def.version,
            })
        );
    } else {
        println!();
        println!(
            "  {} Published '{}' as v{}",
            style("*").green().bold(),
            style(&def.name).cyan(),
            def.version
        );
        println!();
    }

    Ok(())
}

async fn handle_archive(workflow_id: &str, version: u32, state: &AppState, json: bool) -> Result<()> {
    let id = parse_id(workflow_id, "workflow")?;
    state
        .engine
        .definitions()
        .archive(&id, version)
        .await
        .context("Failed to archive workflow version")?;

    if json {
        println!(
            "{}",
            serde_json::json!({"workflow_id": id.to_string(), "archived_version": version})
        );
    } else {
        println!();
        println!(
            "  {} Archived v{version} of {}",
            style("*").green().bold(),
            style(short_id(&id)).cyan()
        );
        println!();
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

async fn handle_list(state: &AppState, json: bool) -> Result<()> {
    let aliases = state
        .engine
        .definitions()
        .list()
        .await
        .context("Failed to list workflows")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&aliases)?);
        return Ok(());
    }

    if aliases.is_empty() {
        println!();
        println!("  No workflows registered.");
        println!(
            "  Create one with: {}",
            style("stepwise workflow create <file.yaml>").dim()
        );
        println!();
        return Ok(());
    }

    println!();
    println!("{}", alias_table(&aliases));
    println!();

    Ok(())
}

fn alias_table(aliases: &[WorkflowAlias]) -> Table {
    let version_cell = |v: Option<u32>| match v {
        Some(v) => Cell::new(format!("v{v}")),
        None => Cell::new("-").fg(Color::DarkGrey),
    };

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("ID").fg(Color::Cyan),
            Cell::new("Name"),
            Cell::new("Draft"),
            Cell::new("Published"),
            Cell::new("Updated"),
        ]);

    for a in aliases {
        table.add_row(vec![
            Cell::new(a.workflow_id),
            Cell::new(&a.name),
            version_cell(a.draft_version),
            version_cell(a.published_version),
            Cell::new(a.updated_at.format("%Y-%m-%d %H:%M").to_string()),
        ]);
    }
    table
}

// ---------------------------------------------------------------------------
// Show
// ---------------------------------------------------------------------------

async fn handle_show(
    workflow_id: &str,
    version: Option<u32>,
    draft: bool,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let id = parse_id(workflow_id, "workflow")?;
    let definitions = state.engine.definitions();
    let def = match version {
        Some(v) => definitions.get(&id, v).await,
        None if draft => definitions.current(&id, VersionTarget::Draft).await,
        None => definitions.current(&id, VersionTarget::Published).await,
    }
    .context("Failed to load workflow")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&def)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {} v{} ({})",
        style("Workflow:").bold(),
        style(&def.name).cyan(),
        def.version,
        def.status
    );
    println!("  ID: {}", def.id);
    if let Some(description) = &def.description {
        println!("  {}", style(description).dim());
    }
    if let Some(ms) = def.defaults.max_run_time_ms {
        println!("  Max run time: {ms} ms");
    }
    println!();
    println!("{}", node_table(&def));
    println!();
    if !def.edges.is_empty() {
        println!("{}", edge_table(&def));
        println!();
    }

    Ok(())
}

fn node_table(def: &WorkflowDefinition) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Node").fg(Color::Cyan),
            Cell::new("Type"),
            Cell::new("Name"),
            Cell::new("Retry"),
            Cell::new("Critical"),
        ]);

    for node in &def.nodes {
        let retry = node
            .retry
            .as_ref()
            .and_then(|r| r.profile.clone())
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            Cell::new(&node.id),
            Cell::new(node.node_type.as_str()),
            Cell::new(&node.name),
            Cell::new(retry),
            Cell::new(if node.is_critical() { "yes" } else { "no" }),
        ]);
    }
    table
}

fn edge_table(def: &WorkflowDefinition) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Edge").fg(Color::Cyan),
            Cell::new("From"),
            Cell::new("To"),
            Cell::new("Condition"),
        ]);

    for edge in &def.edges {
        let condition: String = edge.condition.clone().into();
        table.add_row(vec![
            Cell::new(&edge.id),
            Cell::new(&edge.from),
            Cell::new(&edge.to),
            Cell::new(truncate(&condition, 48)),
        ]);
    }
    table
}
