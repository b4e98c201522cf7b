//! CLI run subcommands.
//!
//! Start, resume, approve, and cancel runs, and inspect their node-run
//! history and event log. `start` and `resume` drive the run in this process
//! and print live progress from the event bus.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;
use serde_json::Value;

use stepwise_core::repository::workflow::{WorkflowEventRepository, WorkflowRunRepository};
use stepwise_core::workflow::engine::{CreateRunRequest, ExecutionResult};
use stepwise_core::workflow::versioning::VersionTarget;
use stepwise_types::event::{WorkflowEvent, WorkflowEventType};
use stepwise_types::workflow::{NodeRun, WorkflowRun, WorkflowRunStatus};
use uuid::Uuid;

use super::{node_status_cell, parse_id, run_status_cell, short_id, truncate};
use crate::state::AppState;

/// How long to wait for the progress printer to drain after a session ends.
const PROGRESS_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Run subcommands.
#[derive(Subcommand)]
pub enum RunCommand {
    /// Create a run of a workflow and drive it.
    Start {
        /// Workflow UUID.
        workflow_id: String,

        /// Pin the current draft instead of the published version.
        #[arg(long)]
        draft: bool,

        /// Run input as a JSON object.
        #[arg(long)]
        input: Option<String>,

        /// Correlation ID (generated when omitted).
        #[arg(long)]
        correlation_id: Option<String>,

        /// Only create the run; drive it later with `run resume`.
        #[arg(long)]
        no_execute: bool,
    },

    /// Drive an existing run from its last checkpoint.
    Resume {
        /// Run UUID.
        run_id: String,
    },

    /// Approve an approval gate so the next session passes it.
    Approve {
        /// Run UUID.
        run_id: String,

        /// Approval node ID.
        node_id: String,

        /// Resume the run right after approving.
        #[arg(long)]
        resume: bool,
    },

    /// Cancel a run that has not finished.
    Cancel {
        /// Run UUID.
        run_id: String,
    },

    /// List recent runs.
    #[command(alias = "ls")]
    List {
        /// Only runs of this workflow UUID.
        #[arg(long)]
        workflow: Option<String>,

        /// Maximum number of runs to display.
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Show the state of a run.
    Status {
        /// Run UUID.
        run_id: String,
    },

    /// Show node-run attempts of a run.
    Logs {
        /// Run UUID.
        run_id: String,
    },

    /// Show the event log of a run.
    Events {
        /// Run UUID.
        run_id: String,
    },
}

/// Handle a run subcommand.
pub async fn handle_run_command(cmd: RunCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        RunCommand::Start {
            workflow_id,
            draft,
            input,
            correlation_id,
            no_execute,
        } => {
            let request = CreateRunRequest {
                workflow_id: parse_id(&workflow_id, "workflow")?,
                input: parse_input(input.as_deref())?,
                target: if draft {
                    VersionTarget::Draft
                } else {
                    VersionTarget::Published
                },
                correlation_id,
            };
            handle_start(request, no_execute, state, json).await
        }
        RunCommand::Resume { run_id } => {
            let run_id = parse_id(&run_id, "run")?;
            let result = drive(run_id, state, json).await?;
            print_result(&result, json)
        }
        RunCommand::Approve {
            run_id,
            node_id,
            resume,
        } => handle_approve(&run_id, &node_id, resume, state, json).await,
        RunCommand::Cancel { run_id } => handle_cancel(&run_id, state, json).await,
        RunCommand::List { workflow, limit } => {
            let workflow_id = workflow
                .as_deref()
                .map(|w| parse_id(w, "workflow"))
                .transpose()?;
            handle_list(workflow_id, limit, state, json).await
        }
        RunCommand::Status { run_id } => handle_status(&run_id, state, json).await,
        RunCommand::Logs { run_id } => handle_logs(&run_id, state, json).await,
        RunCommand::Events { run_id } => handle_events(&run_id, state, json).await,
    }
}

/// Parse `--input`: absent means `{}`; otherwise it must be a JSON object.
fn parse_input(raw: Option<&str>) -> Result<Value> {
    let Some(raw) = raw else {
        return Ok(Value::Object(Default::default()));
    };
    let value: Value = serde_json::from_str(raw).context("--input is not valid JSON")?;
    if !value.is_object() {
        bail!("--input must be a JSON object, got: {raw}");
    }
    Ok(value)
}

// ---------------------------------------------------------------------------
// Start / resume
// ---------------------------------------------------------------------------

async fn handle_start(
    request: CreateRunRequest,
    no_execute: bool,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let run = state
        .engine
        .create_run(request)
        .await
        .context("Failed to create run")?;

    if no_execute {
        if json {
            println!("{}", serde_json::to_string_pretty(&run_json(&run))?);
        } else {
            println!();
            println!(
                "  {} Created run {} (v{}, queued)",
                style("*").green().bold(),
                style(run.id).cyan(),
                run.workflow_version
            );
            println!(
                "  Start it with: {}",
                style(format!("stepwise run resume {}", run.id)).dim()
            );
            println!();
        }
        return Ok(());
    }

    if !json {
        println!();
        println!(
            "  {} Run {} (workflow v{})",
            style("Starting").bold(),
            style(run.id).cyan(),
            run.workflow_version
        );
    }
    let result = drive(run.id, state, json).await?;
    print_result(&result, json)
}

/// Execute one session, echoing bus events as progress lines unless `json`.
async fn drive(run_id: Uuid, state: &AppState, json: bool) -> Result<ExecutionResult> {
    let printer = (!json).then(|| {
        let mut subscription = state.engine.event_bus().subscribe_run(run_id);
        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                println!("  {}", describe_event(&event));
                if event.event_type.is_terminal() {
                    break;
                }
            }
        })
    });

    let outcome = state.engine.execute(run_id).await;

    if let Some(printer) = printer {
        let ended_with_event = matches!(
            &outcome,
            Ok(result) if result.paused.is_some() || !result.executed_nodes.is_empty()
        );
        if ended_with_event {
            // The terminal event is already on the bus; let the printer catch up.
            let _ = tokio::time::timeout(PROGRESS_DRAIN_TIMEOUT, printer).await;
        } else {
            printer.abort();
        }
    }

    outcome.with_context(|| format!("Failed to execute run {run_id}"))
}

fn print_result(result: &ExecutionResult, json: bool) -> Result<()> {
    if json {
        let out = serde_json::json!({
            "run_id": result.run_id.to_string(),
            "status": result.status.as_str(),
            "paused": result.paused.as_ref().map(|p| serde_json::json!({
                "node_id": p.node_id,
                "reason": p.reason,
            })),
            "error": result.error,
            "executed_nodes": result.executed_nodes,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    if let Some(paused) = &result.paused {
        println!(
            "  {} Paused at '{}' ({})",
            style("||").magenta().bold(),
            style(&paused.node_id).cyan(),
            paused.reason
        );
        println!(
            "  Approve with: {}",
            style(format!(
                "stepwise run approve {} {} --resume",
                result.run_id, paused.node_id
            ))
            .dim()
        );
    } else {
        let marker = match result.status {
            WorkflowRunStatus::Completed => style("*").green().bold(),
            WorkflowRunStatus::Failed => style("x").red().bold(),
            _ => style("-").yellow().bold(),
        };
        println!(
            "  {marker} Run {} is {}",
            style(short_id(&result.run_id)).cyan(),
            result.status
        );
        if let Some(error) = &result.error {
            println!("  Error: {}", style(error).red());
        }
    }
    println!();

    Ok(())
}

/// One progress line for a bus event.
fn describe_event(event: &WorkflowEvent) -> String {
    let field = |key: &str| event.payload.get(key).and_then(Value::as_str);
    let node = field("node_id").unwrap_or("?");
    let attempt = event
        .payload
        .get("attempt")
        .and_then(Value::as_u64)
        .map(|a| format!(" (attempt {a})"))
        .unwrap_or_default();

    match event.event_type {
        WorkflowEventType::RunStarted => format!("{} run started", style(">").cyan()),
        WorkflowEventType::RunResumed => format!(
            "{} run resumed ({})",
            style(">").cyan(),
            field("reason").unwrap_or("resume")
        ),
        WorkflowEventType::NodeStarted => format!("{} {node}{attempt}", style("-").dim()),
        WorkflowEventType::NodeSucceeded => format!("{} {node}", style("*").green()),
        WorkflowEventType::NodeFailed => {
            let will_retry = event
                .payload
                .get("will_retry")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            format!(
                "{} {node}{attempt}: {}{}",
                style("x").red(),
                truncate(field("error").unwrap_or("failed"), 80),
                if will_retry { ", retrying" } else { "" }
            )
        }
        WorkflowEventType::NodePaused => format!("{} {node} waiting", style("||").magenta()),
        WorkflowEventType::CompensationFailed => format!(
            "{} compensation for {node} failed: {}",
            style("!").yellow(),
            truncate(field("error").unwrap_or("unknown error"), 80)
        ),
        WorkflowEventType::RunPaused => format!("{} run paused", style("||").magenta()),
        WorkflowEventType::RunCompleted => format!("{} run completed", style("*").green().bold()),
        WorkflowEventType::RunFailed => format!("{} run failed", style("x").red().bold()),
        WorkflowEventType::RunCancelled => format!("{} run cancelled", style("-").yellow().bold()),
    }
}

// ---------------------------------------------------------------------------
// Approve / cancel
// ---------------------------------------------------------------------------

async fn handle_approve(
    run_id: &str,
    node_id: &str,
    resume: bool,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let run_id = parse_id(run_id, "run")?;
    state
        .engine
        .approve(run_id, node_id)
        .await
        .with_context(|| format!("Failed to approve '{node_id}'"))?;

    if !json {
        println!();
        println!(
            "  {} Approved '{}' on run {}",
            style("*").green().bold(),
            style(node_id).cyan(),
            style(short_id(&run_id)).cyan()
        );
    }

    if resume {
        let result = drive(run_id, state, json).await?;
        return print_result(&result, json);
    }

    if json {
        println!(
            "{}",
            serde_json::json!({"run_id": run_id.to_string(), "approved": node_id})
        );
    } else {
        println!();
    }
    Ok(())
}

async fn handle_cancel(run_id: &str, state: &AppState, json: bool) -> Result<()> {
    let run_id = parse_id(run_id, "run")?;
    state
        .engine
        .cancel(run_id)
        .await
        .context("Failed to cancel run")?;

    if json {
        println!(
            "{}",
            serde_json::json!({"run_id": run_id.to_string(), "status": "cancelled"})
        );
    } else {
        println!();
        println!(
            "  {} Cancelled run {}",
            style("*").green().bold(),
            style(short_id(&run_id)).cyan()
        );
        println!();
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Inspection
// ---------------------------------------------------------------------------

async fn load_run(run_id: &Uuid, state: &AppState) -> Result<WorkflowRun> {
    state
        .engine
        .repo()
        .get_run(run_id)
        .await
        .context("Failed to load run")?
        .with_context(|| format!("Run {run_id} not found"))
}

fn run_json(run: &WorkflowRun) -> Value {
    serde_json::json!({
        "run_id": run.id.to_string(),
        "workflow_id": run.workflow_id.to_string(),
        "workflow_version": run.workflow_version,
        "status": run.status.as_str(),
        "current_node_id": run.current_node_id,
        "correlation_id": run.correlation_id,
        "created_at": run.created_at.to_rfc3339(),
        "started_at": run.started_at.map(|t| t.to_rfc3339()),
        "completed_at": run.completed_at.map(|t| t.to_rfc3339()),
        "error": run.error,
    })
}

async fn handle_list(
    workflow_id: Option<Uuid>,
    limit: u32,
    state: &AppState,
    json: bool,
) -> Result<()> {
    let runs = state
        .engine
        .repo()
        .list_runs(workflow_id.as_ref(), limit)
        .await
        .context("Failed to list runs")?;

    if json {
        let out: Vec<_> = runs.iter().map(run_json).collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!();
        println!("  No runs yet.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Run").fg(Color::Cyan),
            Cell::new("Workflow"),
            Cell::new("Status"),
            Cell::new("Node"),
            Cell::new("Created"),
        ]);

    for r in &runs {
        table.add_row(vec![
            Cell::new(r.id),
            Cell::new(format!("{} v{}", short_id(&r.workflow_id), r.workflow_version)),
            run_status_cell(r.status),
            Cell::new(r.current_node_id.as_deref().unwrap_or("-")),
            Cell::new(r.created_at.format("%Y-%m-%d %H:%M").to_string()),
        ]);
    }

    println!();
    println!("{table}");
    println!();

    Ok(())
}

async fn handle_status(run_id: &str, state: &AppState, json: bool) -> Result<()> {
    let run_id = parse_id(run_id, "run")?;
    let run = load_run(&run_id, state).await?;
    let checkpoint = run.checkpoint();

    if json {
        let mut out = run_json(&run);
        out["checkpoint"] = serde_json::to_value(&checkpoint)?;
        out["input"] = run.input.clone();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {}",
        style("Run:").bold(),
        style(run.id).cyan()
    );
    println!("  Workflow: {} v{}", run.workflow_id, run.workflow_version);
    println!("  Status: {}", run.status);
    println!("  Correlation: {}", run.correlation_id);
    if let Some(node) = &run.current_node_id {
        println!("  Current node: {}", style(node).cyan());
    }
    if let Some(cp) = &checkpoint {
        println!(
            "  Checkpoint: step {} after '{}' -> {}",
            cp.step,
            cp.completed_node_id,
            cp.next_node_id.as_deref().unwrap_or("end")
        );
    }
    println!("  Created: {}", run.created_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(started) = run.started_at {
        println!("  Started: {}", started.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(completed) = run.completed_at {
        println!("  Completed: {}", completed.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(err) = &run.error {
        println!("  Error: {}", style(err).red());
    }
    println!();

    Ok(())
}

async fn handle_logs(run_id: &str, state: &AppState, json: bool) -> Result<()> {
    let run_id = parse_id(run_id, "run")?;
    // Surface a clean "not found" instead of an empty table.
    load_run(&run_id, state).await?;
    let node_runs = state
        .engine
        .repo()
        .list_node_runs(&run_id)
        .await
        .context("Failed to list node runs")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&node_runs)?);
        return Ok(());
    }

    if node_runs.is_empty() {
        println!();
        println!("  No node runs for run {}.", short_id(&run_id));
        println!();
        return Ok(());
    }

    println!();
    println!("  Node runs for {}", style(short_id(&run_id)).cyan());
    println!();
    println!("{}", node_run_table(&node_runs));
    println!();

    Ok(())
}

fn node_run_table(node_runs: &[NodeRun]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Node").fg(Color::Cyan),
            Cell::new("Attempt"),
            Cell::new("Status"),
            Cell::new("Started"),
            Cell::new("Duration"),
            Cell::new("Error"),
        ]);

    for n in node_runs {
        let duration = n
            .duration_ms
            .map(|ms| format!("{ms} ms"))
            .unwrap_or_else(|| "-".to_string());
        let error = n
            .error
            .as_deref()
            .map(|e| truncate(e, 40))
            .unwrap_or_else(|| "-".to_string());

        table.add_row(vec![
            Cell::new(&n.node_id),
            Cell::new(n.attempt),
            node_status_cell(n.status),
            Cell::new(n.started_at.format("%H:%M:%S").to_string()),
            Cell::new(duration),
            Cell::new(error),
        ]);
    }
    table
}

async fn handle_events(run_id: &str, state: &AppState, json: bool) -> Result<()> {
    let run_id = parse_id(run_id, "run")?;
    load_run(&run_id, state).await?;
    let events = state
        .engine
        .repo()
        .list_events(&run_id)
        .await
        .context("Failed to list events")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&events)?);
        return Ok(());
    }

    if events.is_empty() {
        println!();
        println!("  No events for run {}.", short_id(&run_id));
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Time").fg(Color::Cyan),
            Cell::new("Event"),
            Cell::new("Payload"),
        ]);

    for e in &events {
        table.add_row(vec![
            Cell::new(e.created_at.format("%H:%M:%S%.3f").to_string()),
            Cell::new(e.event_type.as_str()),
            Cell::new(truncate(&e.payload.to_string(), 72)),
        ]);
    }

    println!();
    println!("  Events for {}", style(short_id(&run_id)).cyan());
    println!();
    println!("{table}");
    println!();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use stepwise_types::workflow::NodeRunStatus;

    #[test]
    fn parse_input_defaults_to_empty_object() {
        assert_eq!(parse_input(None).unwrap(), json!({}));
        assert_eq!(
            parse_input(Some(r#"{"order_id": "A-1"}"#)).unwrap(),
            json!({"order_id": "A-1"})
        );
    }

    #[test]
    fn parse_input_rejects_non_objects() {
        assert!(parse_input(Some("[1, 2]")).is_err());
        assert!(parse_input(Some("42")).is_err());
        assert!(parse_input(Some("{not json")).is_err());
    }

    #[test]
    fn describe_event_mentions_node_and_retry() {
        let run_id = Uuid::now_v7();
        let failed = WorkflowEvent::new(
            run_id,
            WorkflowEventType::NodeFailed,
            json!({"node_id": "charge", "attempt": 2, "error": "503", "will_retry": true}),
        );
        let line = console::strip_ansi_codes(&describe_event(&failed)).to_string();
        assert!(line.contains("charge (attempt 2): 503, retrying"));

        let paused = WorkflowEvent::new(
            run_id,
            WorkflowEventType::NodePaused,
            json!({"node_id": "manager_ok"}),
        );
        let line = console::strip_ansi_codes(&describe_event(&paused)).to_string();
        assert!(line.contains("manager_ok waiting"));
    }

    #[test]
    fn node_run_table_lists_attempts() {
        let run_id = Uuid::now_v7();
        let node_run = |attempt, status, error: Option<&str>| NodeRun {
            id: Uuid::now_v7(),
            run_id,
            node_id: "charge".to_string(),
            attempt,
            status,
            input: json!({}),
            output: None,
            error: error.map(str::to_string),
            started_at: Utc::now(),
            completed_at: Some(Utc::now()),
            duration_ms: Some(12),
        };
        let rendered = node_run_table(&[
            node_run(1, NodeRunStatus::Failed, Some("gateway timeout")),
            node_run(2, NodeRunStatus::Succeeded, None),
        ])
        .to_string();
        assert!(rendered.contains("gateway timeout"));
        assert!(rendered.contains("succeeded"));
        assert!(rendered.contains("12 ms"));
    }

    #[test]
    fn start_flags_parse() {
        use clap::Parser;
        let cli = crate::cli::Cli::try_parse_from([
            "stepwise",
            "run",
            "start",
            "0192f0c4-0000-7000-8000-000000000000",
            "--draft",
            "--input",
            r#"{"x":1}"#,
        ])
        .unwrap();
        match cli.command {
            crate::cli::Commands::Run {
                action: RunCommand::Start { draft, input, no_execute, .. },
            } => {
                assert!(draft);
                assert!(!no_execute);
                assert_eq!(input.as_deref(), Some(r#"{"x":1}"#));
            }
            _ => panic!("expected run start"),
        }
    }
}
