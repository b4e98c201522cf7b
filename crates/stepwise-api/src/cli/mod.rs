//! CLI command definitions for the `stepwise` binary.
//!
//! Uses clap derive macros. Commands are grouped by noun
//! (`stepwise workflow create`, `stepwise run start`).

pub mod run;
pub mod workflow;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use comfy_table::{Cell, Color};
use stepwise_types::workflow::{NodeRunStatus, WorkflowRunStatus};
use uuid::Uuid;

/// Durable workflow runs with checkpoints, retries, and approvals.
#[derive(Parser)]
#[command(name = "stepwise", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Default tracing directive when `RUST_LOG` is unset.
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 if self.quiet => "error",
            0 => "warn",
            1 => "info,stepwise=debug",
            _ => "trace",
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Register, publish, and inspect workflow definitions.
    #[command(alias = "wf")]
    Workflow {
        #[command(subcommand)]
        action: workflow::WorkflowCommand,
    },

    /// Start, resume, approve, cancel, and inspect runs.
    Run {
        #[command(subcommand)]
        action: run::RunCommand,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

pub(crate) fn parse_id(raw: &str, what: &str) -> Result<Uuid> {
    raw.trim()
        .parse()
        .with_context(|| format!("Invalid {what} ID: '{raw}'"))
}

/// First 8 characters of a UUID for table display.
pub(crate) fn short_id(id: &Uuid) -> String {
    id.to_string().chars().take(8).collect()
}

pub(crate) fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let mut out: String = text.chars().take(max.saturating_sub(3)).collect();
        out.push_str("...");
        out
    }
}

pub(crate) fn run_status_cell(status: WorkflowRunStatus) -> Cell {
    let color = match status {
        WorkflowRunStatus::Queued => Color::Yellow,
        WorkflowRunStatus::Running => Color::Blue,
        WorkflowRunStatus::Completed => Color::Green,
        WorkflowRunStatus::Failed => Color::Red,
        WorkflowRunStatus::Cancelled => Color::DarkYellow,
    };
    Cell::new(status.as_str()).fg(color)
}

pub(crate) fn node_status_cell(status: NodeRunStatus) -> Cell {
    let color = match status {
        NodeRunStatus::Running => Color::Blue,
        NodeRunStatus::Succeeded => Color::Green,
        NodeRunStatus::Failed => Color::Red,
        NodeRunStatus::Paused => Color::Magenta,
    };
    Cell::new(status.as_str()).fg(color)
}
