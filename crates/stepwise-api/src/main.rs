//! Stepwise CLI entry point.
//!
//! Binary name: `stepwise`
//!
//! Parses CLI arguments, loads configuration, opens the database and wires
//! the workflow engine, then dispatches to the command handler.

mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "stepwise", &mut std::io::stdout());
        return Ok(());
    }

    let data_dir = stepwise_infra::config::resolve_data_dir();
    let config = stepwise_infra::config::load_engine_config(&data_dir).await;

    stepwise_observe::tracing_setup::init_tracing(config.enable_otel, cli.log_filter())
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let result = run(cli, AppState::init(data_dir, config).await).await;
    if let Err(ref err) = result {
        tracing::error!("{err:#}");
    }

    stepwise_observe::tracing_setup::shutdown_tracing();
    result
}

async fn run(cli: Cli, state: anyhow::Result<AppState>) -> anyhow::Result<()> {
    let state = state?;

    match cli.command {
        Commands::Workflow { action } => {
            cli::workflow::handle_workflow_command(action, &state, cli.json).await
        }
        Commands::Run { action } => cli::run::handle_run_command(action, &state, cli.json).await,
        Commands::Completions { .. } => Ok(()),
    }
}
