//! `tau-gateway`: operator binary around the gateway session core.
//!
//! `replay` drives the inbound dispatcher from an NDJSON fixture with a
//! dry-run engine; the other subcommands inspect or repair on-disk state.

mod bootstrap_helpers;
mod cli_args;
mod fixture_runner;
mod gateway_config;
mod operator_commands;

use anyhow::Result;
use clap::Parser;

use crate::bootstrap_helpers::{
    build_credential_resolver, build_session_stores, init_tracing, json_lines_event_sink,
};
use crate::cli_args::{Cli, GatewayCommand};
use crate::gateway_config::{apply_cli_overrides, load_gateway_config, GatewayPaths};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    run_cli(cli).await
}

async fn run_cli(cli: Cli) -> Result<()> {
    let mut config = load_gateway_config(cli.config.as_deref())?;
    apply_cli_overrides(&mut config, &cli);
    let paths = GatewayPaths::resolve(&cli.state_dir, &config, &cli);
    tracing::debug!(state_dir = %cli.state_dir.display(), agent_id = %config.dispatcher.agent_id, "gateway configured");

    match &cli.command {
        GatewayCommand::Replay {
            fixture,
            settle_ms,
            engine_latency_ms,
        } => {
            let events =
                fixture_runner::run_replay(&config, &paths, fixture, *settle_ms, *engine_latency_ms)
                    .await?;
            let render = json_lines_event_sink();
            for event in &events {
                render(event);
            }
        }
        GatewayCommand::JournalRepair { session_key } => {
            let (journal, _) = build_session_stores(&paths);
            let report = operator_commands::run_journal_repair(&journal, session_key)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        GatewayCommand::SandboxInspect { session_key } => {
            let context = operator_commands::run_sandbox_inspect(
                &config.dispatcher.sandbox,
                &config.dispatcher.agent_id,
                session_key.as_deref(),
            )?;
            println!("{}", serde_json::to_string_pretty(&context)?);
        }
        GatewayCommand::AuthStatus { json } => {
            let resolver = build_credential_resolver(&config, &paths)?;
            println!("{}", operator_commands::run_auth_status(&resolver, *json)?);
        }
    }
    Ok(())
}
