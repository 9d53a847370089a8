use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

pub(crate) const DEFAULT_STATE_DIR: &str = ".tau/gateway";

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Parser)]
#[command(
    name = "tau-gateway",
    about = "Session governance core of the Tau chat gateway",
    version
)]
/// Public struct `Cli` used across Tau components.
pub(crate) struct Cli {
    #[arg(
        long,
        env = "TAU_GATEWAY_CONFIG",
        help = "Gateway config JSON file (queue, context budget, sandbox, auth)"
    )]
    pub config: Option<PathBuf>,

    #[arg(
        long = "state-dir",
        env = "TAU_GATEWAY_STATE_DIR",
        default_value = DEFAULT_STATE_DIR,
        help = "Directory holding session journals, the session index and the auth profile store"
    )]
    pub state_dir: PathBuf,

    #[arg(
        long = "agent-id",
        env = "TAU_GATEWAY_AGENT_ID",
        help = "Override the agent id from the config file"
    )]
    pub agent_id: Option<String>,

    #[arg(
        long = "auth-store",
        env = "TAU_GATEWAY_AUTH_STORE",
        help = "Auth profile store path; defaults to <state-dir>/auth-profiles.json"
    )]
    pub auth_store: Option<PathBuf>,

    #[arg(
        long = "parent-auth-store",
        env = "TAU_GATEWAY_PARENT_AUTH_STORE",
        help = "Parent-scope auth profile store used when a refresh fails locally"
    )]
    pub parent_auth_store: Option<PathBuf>,

    #[command(subcommand)]
    pub command: GatewayCommand,
}

#[derive(Debug, Subcommand)]
pub(crate) enum GatewayCommand {
    /// Feed an NDJSON inbound fixture through the dispatcher with a dry-run engine.
    Replay {
        #[arg(help = "NDJSON fixture, one inbound event per line")]
        fixture: PathBuf,

        #[arg(
            long = "settle-ms",
            env = "TAU_GATEWAY_REPLAY_SETTLE_MS",
            default_value_t = 250,
            value_parser = parse_positive_u64,
            help = "Quiet period after the last event before the replay is considered settled"
        )]
        settle_ms: u64,

        #[arg(
            long = "engine-latency-ms",
            env = "TAU_GATEWAY_REPLAY_ENGINE_LATENCY_MS",
            default_value_t = 0,
            help = "Simulated duration of each dry-run agent turn"
        )]
        engine_latency_ms: u64,
    },
    /// Repair a session journal that contains truncated lines.
    JournalRepair {
        #[arg(long = "session-key")]
        session_key: String,
    },
    /// Print the resolved sandbox context for a session.
    SandboxInspect {
        #[arg(long = "session-key", help = "Session key; defaults to the agent's main session")]
        session_key: Option<String>,
    },
    /// Print a redacted status row per auth profile.
    AuthStatus {
        #[arg(
            long,
            default_value_t = false,
            action = ArgAction::Set,
            num_args = 0..=1,
            require_equals = true,
            default_missing_value = "true",
            help = "Render JSON instead of a text table"
        )]
        json: bool,
    },
}
