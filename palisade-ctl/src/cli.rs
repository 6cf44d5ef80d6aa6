use clap::{Parser, Subcommand};
use uuid::Uuid;

use std::net::IpAddr;
use std::path::PathBuf;

use palisade_lib::command::{Command, SafeApplyRequest};

#[derive(Debug, Parser)]
#[command(name = "palisade-ctl", version, about = "Control a running palisade instance")]
pub struct Cli {
    /// Control socket of the running instance.
    #[arg(long, env = palisade_lib::socket::ENV_VAR, default_value = palisade_lib::socket::DEFAULT_PATH)]
    pub socket_path: PathBuf,

    /// Print the raw JSON response.
    #[arg(long)]
    pub json: bool,

    #[command(subcommand)]
    pub command: CtlCommand,
}

#[derive(Debug, Subcommand)]
pub enum CtlCommand {
    /// Liveness check against the control socket.
    Ping,
    /// Show safe-mode state, pending applies and the ruleset generation.
    Status,
    /// Apply a configuration file immediately.
    Apply {
        /// Configuration file (TOML).
        config: PathBuf,
    },
    /// Apply with connectivity verification and optional confirmation.
    SafeApply {
        config: PathBuf,
        /// Address the probes should reach (defaults to this host's view).
        #[arg(long)]
        client_ip: IpAddr,
        /// Probe these targets instead of the client address.
        #[arg(long)]
        ping_target: Vec<IpAddr>,
        /// Keep the change only after an explicit confirm.
        #[arg(long)]
        confirm: bool,
        /// Seconds before an unconfirmed apply rolls back.
        #[arg(long)]
        rollback_delay: Option<u64>,
    },
    /// Confirm a pending safe apply.
    Confirm { id: Uuid },
    /// Cancel a pending safe apply and roll back now.
    Cancel { id: Uuid },
    /// Enter the emergency lockdown ruleset.
    SafeMode,
    /// Leave safe mode and restore the configuration.
    ExitSafeMode,
    /// Refresh all URL-backed IP sets now.
    ReloadLists,
}

pub fn parse() -> Cli {
    Cli::parse()
}

impl CtlCommand {
    /// Reads config files here so the daemon only ever sees parsed models.
    pub fn into_command(self) -> Result<Command, String> {
        Ok(match self {
            CtlCommand::Ping => Command::Ping,
            CtlCommand::Status => Command::Status,
            CtlCommand::Apply { config } => Command::Apply {
                config: Box::new(read_config(&config)?),
            },
            CtlCommand::SafeApply {
                config,
                client_ip,
                ping_target,
                confirm,
                rollback_delay,
            } => Command::SafeApply {
                config: Box::new(read_config(&config)?),
                client_ip,
                options: SafeApplyRequest {
                    ping_targets: ping_target,
                    ping_timeout_secs: None,
                    require_confirmation: confirm,
                    rollback_delay_secs: rollback_delay,
                },
            },
            CtlCommand::Confirm { id } => Command::Confirm { id },
            CtlCommand::Cancel { id } => Command::Cancel { id },
            CtlCommand::SafeMode => Command::SafeMode,
            CtlCommand::ExitSafeMode => Command::ExitSafeMode,
            CtlCommand::ReloadLists => Command::ReloadLists,
        })
    }
}

fn read_config(path: &PathBuf) -> Result<palisade_lib::config::Config, String> {
    let content = std::fs::read_to_string(path).map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    palisade_lib::config::parse(&content).map_err(|e| format!("invalid configuration: {e}"))
}
