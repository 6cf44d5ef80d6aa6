use clap::{Parser, Subcommand};

use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "palisade", version, about = "Edge firewall control plane")]
pub struct Cli {
    /// Network policy configuration file.
    #[arg(long, env = "PALISADE_CONFIG_PATH", default_value = palisade_lib::config::DEFAULT_PATH)]
    pub config_path: PathBuf,

    /// Control socket for palisade-ctl and the API process.
    #[arg(long, env = "PALISADE_SOCKET_PATH", default_value = palisade_lib::socket::DEFAULT_PATH)]
    pub socket_path: PathBuf,

    /// State directory (store, certs, list cache).
    #[arg(long, env = "PALISADE_STATE_DIR", default_value = palisade_lib::dirs::DEFAULT_STATE_DIR)]
    pub state_dir: PathBuf,

    /// Log file; stdout when unset.
    #[arg(long, env = "PALISADE_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    /// Pid file for service managers.
    #[arg(long)]
    pub pid_file: Option<PathBuf>,

    /// API listen address; a leading `/` selects a Unix socket.
    #[arg(long, env = "PALISADE_API_LISTEN", default_value = "0.0.0.0:8080")]
    pub api_listen: String,

    /// Unprivileged user the API child drops to.
    #[arg(long, env = "PALISADE_API_USER", default_value = "palisade-api")]
    pub api_user: String,

    /// Probe targets for safe applies initiated from the config file watch.
    #[arg(long)]
    pub ping_target: Vec<IpAddr>,

    #[command(subcommand)]
    pub role: Option<Role>,
}

#[derive(Debug, Subcommand)]
pub enum Role {
    /// Internal: the sandboxed API process re-executed inside the netns.
    #[command(hide = true)]
    ApiChild {
        #[arg(long)]
        listen: String,
        #[arg(long)]
        jail: PathBuf,
        #[arg(long)]
        user: String,
    },
    /// Connect to a running instance and take over its state and listeners.
    TakeOver {
        #[arg(long, default_value = palisade_lib::handoff::DEFAULT_SOCKET)]
        handoff_socket: PathBuf,
    },
}

pub fn parse() -> Cli {
    Cli::parse()
}
