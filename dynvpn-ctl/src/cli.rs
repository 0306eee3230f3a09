use clap::{Parser, Subcommand};
use url::Url;

use dynvpn_lib::status::ReplicaMode;

pub const ENV_VAR_ENDPOINT: &str = "DYNVPN_CONTROL_URL";
pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:8999";

/// Operator control interface for a dynvpn coordinator
#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Control endpoint of the coordinator
    #[arg(
        short,
        long,
        env = ENV_VAR_ENDPOINT,
        default_value = DEFAULT_ENDPOINT
    )]
    pub endpoint: Url,

    /// Print raw JSON responses
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Dump the cluster state as seen by this site
    #[command()]
    Status {},

    /// Bring a VPN online on this site
    #[command()]
    SetOnline { name: String },

    /// Take a VPN offline on this site
    #[command()]
    SetOffline { name: String },

    /// Demote a VPN to warm standby, or promote it if no peer is Online
    #[command()]
    SetReplica { name: String },

    /// Replace the local VPN process while keeping the anycast route
    #[command()]
    Restart { name: String },

    /// Stop all local VPNs and withdraw this site from the cluster
    #[command()]
    Shutdown {},

    /// Switch the automatic demotion policy
    #[command()]
    SetReplicaMode { mode: ReplicaMode },

    /// Dump supervisor tasks and lock owners
    #[command()]
    DebugState {},
}

pub fn parse() -> Cli {
    Cli::parse()
}
