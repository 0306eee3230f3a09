use clap::Parser;

use std::path::PathBuf;

use dynvpn_lib::config;

/// Distributed anycast VPN failover coordinator, one instance per site
#[derive(Clone, Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Identifier of this site in the global site map
    #[arg(long, env = config::ENV_VAR_SITE_ID)]
    pub site_id: String,

    /// Per-site configuration file
    #[arg(
        long,
        env = config::ENV_VAR_LOCAL,
        default_value = config::DEFAULT_LOCAL_PATH
    )]
    pub local_config: PathBuf,

    /// Cluster-wide configuration file
    #[arg(
        long,
        env = config::ENV_VAR_GLOBAL,
        default_value = config::DEFAULT_GLOBAL_PATH
    )]
    pub global_config: PathBuf,
}

pub fn parse() -> Cli {
    Cli::parse()
}
