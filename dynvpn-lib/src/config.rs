use serde::Deserialize;
use thiserror::Error;
use tokio::fs;

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::state::{PullSettings, Site, VpnRecord};
use crate::status::{ReplicaMode, SiteStatus, VpnStatus};

pub const DEFAULT_LOCAL_PATH: &str = "local.yml";
pub const DEFAULT_GLOBAL_PATH: &str = "global.yml";
pub const ENV_VAR_LOCAL: &str = "DYNVPN_LOCAL_CONFIG";
pub const ENV_VAR_GLOBAL: &str = "DYNVPN_GLOBAL_CONFIG";
pub const ENV_VAR_SITE_ID: &str = "DYNVPN_SITE_ID";

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration file not found: {0}")]
    NoFile(PathBuf),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("deserialization error: {0}")]
    YamlDeserialization(#[from] serde_yaml::Error),
    #[error("local site `{0}` not present in the global site map")]
    UnknownSite(String),
    #[error("address base {base} cannot hold VPN id {id}")]
    AddrRange { base: Ipv4Addr, id: u32 },
}

/// Per-site settings (`local.yml`).
#[derive(Clone, Debug, Deserialize)]
pub struct LocalConfig {
    pub site_id: String,
    pub script_path: PathBuf,
    pub local_vpn_dir: PathBuf,
    pub replica_mode: ReplicaMode,

    #[serde(default = "default_pull_interval")]
    pub pull_interval: u64,
    #[serde(default = "default_pull_timeout")]
    pub pull_timeout: u64,
    #[serde(default = "default_pull_retries")]
    pub pull_retries: u32,

    #[serde(default = "default_check_interval")]
    pub local_vpn_check_interval: u64,
    #[serde(default = "default_check_timeout")]
    pub local_vpn_check_timeout: u64,
    #[serde(default = "default_check_retries")]
    pub local_vpn_check_retries: u32,

    /// 0 disables clearing of the Failed status.
    #[serde(default)]
    pub failed_status_timeout: u64,
    /// Negative means retry without bound.
    #[serde(default = "default_failure_retries")]
    pub failure_retries: i32,
    #[serde(default = "default_timeout")]
    pub default_timeout: u64,
    #[serde(default = "default_online_check_delay")]
    pub online_check_delay: u64,
}

fn default_pull_interval() -> u64 {
    30
}
fn default_pull_timeout() -> u64 {
    10
}
fn default_pull_retries() -> u32 {
    2
}
fn default_check_interval() -> u64 {
    10
}
fn default_check_timeout() -> u64 {
    3
}
fn default_check_retries() -> u32 {
    1
}
fn default_failure_retries() -> i32 {
    2
}
fn default_timeout() -> u64 {
    60
}
fn default_online_check_delay() -> u64 {
    5
}

/// Cluster-wide settings (`global.yml`), identical on every site.
#[derive(Clone, Debug, Deserialize)]
pub struct GlobalConfig {
    pub vpn_anycast_addr_base: Ipv4Addr,
    pub sites: BTreeMap<String, SiteConfig>,
    pub replica_priority: BTreeMap<String, Vec<String>>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SiteConfig {
    pub peer_addr: Ipv4Addr,
    pub peer_port: u16,
    pub gateway_addr: Ipv4Addr,
    pub vpn_local_addr_base: Ipv4Addr,
    pub vpn: Vec<u32>,
}

pub async fn read_local(path: &Path) -> Result<LocalConfig, Error> {
    let content = read_file(path).await?;
    Ok(serde_yaml::from_str(&content)?)
}

pub async fn read_global(path: &Path) -> Result<GlobalConfig, Error> {
    let content = read_file(path).await?;
    Ok(serde_yaml::from_str(&content)?)
}

async fn read_file(path: &Path) -> Result<String, Error> {
    fs::read_to_string(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::NoFile(path.to_path_buf())
        } else {
            Error::IO(e)
        }
    })
}

/// VPN identities are named after their numeric id.
pub fn vpn_name(id: u32) -> String {
    format!("dynvpn{id}")
}

/// IPv4-numeric `base + id`.
pub fn offset_addr(base: Ipv4Addr, id: u32) -> Result<Ipv4Addr, Error> {
    u32::from(base)
        .checked_add(id)
        .map(Ipv4Addr::from)
        .ok_or(Error::AddrRange { base, id })
}

/// Build the initial site map for the state store. Every record starts out
/// Pending; remote sites carry the pull pacing from the local configuration.
pub fn build_sites(
    site_id: &str,
    local: &LocalConfig,
    global: &GlobalConfig,
) -> Result<BTreeMap<String, Site>, Error> {
    if !global.sites.contains_key(site_id) {
        return Err(Error::UnknownSite(site_id.to_string()));
    }

    let mut sites = BTreeMap::new();
    for (id, site_config) in &global.sites {
        let mut vpn = BTreeMap::new();
        for vpn_id in &site_config.vpn {
            let name = vpn_name(*vpn_id);
            vpn.insert(
                name.clone(),
                VpnRecord {
                    name,
                    site_id: id.clone(),
                    local_addr: offset_addr(site_config.vpn_local_addr_base, *vpn_id)?,
                    anycast_addr: offset_addr(global.vpn_anycast_addr_base, *vpn_id)?,
                    status: VpnStatus::Pending,
                },
            );
        }

        let pull = if id == site_id {
            None
        } else {
            Some(PullSettings {
                interval: Duration::from_secs(local.pull_interval),
                timeout: Duration::from_secs(local.pull_timeout),
                retries: local.pull_retries,
            })
        };

        sites.insert(
            id.clone(),
            Site {
                id: id.clone(),
                peer_addr: site_config.peer_addr,
                peer_port: site_config.peer_port,
                gateway_addr: site_config.gateway_addr,
                vpn,
                status: SiteStatus::Pending,
                pull,
            },
        );
    }

    Ok(sites)
}
