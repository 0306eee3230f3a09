use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::fmt::{self, Display};
use std::str::FromStr;

#[derive(Debug, Error, PartialEq)]
#[error("unknown {kind} `{value}`")]
pub struct ParseError {
    kind: &'static str,
    value: String,
}

/// Status of a single VPN identity on one site.
///
/// `Online` means the site advertises the anycast address for this VPN.
/// `Replica` means the site is ready to take over but not advertising.
/// `Pending` is the transient status during bring-up, bring-down and startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VpnStatus {
    Online,
    Replica,
    Pending,
    Failed,
    Offline,
}

/// Reachability of a whole site as recorded by its peers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SiteStatus {
    Online,
    Pending,
    Offline,
    #[serde(rename = "Admin_offline")]
    AdminOffline,
}

/// Process-wide demotion policy when a peer is observed Online for a VPN we hold.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaMode {
    Auto,
    Manual,
    Disabled,
}

impl Display for VpnStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            VpnStatus::Online => "Online",
            VpnStatus::Replica => "Replica",
            VpnStatus::Pending => "Pending",
            VpnStatus::Failed => "Failed",
            VpnStatus::Offline => "Offline",
        };
        write!(f, "{s}")
    }
}

impl FromStr for VpnStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Online" => Ok(VpnStatus::Online),
            "Replica" => Ok(VpnStatus::Replica),
            "Pending" => Ok(VpnStatus::Pending),
            "Failed" => Ok(VpnStatus::Failed),
            "Offline" => Ok(VpnStatus::Offline),
            _ => Err(ParseError {
                kind: "VPN status",
                value: s.to_string(),
            }),
        }
    }
}

impl Display for SiteStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            SiteStatus::Online => "Online",
            SiteStatus::Pending => "Pending",
            SiteStatus::Offline => "Offline",
            SiteStatus::AdminOffline => "Admin_offline",
        };
        write!(f, "{s}")
    }
}

impl FromStr for SiteStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Online" => Ok(SiteStatus::Online),
            "Pending" => Ok(SiteStatus::Pending),
            "Offline" => Ok(SiteStatus::Offline),
            "Admin_offline" => Ok(SiteStatus::AdminOffline),
            _ => Err(ParseError {
                kind: "site status",
                value: s.to_string(),
            }),
        }
    }
}

impl Display for ReplicaMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ReplicaMode::Auto => "Auto",
            ReplicaMode::Manual => "Manual",
            ReplicaMode::Disabled => "Disabled",
        };
        write!(f, "{s}")
    }
}

impl FromStr for ReplicaMode {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Auto" => Ok(ReplicaMode::Auto),
            "Manual" => Ok(ReplicaMode::Manual),
            "Disabled" => Ok(ReplicaMode::Disabled),
            _ => Err(ParseError {
                kind: "replica mode",
                value: s.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vpn_status_parses_every_declared_value() -> anyhow::Result<()> {
        for s in ["Online", "Replica", "Pending", "Failed", "Offline"] {
            let parsed: VpnStatus = s.parse()?;
            assert_eq!(parsed.to_string(), s);
        }
        Ok(())
    }

    #[test]
    fn vpn_status_rejects_unknown_value() {
        assert!("Degraded".parse::<VpnStatus>().is_err());
    }

    #[test]
    fn admin_offline_uses_the_wire_spelling() -> anyhow::Result<()> {
        let parsed: SiteStatus = "Admin_offline".parse()?;
        assert_eq!(parsed, SiteStatus::AdminOffline);
        assert_eq!(parsed.to_string(), "Admin_offline");

        let json = serde_json::to_string(&SiteStatus::AdminOffline)?;
        assert_eq!(json, "\"Admin_offline\"");
        Ok(())
    }

    #[test]
    fn replica_mode_round_trips_through_display() -> anyhow::Result<()> {
        for mode in [ReplicaMode::Auto, ReplicaMode::Manual, ReplicaMode::Disabled] {
            let parsed: ReplicaMode = mode.to_string().parse()?;
            assert_eq!(parsed, mode);
        }
        Ok(())
    }
}
