use serde::{Deserialize, Serialize};
use serde_json::ser::PrettyFormatter;

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::time::Duration;

use crate::status::{ReplicaMode, SiteStatus, VpnStatus};

/// One VPN identity as seen from one site. Records are created from
/// configuration at startup and only their status ever changes.
#[derive(Clone, Debug)]
pub struct VpnRecord {
    pub name: String,
    pub site_id: String,
    pub local_addr: Ipv4Addr,
    pub anycast_addr: Ipv4Addr,
    pub status: VpnStatus,
}

/// Pull pacing for a remote site; absent on the local site.
#[derive(Clone, Copy, Debug)]
pub struct PullSettings {
    pub interval: Duration,
    pub timeout: Duration,
    pub retries: u32,
}

#[derive(Clone, Debug)]
pub struct Site {
    pub id: String,
    pub peer_addr: Ipv4Addr,
    pub peer_port: u16,
    pub gateway_addr: Ipv4Addr,
    pub vpn: BTreeMap<String, VpnRecord>,
    pub status: SiteStatus,
    pub pull: Option<PullSettings>,
}

/// State document exchanged between peers and served to operators.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateDocument {
    pub id: String,
    pub replica_mode: ReplicaMode,
    pub state: BTreeMap<String, SiteState>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SiteState {
    pub id: String,
    pub vpn: BTreeMap<String, VpnStatus>,
}

pub fn decode(data: &str) -> Result<StateDocument, serde_json::Error> {
    serde_json::from_str(data)
}

/// Human-facing rendition; debug endpoints use a 4-space indent.
pub fn encode_pretty<T: Serialize>(value: &T) -> String {
    let mut buf = Vec::new();
    let formatter = PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    match value.serialize(&mut ser) {
        Ok(()) => String::from_utf8_lossy(&buf).to_string(),
        Err(e) => format!("serialization error: {e}"),
    }
}

/// In-memory model of every site and VPN in the cluster.
///
/// Mutators are synchronous and hold the internal mutex only for the duration
/// of the map access; serialisation of whole transitions happens under the
/// per-VPN locks or inside the single-consumer event processors.
pub struct Store {
    local_site: String,
    inner: Mutex<Inner>,
}

struct Inner {
    sites: BTreeMap<String, Site>,
    replica_mode: ReplicaMode,
}

impl Store {
    pub fn new(local_site: String, sites: BTreeMap<String, Site>, replica_mode: ReplicaMode) -> Self {
        Store {
            local_site,
            inner: Mutex::new(Inner { sites, replica_mode }),
        }
    }

    pub fn replica_mode(&self) -> ReplicaMode {
        self.inner.lock().expect("store poisoned").replica_mode
    }

    pub fn set_replica_mode(&self, mode: ReplicaMode) {
        self.inner.lock().expect("store poisoned").replica_mode = mode;
    }

    pub fn site(&self, site_id: &str) -> Option<Site> {
        self.inner.lock().expect("store poisoned").sites.get(site_id).cloned()
    }

    pub fn site_status(&self, site_id: &str) -> Option<SiteStatus> {
        let inner = self.inner.lock().expect("store poisoned");
        inner.sites.get(site_id).map(|s| s.status)
    }

    /// Returns the previous status, or `None` for an unknown site.
    pub fn set_site_status(&self, site_id: &str, status: SiteStatus) -> Option<SiteStatus> {
        let mut inner = self.inner.lock().expect("store poisoned");
        inner.sites.get_mut(site_id).map(|site| {
            let previous = site.status;
            site.status = status;
            previous
        })
    }

    pub fn vpn_status(&self, site_id: &str, vpn: &str) -> Option<VpnStatus> {
        let inner = self.inner.lock().expect("store poisoned");
        inner.sites.get(site_id).and_then(|s| s.vpn.get(vpn)).map(|v| v.status)
    }

    /// Returns the previous status, or `None` when the site/VPN pair is not
    /// configured locally.
    pub fn set_vpn_status(&self, site_id: &str, vpn: &str, status: VpnStatus) -> Option<VpnStatus> {
        let mut inner = self.inner.lock().expect("store poisoned");
        inner
            .sites
            .get_mut(site_id)
            .and_then(|s| s.vpn.get_mut(vpn))
            .map(|record| {
                let previous = record.status;
                record.status = status;
                previous
            })
    }

    pub fn local_vpn(&self, vpn: &str) -> Option<VpnRecord> {
        let inner = self.inner.lock().expect("store poisoned");
        inner
            .sites
            .get(&self.local_site)
            .and_then(|s| s.vpn.get(vpn))
            .cloned()
    }

    pub fn local_vpn_status(&self, vpn: &str) -> Option<VpnStatus> {
        self.vpn_status(&self.local_site, vpn)
    }

    pub fn local_vpn_names(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("store poisoned");
        inner
            .sites
            .get(&self.local_site)
            .map(|s| s.vpn.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn remote_site_ids(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("store poisoned");
        inner.sites.keys().filter(|id| **id != self.local_site).cloned().collect()
    }

    pub fn site_vpn_names(&self, site_id: &str) -> Vec<String> {
        let inner = self.inner.lock().expect("store poisoned");
        inner
            .sites
            .get(site_id)
            .map(|s| s.vpn.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Sites currently marked Online whose copy of `vpn` is in one of the
    /// given statuses. The local site participates like any other.
    pub fn sites_with_vpn_status(&self, vpn: &str, statuses: &[VpnStatus]) -> Vec<String> {
        let inner = self.inner.lock().expect("store poisoned");
        inner
            .sites
            .values()
            .filter(|site| site.status == SiteStatus::Online)
            .filter(|site| {
                site.vpn
                    .get(vpn)
                    .map(|record| statuses.contains(&record.status))
                    .unwrap_or(false)
            })
            .map(|site| site.id.clone())
            .collect()
    }

    /// Whether any remote site's copy of `vpn` was last reported in the given
    /// status, regardless of that site's reachability.
    pub fn any_peer_vpn_in(&self, vpn: &str, status: VpnStatus) -> bool {
        let inner = self.inner.lock().expect("store poisoned");
        inner
            .sites
            .values()
            .filter(|site| site.id != self.local_site)
            .any(|site| site.vpn.get(vpn).map(|record| record.status == status).unwrap_or(false))
    }

    /// Remote sites that are reachable and hold `vpn` Online.
    pub fn online_peers_for(&self, vpn: &str) -> Vec<String> {
        let inner = self.inner.lock().expect("store poisoned");
        inner
            .sites
            .values()
            .filter(|site| site.id != self.local_site)
            .filter(|site| site.status == SiteStatus::Online)
            .filter(|site| {
                site.vpn
                    .get(vpn)
                    .map(|record| record.status == VpnStatus::Online)
                    .unwrap_or(false)
            })
            .map(|site| site.id.clone())
            .collect()
    }

    pub fn encode(&self) -> StateDocument {
        let inner = self.inner.lock().expect("store poisoned");
        let state = inner
            .sites
            .iter()
            .map(|(id, site)| {
                let vpn = site.vpn.iter().map(|(name, record)| (name.clone(), record.status)).collect();
                (id.clone(), SiteState { id: id.clone(), vpn })
            })
            .collect();

        StateDocument {
            id: self.local_site.clone(),
            replica_mode: inner.replica_mode,
            state,
        }
    }
}
