use std::sync::Arc;

use dynvpn_lib::priority::replica_distance;
use dynvpn_lib::status::{ReplicaMode, SiteStatus, VpnStatus};

use super::{Node, OnlineOptions, Transition};

impl Node {
    /// Whether this site appears on the replica priority list for `vpn`.
    pub(crate) fn replica_configured(&self, vpn: &str) -> bool {
        match self.replica_priority.get(vpn) {
            Some(list) => list.contains(&self.site_id),
            None => {
                tracing::warn!(%vpn, "VPN not present in the priority list");
                false
            }
        }
    }

    /// Second processor: act on a deduplicated peer status change.
    pub(super) async fn handle_transition(self: &Arc<Self>, t: Transition) {
        use VpnStatus as Vs;

        match (t.previous, t.status) {
            (Vs::Online, Vs::Failed) | (Vs::Pending, Vs::Failed) | (_, Vs::Offline) => {
                self.peer_unavailable(&t).await;
            }
            (_, Vs::Online) => self.peer_online(&t).await,
            (_, Vs::Replica) | (_, Vs::Pending) => {}
            (_, Vs::Failed) => {
                tracing::warn!(transition = %t, "illegal transition or missed a transition");
            }
        }
    }

    /// A peer lost a VPN. Take over when we are its direct live successor on
    /// the priority list, or when no other live replica exists.
    async fn peer_unavailable(self: &Arc<Self>, t: &Transition) {
        let Some(priority) = self.replica_priority.get(&t.vpn) else {
            tracing::info!(vpn = %t.vpn, site = %t.site_id, "VPN not present in replica_priority, discarding update");
            return;
        };
        if !priority.contains(&self.site_id) {
            tracing::info!(vpn = %t.vpn, site = %t.site_id, "local site not configured as a replica, skipping");
            return;
        }
        if self.store.local_vpn_status(&t.vpn) != Some(VpnStatus::Replica) {
            return;
        }

        let order = self.eligible_order(&t.vpn, &t.site_id, priority);
        let distance = replica_distance(&t.site_id, &self.site_id, &order);
        tracing::info!(vpn = %t.vpn, site = %t.site_id, ?distance, ?order, "peer unavailable, evaluating takeover");

        let other_replicas = order.iter().any(|s| *s != self.site_id && *s != t.site_id);
        if distance == Some(1) || !other_replicas {
            if let Err(e) = self.vpn_online(&t.vpn, OnlineOptions::default()).await {
                tracing::warn!(vpn = %t.vpn, error = %e, "failover bring-up failed");
            }
        }
    }

    /// Online arbitration: a peer went Online for a VPN we hold Pending or
    /// Online, so we stand down. Whoever this processor saw last wins.
    async fn peer_online(self: &Arc<Self>, t: &Transition) {
        match self.store.local_vpn_status(&t.vpn) {
            Some(VpnStatus::Pending | VpnStatus::Online) => {}
            _ => return,
        }

        let target = match self.store.replica_mode() {
            ReplicaMode::Auto => VpnStatus::Replica,
            ReplicaMode::Manual | ReplicaMode::Disabled => VpnStatus::Offline,
        };
        tracing::info!(vpn = %t.vpn, site = %t.site_id, %target, "peer went Online for a VPN we hold, standing down");

        if let Err(e) = self.vpn_demote(&t.vpn, target, true).await {
            tracing::warn!(vpn = %t.vpn, error = %e, "failed standing down");
        }
    }

    /// The priority list restricted to live replicas, keeping the failed peer
    /// and ourselves as the distance endpoints.
    fn eligible_order(&self, vpn: &str, peer: &str, priority: &[String]) -> Vec<String> {
        priority
            .iter()
            .filter(|site| {
                let site = site.as_str();
                site == peer
                    || site == self.site_id
                    || (self.store.site_status(site) == Some(SiteStatus::Online)
                        && self.store.vpn_status(site, vpn) == Some(VpnStatus::Replica))
            })
            .cloned()
            .collect()
    }
}
