use std::sync::Arc;

use dynvpn_lib::state::StateDocument;
use dynvpn_lib::status::{SiteStatus, VpnStatus};

use crate::peer;

use super::{Node, PeerUpdate, Transition};

impl Node {
    /// First processor: journal the reported status and forward actual
    /// changes to the policy processor.
    pub(super) fn handle_peer_update(&self, update: PeerUpdate) {
        if update.site_id == self.site_id {
            tracing::debug!(%update, "ignoring peer update about the local site");
            return;
        }

        match self.store.set_vpn_status(&update.site_id, &update.vpn, update.status) {
            None => {
                tracing::warn!(vpn = %update.vpn, site = %update.site_id, "vpn not configured for site");
            }
            Some(previous) if previous == update.status => {}
            Some(previous) => {
                tracing::info!(
                    vpn = %update.vpn,
                    site = %update.site_id,
                    "peer vpn status {} -> {}",
                    previous,
                    update.status
                );
                self.transitions.add(Transition {
                    site_id: update.site_id,
                    vpn: update.vpn,
                    status: update.status,
                    previous,
                });
            }
        }
    }

    /// Enqueue every remote site entry of a peer document into the first
    /// processor. The echoed entry about the local site is skipped so our own
    /// gossip can never demote us.
    pub(super) fn apply_peer_document(&self, doc: &StateDocument) {
        for (site_id, site_state) in &doc.state {
            if *site_id == self.site_id {
                continue;
            }
            for (vpn, status) in &site_state.vpn {
                self.peer_updates.add(PeerUpdate {
                    site_id: site_id.clone(),
                    vpn: vpn.clone(),
                    status: *status,
                });
            }
        }
    }

    pub(super) fn handle_site_status(&self, site_id: &str, status: SiteStatus) {
        let Some(previous) = self.store.set_site_status(site_id, status) else {
            tracing::warn!(site = %site_id, "status update for unknown site");
            return;
        };
        tracing::debug!(site = %site_id, "site status {} -> {}", previous, status);

        // a site that drops off the control plane takes all of its VPNs with
        // it; feed that through the same path as a pulled status
        match (previous, status) {
            (SiteStatus::Pending, SiteStatus::Offline)
            | (SiteStatus::Online, SiteStatus::Offline)
            | (_, SiteStatus::AdminOffline) => {
                for vpn in self.store.site_vpn_names(site_id) {
                    self.peer_updates.add(PeerUpdate {
                        site_id: site_id.to_string(),
                        vpn,
                        status: VpnStatus::Offline,
                    });
                }
            }
            _ => {}
        }
    }

    /// Server side of `GET /peer/pull_state`. `None` while the local site is
    /// administratively offline.
    pub fn handle_pull(&self, caller: &str) -> Option<StateDocument> {
        if self.store.site_status(&self.site_id) == Some(SiteStatus::AdminOffline) {
            tracing::warn!(%caller, "ignoring pull_state: local site is Admin_offline");
            return None;
        }
        tracing::debug!(%caller, "received pull_state");
        self.handle_site_status(caller, SiteStatus::Online);
        Some(self.store.encode())
    }

    /// Server side of `POST /peer/push_state`.
    pub fn handle_push(&self, doc: StateDocument) {
        if self.store.site_status(&self.site_id) == Some(SiteStatus::AdminOffline) {
            tracing::warn!(caller = %doc.id, "ignoring push_state: local site is Admin_offline");
            return;
        }
        tracing::debug!(caller = %doc.id, "received push_state");
        self.handle_site_status(&doc.id, SiteStatus::Online);
        self.apply_peer_document(&doc);
    }

    /// Send our state to every peer, one after the other.
    pub(crate) async fn broadcast_state(&self) {
        for site_id in self.store.remote_site_ids() {
            self.push_state(&site_id).await;
        }
    }

    /// One POST to a single peer. Fire-and-forget: errors are logged and the
    /// periodic pull reconciles.
    pub(crate) async fn push_state(&self, site_id: &str) {
        let Some(site) = self.store.site(site_id) else {
            tracing::error!(site = %site_id, "push_state: unknown peer");
            return;
        };
        if site.status == SiteStatus::Offline {
            tracing::info!(site = %site_id, "push_state: site is offline, skipping");
            return;
        }
        let Some(pull) = site.pull else {
            tracing::error!(site = %site_id, "push_state: no pull settings for site");
            return;
        };

        let doc = self.store.encode();
        match self
            .peers
            .push_state(site.peer_addr, site.peer_port, pull.timeout, &doc)
            .await
        {
            Ok(()) => {}
            Err(e @ peer::Error::Status(_)) => {
                tracing::error!(site = %site_id, error = %e, "error response to push_state");
            }
            Err(e) => {
                tracing::warn!(site = %site_id, error = %e, "push_state failed to connect");
            }
        }
    }

    /// One pull cycle against a single peer, with immediate retries. After
    /// `pull_retries` extra attempts the site is marked Offline.
    pub(crate) async fn pull_state(self: &Arc<Self>, site_id: &str) {
        let Some(site) = self.store.site(site_id) else {
            tracing::error!(site = %site_id, "pull_state: unknown peer");
            return;
        };
        let Some(pull) = site.pull else {
            tracing::error!(site = %site_id, "pull_state: no pull settings for site");
            return;
        };

        for attempt in 0..=pull.retries {
            match self
                .peers
                .pull_state(site.peer_addr, site.peer_port, pull.timeout, &self.site_id)
                .await
            {
                Ok(doc) => {
                    self.handle_site_status(site_id, SiteStatus::Online);
                    self.apply_peer_document(&doc);
                    return;
                }
                Err(e) => {
                    tracing::warn!(site = %site_id, attempt, error = %e, "pull_state failed");
                }
            }
        }
        self.handle_site_status(site_id, SiteStatus::Offline);
    }

    /// Periodic pull loop for one remote site; exits once the local site
    /// leaves the cluster.
    pub(super) async fn pull_state_loop(self: Arc<Self>, site_id: String) {
        let Some(pull) = self.store.site(&site_id).and_then(|s| s.pull) else {
            tracing::error!(site = %site_id, "no pull settings, not starting pull task");
            return;
        };
        loop {
            if self.store.site_status(&self.site_id) == Some(SiteStatus::Offline) {
                tracing::info!("pull_state_loop: detected local site Offline, exiting");
                return;
            }
            tokio::time::sleep(pull.interval).await;
            self.pull_state(&site_id).await;
        }
    }
}
