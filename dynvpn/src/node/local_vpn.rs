use std::sync::Arc;
use std::time::Duration;

use dynvpn_lib::status::VpnStatus;
use dynvpn_lib::task::current_task_name;

use super::Node;

impl Node {
    /// Whether a VPN process is currently running. A live process does not
    /// necessarily mean connectivity.
    pub(crate) async fn check_local_vpn_process(&self, vpn: &str) -> bool {
        let Some(record) = self.store.local_vpn(vpn) else {
            tracing::warn!(%vpn, "local VPN not found");
            return false;
        };
        match self.scripts.check_pid(vpn, record.local_addr).await {
            Ok(out) => out.success(),
            Err(e) => {
                tracing::error!(%vpn, error = %e, "pid check failed to execute");
                false
            }
        }
    }

    /// Probe connectivity through the VPN, retrying immediately up to
    /// `local_vpn_check_retries` extra times. Any success counts.
    pub(crate) async fn check_local_vpn_connectivity(&self, vpn: &str) -> bool {
        let Some(record) = self.store.local_vpn(vpn) else {
            tracing::warn!(%vpn, "local VPN not found");
            return false;
        };

        for _ in 0..=self.local.local_vpn_check_retries {
            match self
                .scripts
                .vpn_check_online(record.local_addr, self.local.local_vpn_check_timeout, vpn)
                .await
            {
                Ok(out) if out.success() => return true,
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(%vpn, error = %e, "connectivity check failed to execute");
                }
            }
        }
        tracing::info!(%vpn, "connectivity check detected not online");
        false
    }

    /// Stop any running VPN process and optionally withdraw the anycast
    /// route. Does not change the stored status.
    pub(crate) async fn set_local_vpn_offline(&self, vpn: &str, remove_route: bool) {
        let Some(record) = self.store.local_vpn(vpn) else {
            tracing::error!(%vpn, "local VPN not found");
            return;
        };

        match self.scripts.vpn_set_offline(vpn, record.local_addr).await {
            Ok(out) if !out.success() => {
                tracing::error!(%vpn, code = out.code, stderr = %out.stderr, "offline script failed");
            }
            Ok(_) => {}
            Err(e) => tracing::error!(%vpn, error = %e, "offline script failed to execute"),
        }

        if remove_route {
            match self.scripts.delete_vpn_route(record.anycast_addr).await {
                Ok(out) if !out.success() => {
                    tracing::error!(%vpn, code = out.code, stderr = %out.stderr, "route delete script failed");
                }
                Ok(_) => {}
                Err(e) => tracing::error!(%vpn, error = %e, "route delete script failed to execute"),
            }
        }
    }

    /// Start the VPN process, wait for it to settle, verify connectivity and
    /// publish the anycast route. Returns whether the whole sequence
    /// succeeded.
    pub(crate) async fn set_local_vpn_online(&self, vpn: &str) -> bool {
        let Some(record) = self.store.local_vpn(vpn) else {
            tracing::error!(%vpn, "local VPN not found");
            return false;
        };
        let Some(site) = self.store.site(&self.site_id) else {
            tracing::error!(%vpn, "local site not found");
            return false;
        };

        match self
            .scripts
            .vpn_set_online(vpn, record.local_addr, &self.site_id, site.gateway_addr)
            .await
        {
            Ok(out) if out.success() => {}
            Ok(out) => {
                tracing::error!(%vpn, code = out.code, stdout = %out.stdout, stderr = %out.stderr, "online script failed");
                return false;
            }
            Err(e) => {
                tracing::error!(%vpn, error = %e, "online script failed to execute");
                return false;
            }
        }

        let delay = self.local.online_check_delay;
        tracing::info!(%vpn, delay, "waiting before connectivity check");
        tokio::time::sleep(Duration::from_secs(delay)).await;

        if !self.check_local_vpn_connectivity(vpn).await {
            tracing::error!(%vpn, "connectivity check failed after bring-up");
            return false;
        }

        match self.scripts.add_vpn_route(record.anycast_addr, site.gateway_addr).await {
            Ok(out) if out.success() => true,
            Ok(out) => {
                tracing::error!(%vpn, code = out.code, stderr = %out.stderr, "route add script failed");
                false
            }
            Err(e) => {
                tracing::error!(%vpn, error = %e, "route add script failed to execute");
                false
            }
        }
    }

    /// Launch the periodic health checker for an Online/Pending VPN. At most
    /// one checker runs per VPN.
    pub(crate) fn start_check_vpn_task(self: &Arc<Self>, vpn: &str) {
        let name = format!("check-vpn_{vpn}");
        if self.tasks.find(&name).is_some() {
            tracing::warn!(%vpn, "health check task already exists");
            return;
        }

        tracing::debug!(%vpn, "starting health check task");
        let node = self.clone();
        let vpn = vpn.to_string();
        self.tasks.add(&name, async move { node.check_vpn_loop(vpn).await });
    }

    async fn check_vpn_loop(self: Arc<Self>, vpn: String) {
        loop {
            match self.store.local_vpn_status(&vpn) {
                Some(VpnStatus::Online | VpnStatus::Pending) => {}
                _ => {
                    tracing::info!(%vpn, "VPN is not Online or Pending, exiting health check task");
                    return;
                }
            }

            tokio::time::sleep(Duration::from_secs(self.local.local_vpn_check_interval)).await;

            if !self.check_local_vpn_connectivity(&vpn).await {
                tracing::info!(%vpn, "health check failure detected, initiating retries");
                let node = self.clone();
                let name = format!("failure_retry({vpn})");
                let retries = self.local.failure_retries;
                let v = vpn.clone();
                self.tasks
                    .add(&name, async move { node.failure_retry(v, true, retries).await });
                return;
            }
        }
    }

    /// Returns whether a running checker was found and cancelled.
    pub(crate) fn stop_check_vpn_task(&self, vpn: &str) -> bool {
        let name = format!("check-vpn_{vpn}");
        if self.tasks.cancel(&name) {
            tracing::debug!(%vpn, "cancelled health check task");
            true
        } else {
            if self.store.local_vpn_status(vpn) == Some(VpnStatus::Online) {
                tracing::error!(%vpn, "could not find health check task for an Online VPN");
            }
            false
        }
    }

    /// Cancel every pending failure-retry task for this VPN except the one we
    /// are currently running inside of.
    pub(crate) fn stop_retries(&self, vpn: &str) {
        let prefix = format!("failure_retry({vpn})");
        let current = current_task_name();
        for name in self.tasks.names() {
            if name.starts_with(&prefix) && name != current {
                tracing::debug!(task = %name, "cancelling pending retry");
                self.tasks.cancel(&name);
            }
        }
    }
}
