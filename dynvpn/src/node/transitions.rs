use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use dynvpn_lib::lock::VpnLock;
use dynvpn_lib::status::{SiteStatus, VpnStatus};

use super::{Error, Node};

/// How `vpn_online` behaves around its caller. The defaults fit the control
/// API; startup and the retry loop override individual knobs.
#[derive(Clone, Copy, Debug)]
pub struct OnlineOptions {
    pub broadcast: bool,
    pub take_lock: bool,
    pub retries: i32,
}

impl Default for OnlineOptions {
    fn default() -> Self {
        OnlineOptions {
            broadcast: true,
            take_lock: true,
            retries: 0,
        }
    }
}

impl Node {
    /// Update the status of a local VPN and, unless suppressed, push the new
    /// state to every peer.
    pub(crate) async fn set_status(&self, vpn: &str, status: VpnStatus, broadcast: bool) {
        if self.store.set_vpn_status(&self.site_id, vpn, status).is_none() {
            tracing::warn!(%vpn, "cannot set status of unknown local VPN");
            return;
        }
        if broadcast {
            self.broadcast_state().await;
        }
    }

    fn release_lock(&self, vpn: &str, lock: &VpnLock) {
        if let Err(e) = lock.release() {
            tracing::error!(%vpn, error = %e, "failed releasing lock");
        }
    }

    /// Bring a local VPN Online. Idempotent for an already-Online VPN. The
    /// whole operation runs under `default_timeout`; on expiry the VPN is
    /// forced offline and marked Failed.
    pub fn vpn_online<'a>(
        self: &'a Arc<Self>,
        vpn: &'a str,
        opts: OnlineOptions,
    ) -> Pin<Box<dyn Future<Output = Result<bool, Error>> + Send + 'a>> {
        Box::pin(async move {
            self.stop_retries(vpn);

            let lock = self.locks.get(vpn)?;
            if opts.take_lock {
                tracing::debug!(%vpn, "vpn_online: locking");
                lock.acquire().await;
            }

            let timeout = Duration::from_secs(self.local.default_timeout);
            match tokio::time::timeout(timeout, self.vpn_online_impl(vpn, opts.broadcast, opts.retries)).await {
                Ok(outcome) => {
                    if opts.take_lock {
                        self.release_lock(vpn, &lock);
                    }
                    outcome
                }
                Err(_) => {
                    tracing::warn!(%vpn, timeout = self.local.default_timeout, "vpn_online timed out");
                    self.set_local_vpn_offline(vpn, true).await;
                    self.set_status(vpn, VpnStatus::Failed, opts.broadcast).await;
                    if opts.take_lock {
                        self.release_lock(vpn, &lock);
                    }
                    Err(Error::Timeout(vpn.to_string()))
                }
            }
        })
    }

    async fn vpn_online_impl(self: &Arc<Self>, vpn: &str, broadcast: bool, retries: i32) -> Result<bool, Error> {
        if self.store.local_vpn_status(vpn) == Some(VpnStatus::Online) {
            tracing::info!(%vpn, "vpn_online: already Online, skipping");
            return Ok(true);
        }

        // a surviving process with connectivity is adopted as-is; a stale one
        // is stopped (keeping the route slot free for the fresh bring-up)
        if self.check_local_vpn_process(vpn).await {
            if self.check_local_vpn_connectivity(vpn).await {
                tracing::info!(%vpn, "vpn_online: process is already online, adopting it");
                self.set_status(vpn, VpnStatus::Online, broadcast).await;
                self.start_check_vpn_task(vpn);
                return Ok(true);
            }
            tracing::info!(%vpn, "vpn_online: stale process, stopping it");
            self.set_local_vpn_offline(vpn, false).await;
        }

        if !self.replica_configured(vpn) {
            tracing::warn!(%vpn, "vpn_online: this site is not on the replica list");
            return Err(Error::NotReplica(vpn.to_string()));
        }

        self.set_status(vpn, VpnStatus::Pending, broadcast).await;

        if self.set_local_vpn_online(vpn).await {
            self.set_status(vpn, VpnStatus::Online, broadcast).await;
            self.start_check_vpn_task(vpn);
            Ok(true)
        } else {
            // a separate task gives every retry its own timeout window and
            // lets competing operations acquire the lock in between
            let node = self.clone();
            let name = format!("failure_retry({vpn}) retries={retries}");
            let v = vpn.to_string();
            self.tasks
                .add(&name, async move { node.failure_retry(v, broadcast, retries).await });
            Ok(false)
        }
    }

    /// Stop a local VPN and record `target` (Offline, or Replica when
    /// demoted by online arbitration). Idempotent on an already-stopped VPN.
    pub(crate) async fn vpn_demote(self: &Arc<Self>, vpn: &str, target: VpnStatus, broadcast: bool) -> Result<(), Error> {
        self.stop_retries(vpn);

        let lock = self.locks.get(vpn)?;
        tracing::debug!(%vpn, "vpn_demote: locking");
        lock.acquire().await;

        self.stop_check_vpn_task(vpn);
        tracing::info!(%vpn, status = %target, "stopping local VPN");
        self.set_local_vpn_offline(vpn, true).await;
        self.set_status(vpn, target, broadcast).await;

        self.release_lock(vpn, &lock);
        Ok(())
    }

    pub async fn vpn_offline(self: &Arc<Self>, vpn: &str, broadcast: bool) -> Result<(), Error> {
        self.vpn_demote(vpn, VpnStatus::Offline, broadcast).await
    }

    /// Stand by as a warm replica. Refused when this site is not on the
    /// VPN's priority list; promotes to Online instead when no peer
    /// currently holds the VPN.
    pub async fn vpn_replica(self: &Arc<Self>, vpn: &str, broadcast: bool) -> Result<(), Error> {
        self.stop_retries(vpn);

        if !self.replica_configured(vpn) {
            return Err(Error::NotReplica(vpn.to_string()));
        }

        let lock = self.locks.get(vpn)?;
        tracing::debug!(%vpn, "vpn_replica: locking");
        lock.acquire().await;

        self.stop_check_vpn_task(vpn);
        self.set_local_vpn_offline(vpn, true).await;

        let result = if self.store.online_peers_for(vpn).is_empty() {
            tracing::warn!(%vpn, "no peers Online, promoting instead of standing by");
            self.vpn_online(
                vpn,
                OnlineOptions {
                    broadcast,
                    take_lock: false,
                    retries: 0,
                },
            )
            .await
            .map(|_| ())
        } else {
            tracing::info!(%vpn, "setting status to Replica");
            self.set_status(vpn, VpnStatus::Replica, broadcast).await;
            Ok(())
        };

        self.release_lock(vpn, &lock);
        result
    }

    /// Recovery loop entered whenever a bring-up or health check fails.
    ///
    /// Always runs as its own supervised task; the lock acquired here is
    /// force-released by the supervisor when the task ends, and competing
    /// transitions cancel the task through `stop_retries` first.
    pub(crate) async fn failure_retry(self: Arc<Self>, vpn: String, broadcast: bool, retries: i32) {
        let lock = match self.locks.get(&vpn) {
            Ok(lock) => lock,
            Err(e) => {
                tracing::error!(%vpn, error = %e, "failure_retry on unknown VPN");
                return;
            }
        };
        lock.acquire().await;

        match self.store.local_vpn_status(&vpn) {
            Some(VpnStatus::Online | VpnStatus::Pending) => {}
            status => {
                tracing::debug!(%vpn, ?status, "failure_retry: aborting since VPN status changed");
                return;
            }
        }

        self.set_status(&vpn, VpnStatus::Pending, broadcast).await;

        // retry immediately only while no other site could take over; if a
        // peer already holds the VPN Replica or Online, fail over instead
        let peers_available = !self
            .store
            .sites_with_vpn_status(&vpn, &[VpnStatus::Replica, VpnStatus::Online])
            .is_empty();

        if !peers_available && retries != 0 {
            self.set_local_vpn_offline(&vpn, false).await;
            tracing::warn!(%vpn, retries, "bring-up failed but no peers in Replica or Online state, retrying");
            let retries = if retries > 0 { retries - 1 } else { retries };
            let opts = OnlineOptions {
                broadcast,
                take_lock: true,
                retries,
            };
            if let Err(e) = self.vpn_online(&vpn, opts).await {
                tracing::debug!(%vpn, error = %e, "retry attempt did not complete");
            }
        } else {
            self.set_status(&vpn, VpnStatus::Failed, broadcast).await;
            self.set_local_vpn_offline(&vpn, true).await;

            let timeout = self.local.failed_status_timeout;
            if timeout > 0 {
                // eventually clear Failed once some peer carries the VPN;
                // with a timeout of 0 the status sticks until cleared by hand
                loop {
                    tokio::time::sleep(Duration::from_secs(timeout)).await;
                    if self.store.local_vpn_status(&vpn) != Some(VpnStatus::Failed) {
                        return;
                    }
                    if self.store.any_peer_vpn_in(&vpn, VpnStatus::Online) {
                        self.set_status(&vpn, VpnStatus::Offline, true).await;
                        return;
                    }
                }
            }
        }
    }

    /// Replace the local VPN process while keeping status and anycast route
    /// untouched, so peers never observe the restart.
    pub async fn restart_vpn(self: &Arc<Self>, vpn: &str) -> Result<(), Error> {
        if self.store.local_vpn_status(vpn) != Some(VpnStatus::Online) {
            return Err(Error::NotOnline(vpn.to_string()));
        }

        let lock = self.locks.get(vpn)?;
        tracing::debug!(%vpn, "restart: locking");
        lock.acquire().await;

        self.set_local_vpn_offline(vpn, false).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        let ok = self.set_local_vpn_online(vpn).await;

        self.release_lock(vpn, &lock);

        if ok {
            tracing::debug!(%vpn, "restart completed, still Online");
            Ok(())
        } else {
            Err(Error::BringUpFailed(vpn.to_string()))
        }
    }

    /// Operator shutdown: stop every local VPN, mark them Offline, announce
    /// once, then withdraw the site and stop the daemon.
    pub async fn shutdown_site(self: &Arc<Self>) {
        tracing::info!("shutting down on operator request");

        for vpn in self.store.local_vpn_names() {
            self.stop_retries(&vpn);
            self.stop_check_vpn_task(&vpn);
            let lock = match self.locks.get(&vpn) {
                Ok(lock) => lock,
                Err(e) => {
                    tracing::error!(%vpn, error = %e, "missing lock during shutdown");
                    continue;
                }
            };
            lock.acquire().await;
            self.set_local_vpn_offline(&vpn, true).await;
            self.set_status(&vpn, VpnStatus::Offline, false).await;
            self.release_lock(&vpn, &lock);
        }

        self.broadcast_state().await;
        self.store.set_site_status(&self.site_id, SiteStatus::Offline);
        self.shutdown.cancel();
    }
}
