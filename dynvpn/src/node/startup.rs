use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dynvpn_lib::status::{ReplicaMode, VpnStatus};

use super::{Node, OnlineOptions};

type PreOnline = Arc<Mutex<HashSet<String>>>;

/// Staged initialization, run as the supervised `start` task.
///
/// All local VPN locks are held by this task from before phase 1 until after
/// the final sweep, so neither admin calls nor peer policy can touch a VPN
/// mid-initialization. The first event processor is already live, so peer
/// state pulled in phase 2 lands in the store without triggering actions.
pub(super) async fn run(node: Arc<Node>) {
    let local_vpns = node.store.local_vpn_names();
    let tasks = node.tasks.clone();

    for vpn in &local_vpns {
        match node.locks.get(vpn) {
            Ok(lock) => lock.acquire().await,
            Err(e) => tracing::error!(%vpn, error = %e, "missing lock at startup"),
        }
    }

    let pre_online: PreOnline = Arc::new(Mutex::new(HashSet::new()));

    // phase 1: adopt or kill processes that survived a coordinator crash
    {
        let node = node.clone();
        let pre_online = pre_online.clone();
        tasks
            .spawn_for_each(&local_vpns, "start-phase1", move |vpn| {
                phase1(node.clone(), pre_online.clone(), vpn)
            })
            .await;
    }

    // phase 2: learn the cluster state before taking any action
    for site_id in node.store.remote_site_ids() {
        node.pull_state(&site_id).await;
    }

    // phase 3: decide the fate of connections found alive in phase 1
    {
        let node = node.clone();
        let pre_online = pre_online.clone();
        tasks
            .spawn_for_each(&local_vpns, "start-phase3", move |vpn| {
                phase3(node.clone(), pre_online.clone(), vpn)
            })
            .await;
    }

    // phase 4: bring up whatever is still Pending and unclaimed
    {
        let node = node.clone();
        tasks
            .spawn_for_each(&local_vpns, "start-phase4", move |vpn| phase4(node.clone(), vpn))
            .await;
    }

    // final sweep: everything left over becomes a replica (or stays out)
    {
        let node = node.clone();
        tasks
            .spawn_for_each(&local_vpns, "start-sweep", move |vpn| sweep(node.clone(), vpn))
            .await;
    }

    tokio::time::sleep(Duration::from_secs(1)).await;

    for vpn in &local_vpns {
        if let Ok(lock) = node.locks.get(vpn) {
            if let Err(e) = lock.release() {
                tracing::error!(%vpn, error = %e, "failed releasing startup lock");
            }
        }
    }

    node.transitions.activate();
    node.transitions.set_discard(false);

    for site_id in node.store.remote_site_ids() {
        let node = node.clone();
        let id = site_id.clone();
        tasks.add(&format!("{site_id}_pull-state"), async move {
            node.pull_state_loop(id).await
        });
    }

    tracing::info!("startup complete");
}

async fn phase1(node: Arc<Node>, pre_online: PreOnline, vpn: String) {
    if !node.check_local_vpn_process(&vpn).await {
        return;
    }
    tracing::info!(%vpn, "process exists at startup, checking connectivity");
    if node.check_local_vpn_connectivity(&vpn).await {
        tracing::info!(%vpn, "connectivity check succeeded");
        pre_online.lock().expect("pre-online set poisoned").insert(vpn);
    } else {
        tracing::info!(%vpn, "connectivity check failed, killing stale process");
        node.set_local_vpn_offline(&vpn, true).await;
    }
}

/// VPNs found alive keep running unless some peer already owns them; ties
/// from a startup race resolve later through online arbitration.
async fn phase3(node: Arc<Node>, pre_online: PreOnline, vpn: String) {
    if !pre_online.lock().expect("pre-online set poisoned").remove(&vpn) {
        return;
    }

    if !node.store.any_peer_vpn_in(&vpn, VpnStatus::Online) {
        tracing::info!(%vpn, "no other replicas online, maintaining Online state");
        let opts = OnlineOptions {
            broadcast: false,
            take_lock: false,
            retries: 0,
        };
        if let Err(e) = node.vpn_online(&vpn, opts).await {
            tracing::warn!(%vpn, error = %e, "failed keeping surviving VPN online");
        }
    } else {
        let target = standby_status(&node);
        tracing::info!(%vpn, status = %target, "peer is online, taking ours offline");
        node.set_status(&vpn, target, false).await;
        node.set_local_vpn_offline(&vpn, true).await;
    }
}

async fn phase4(node: Arc<Node>, vpn: String) {
    if node.store.local_vpn_status(&vpn) != Some(VpnStatus::Pending) {
        return;
    }

    let priority = node.replica_priority.get(&vpn);
    if priority.is_none() {
        tracing::warn!(%vpn, "present in local VPN list but not in the priority list");
    }

    if !node.store.any_peer_vpn_in(&vpn, VpnStatus::Online) {
        // only the highest-priority site brings a VPN online at startup
        if priority.and_then(|p| p.first()).map(String::as_str) == Some(node.site_id()) {
            tracing::info!(%vpn, "first in priority list with no peers Online, setting online");
            // no broadcast: peers learn of it when they pull from us
            let opts = OnlineOptions {
                broadcast: false,
                take_lock: false,
                retries: 0,
            };
            if let Err(e) = node.vpn_online(&vpn, opts).await {
                tracing::warn!(%vpn, error = %e, "startup bring-up failed");
            }
        }
    } else {
        if node.check_local_vpn_connectivity(&vpn).await || node.check_local_vpn_process(&vpn).await {
            tracing::info!(%vpn, "peer is already online, stopping our connection");
            node.set_local_vpn_offline(&vpn, true).await;
        }
        node.set_status(&vpn, standby_status(&node), false).await;
    }
}

async fn sweep(node: Arc<Node>, vpn: String) {
    match node.store.replica_mode() {
        ReplicaMode::Auto => {
            if matches!(
                node.store.local_vpn_status(&vpn),
                Some(VpnStatus::Offline | VpnStatus::Pending)
            ) {
                node.set_status(&vpn, VpnStatus::Replica, false).await;
            }
        }
        _ => {
            if node.store.local_vpn_status(&vpn) == Some(VpnStatus::Pending) {
                node.set_status(&vpn, VpnStatus::Offline, false).await;
            }
        }
    }
}

fn standby_status(node: &Node) -> VpnStatus {
    match node.store.replica_mode() {
        ReplicaMode::Auto => VpnStatus::Replica,
        _ => VpnStatus::Offline,
    }
}
