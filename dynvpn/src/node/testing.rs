use std::collections::BTreeMap;
use std::fs;
use std::net::Ipv4Addr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dynvpn_lib::config::{GlobalConfig, LocalConfig, SiteConfig};
use dynvpn_lib::status::{ReplicaMode, SiteStatus, VpnStatus};

use super::{Error, Node, OnlineOptions, PeerUpdate, Transition, startup};

pub(crate) const VPN: &str = "dynvpn1";
const ANYCAST: &str = "10.99.0.1";

fn write_script(dir: &Path, name: &str, body: &str) {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod script");
}

/// Three-site cluster `a`/`b`/`c` with one VPN, site `a` local, backed by
/// stub scripts in a temp dir. The route scripts leave a marker file so
/// tests can observe anycast route presence.
pub(crate) struct Fixture {
    pub node: Arc<Node>,
    scripts_dir: PathBuf,
    _dir: tempfile::TempDir,
}

impl Fixture {
    pub fn new(mode: ReplicaMode) -> Self {
        Self::with_priority(mode, &["a", "b", "c"])
    }

    pub fn with_priority(mode: ReplicaMode, priority: &[&str]) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let scripts_dir = dir.path().join("scripts");
        fs::create_dir_all(&scripts_dir).expect("scripts dir");
        fs::create_dir_all(dir.path().join("state")).expect("state dir");

        write_script(&scripts_dir, "check-pid.sh", "exit 1");
        write_script(&scripts_dir, "vpn-set-online.sh", "exit 0");
        write_script(&scripts_dir, "vpn-set-offline.sh", "exit 0");
        write_script(&scripts_dir, "vpn-check-online.sh", "exit 0");
        write_script(&scripts_dir, "add-vpn-route.sh", "touch \"$(dirname \"$0\")/route-$1\"");
        write_script(&scripts_dir, "delete-vpn-route.sh", "rm -f \"$(dirname \"$0\")/route-$1\"");

        let local = LocalConfig {
            site_id: "a".to_string(),
            script_path: scripts_dir.clone(),
            local_vpn_dir: dir.path().join("state"),
            replica_mode: mode,
            pull_interval: 1,
            pull_timeout: 1,
            pull_retries: 0,
            local_vpn_check_interval: 3600,
            local_vpn_check_timeout: 1,
            local_vpn_check_retries: 0,
            failed_status_timeout: 0,
            failure_retries: 0,
            default_timeout: 5,
            online_check_delay: 0,
        };

        let sites: BTreeMap<String, SiteConfig> = ["a", "b", "c"]
            .iter()
            .enumerate()
            .map(|(i, id)| {
                (
                    id.to_string(),
                    SiteConfig {
                        peer_addr: Ipv4Addr::new(127, 0, 0, 1),
                        peer_port: 59380 + i as u16,
                        gateway_addr: Ipv4Addr::new(10, 0, 0, 254),
                        vpn_local_addr_base: Ipv4Addr::new(10, 10, i as u8, 0),
                        vpn: vec![1],
                    },
                )
            })
            .collect();

        let global = GlobalConfig {
            vpn_anycast_addr_base: Ipv4Addr::new(10, 99, 0, 0),
            sites,
            replica_priority: BTreeMap::from([(
                VPN.to_string(),
                priority.iter().map(|s| s.to_string()).collect(),
            )]),
        };

        let node = Node::new("a".to_string(), local, global).expect("node builds from test config");
        Fixture {
            node,
            scripts_dir,
            _dir: dir,
        }
    }

    pub fn override_script(&self, name: &str, body: &str) {
        write_script(&self.scripts_dir, name, body);
    }

    pub fn override_default_timeout(&mut self, secs: u64) {
        // only valid before the node Arc has been handed to any task
        Arc::get_mut(&mut self.node).expect("node not shared yet").local.default_timeout = secs;
    }

    pub fn route_present(&self) -> bool {
        self.scripts_dir.join(format!("route-{ANYCAST}")).exists()
    }

    pub fn local_status(&self) -> Option<VpnStatus> {
        self.node.store.local_vpn_status(VPN)
    }

    pub fn site_status(&self, site: &str) -> Option<SiteStatus> {
        self.node.store.site_status(site)
    }

    pub fn seed_peer(&self, site: &str, site_status: SiteStatus, vpn_status: VpnStatus) {
        self.node.store.set_site_status(site, site_status);
        self.node.store.set_vpn_status(site, VPN, vpn_status);
    }

    /// Wait until every supervised task has been reaped.
    pub async fn quiesce(&self) {
        self.node.tasks.run().await;
    }
}

fn quiet() -> OnlineOptions {
    OnlineOptions {
        broadcast: false,
        take_lock: true,
        retries: 0,
    }
}

#[tokio::test]
async fn bring_up_sets_online_and_adds_the_anycast_route() -> anyhow::Result<()> {
    let f = Fixture::new(ReplicaMode::Auto);

    let result = f.node.vpn_online(VPN, quiet()).await?;
    assert!(result);
    assert_eq!(f.local_status(), Some(VpnStatus::Online));
    assert!(f.route_present());
    // exactly one health checker was started
    assert!(f.node.tasks.find(&format!("check-vpn_{VPN}")).is_some());
    Ok(())
}

#[tokio::test]
async fn bring_up_is_idempotent_when_already_online() -> anyhow::Result<()> {
    let f = Fixture::new(ReplicaMode::Auto);
    f.node.vpn_online(VPN, quiet()).await?;

    // a failing online script would now break a second bring-up attempt;
    // idempotence means it is never invoked again
    f.override_script("vpn-set-online.sh", "exit 1");
    let result = f.node.vpn_online(VPN, quiet()).await?;
    assert!(result);
    assert_eq!(f.local_status(), Some(VpnStatus::Online));
    Ok(())
}

#[tokio::test]
async fn bring_up_refuses_when_not_on_the_replica_list() -> anyhow::Result<()> {
    let f = Fixture::with_priority(ReplicaMode::Auto, &["b", "c"]);

    let result = f.node.vpn_online(VPN, quiet()).await;
    assert!(matches!(result, Err(Error::NotReplica(_))));
    assert_eq!(f.local_status(), Some(VpnStatus::Pending));
    assert!(!f.route_present());
    Ok(())
}

#[tokio::test]
async fn bring_up_adopts_a_surviving_process() -> anyhow::Result<()> {
    let f = Fixture::new(ReplicaMode::Auto);
    f.override_script("check-pid.sh", "exit 0");
    // bring-up must not be attempted against the live process
    f.override_script("vpn-set-online.sh", "exit 1");

    let result = f.node.vpn_online(VPN, quiet()).await?;
    assert!(result);
    assert_eq!(f.local_status(), Some(VpnStatus::Online));
    Ok(())
}

#[tokio::test]
async fn take_down_sets_offline_and_removes_the_route() -> anyhow::Result<()> {
    let f = Fixture::new(ReplicaMode::Auto);
    f.node.vpn_online(VPN, quiet()).await?;
    assert!(f.route_present());

    f.node.vpn_offline(VPN, false).await?;
    assert_eq!(f.local_status(), Some(VpnStatus::Offline));
    assert!(!f.route_present());
    assert!(f.node.tasks.find(&format!("check-vpn_{VPN}")).is_none());

    // taking an Offline VPN offline again is harmless
    f.node.vpn_offline(VPN, false).await?;
    assert_eq!(f.local_status(), Some(VpnStatus::Offline));
    f.quiesce().await;
    Ok(())
}

#[tokio::test]
async fn failed_bring_up_with_an_eligible_peer_ends_in_failed() -> anyhow::Result<()> {
    let f = Fixture::new(ReplicaMode::Auto);
    f.seed_peer("b", SiteStatus::Online, VpnStatus::Replica);
    f.override_script("vpn-set-online.sh", "exit 1");

    let result = f.node.vpn_online(VPN, quiet()).await?;
    assert!(!result);
    f.quiesce().await;

    assert_eq!(f.local_status(), Some(VpnStatus::Failed));
    assert!(!f.route_present());
    Ok(())
}

#[tokio::test]
async fn retry_loop_decrements_until_failed_when_no_peer_can_take_over() -> anyhow::Result<()> {
    let f = Fixture::new(ReplicaMode::Auto);
    f.override_script("vpn-set-online.sh", "exit 1");
    f.node.store.set_vpn_status("a", VPN, VpnStatus::Pending);

    // one retry available, no site anywhere in Replica or Online state
    f.node.clone().failure_retry(VPN.to_string(), false, 1).await;
    f.quiesce().await;

    assert_eq!(f.local_status(), Some(VpnStatus::Failed));
    assert!(!f.route_present());
    Ok(())
}

#[tokio::test]
async fn timed_out_bring_up_forces_failed() -> anyhow::Result<()> {
    let mut f = Fixture::new(ReplicaMode::Auto);
    f.override_default_timeout(1);
    f.override_script("vpn-set-online.sh", "sleep 3");

    let result = f.node.vpn_online(VPN, quiet()).await;
    assert!(matches!(result, Err(Error::Timeout(_))));
    assert_eq!(f.local_status(), Some(VpnStatus::Failed));
    assert!(!f.route_present());
    Ok(())
}

#[tokio::test]
async fn concurrent_admin_operations_serialize_on_the_vpn_lock() -> anyhow::Result<()> {
    let f = Fixture::new(ReplicaMode::Auto);
    // slow bring-up so the offline request arrives mid-transition
    f.override_script("vpn-set-online.sh", "sleep 1");

    let online = {
        let node = f.node.clone();
        let fut = {
            let node = node.clone();
            async move { node.vpn_online(VPN, quiet()).await }
        };
        async move { node.admin_task("set_online(dynvpn1)", fut).await }
    };
    let offline = {
        let node = f.node.clone();
        let fut = {
            let node = node.clone();
            async move { node.vpn_offline(VPN, false).await }
        };
        async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            node.admin_task("set_offline(dynvpn1)", fut).await
        }
    };

    let (online_res, offline_res) = tokio::join!(online, offline);
    assert!(matches!(online_res, Some(Ok(true))));
    assert!(matches!(offline_res, Some(Ok(()))));

    // the offline request queued behind the in-flight bring-up and held the
    // lock last, so its status wins
    assert_eq!(f.local_status(), Some(VpnStatus::Offline));
    assert!(!f.route_present());
    f.quiesce().await;
    Ok(())
}

#[tokio::test]
async fn peer_going_online_demotes_us_to_replica_in_auto_mode() -> anyhow::Result<()> {
    let f = Fixture::new(ReplicaMode::Auto);
    f.node.vpn_online(VPN, quiet()).await?;
    f.seed_peer("b", SiteStatus::Online, VpnStatus::Online);

    f.node
        .handle_transition(Transition {
            site_id: "b".to_string(),
            vpn: VPN.to_string(),
            status: VpnStatus::Online,
            previous: VpnStatus::Pending,
        })
        .await;

    assert_eq!(f.local_status(), Some(VpnStatus::Replica));
    assert!(!f.route_present());
    f.quiesce().await;
    Ok(())
}

#[tokio::test]
async fn peer_going_online_demotes_us_to_offline_in_manual_mode() -> anyhow::Result<()> {
    let f = Fixture::new(ReplicaMode::Manual);
    f.node.vpn_online(VPN, quiet()).await?;
    f.seed_peer("b", SiteStatus::Online, VpnStatus::Online);

    f.node
        .handle_transition(Transition {
            site_id: "b".to_string(),
            vpn: VPN.to_string(),
            status: VpnStatus::Online,
            previous: VpnStatus::Pending,
        })
        .await;

    assert_eq!(f.local_status(), Some(VpnStatus::Offline));
    f.quiesce().await;
    Ok(())
}

#[tokio::test]
async fn replica_takes_over_when_its_predecessor_goes_offline() -> anyhow::Result<()> {
    let f = Fixture::with_priority(ReplicaMode::Auto, &["b", "a", "c"]);
    f.node.store.set_vpn_status("a", VPN, VpnStatus::Replica);
    f.seed_peer("b", SiteStatus::Online, VpnStatus::Offline);
    f.seed_peer("c", SiteStatus::Online, VpnStatus::Replica);

    f.node
        .handle_transition(Transition {
            site_id: "b".to_string(),
            vpn: VPN.to_string(),
            status: VpnStatus::Offline,
            previous: VpnStatus::Online,
        })
        .await;

    assert_eq!(f.local_status(), Some(VpnStatus::Online));
    assert!(f.route_present());
    Ok(())
}

#[tokio::test]
async fn replica_defers_to_a_closer_live_replica() -> anyhow::Result<()> {
    // priority a, b, c with b failing: c is b's direct successor, not us
    let f = Fixture::with_priority(ReplicaMode::Auto, &["b", "c", "a"]);
    f.node.store.set_vpn_status("a", VPN, VpnStatus::Replica);
    f.seed_peer("b", SiteStatus::Online, VpnStatus::Offline);
    f.seed_peer("c", SiteStatus::Online, VpnStatus::Replica);

    f.node
        .handle_transition(Transition {
            site_id: "b".to_string(),
            vpn: VPN.to_string(),
            status: VpnStatus::Offline,
            previous: VpnStatus::Online,
        })
        .await;

    assert_eq!(f.local_status(), Some(VpnStatus::Replica));
    assert!(!f.route_present());
    Ok(())
}

#[tokio::test]
async fn first_replica_takes_over_from_the_last_site_by_wrap_around() -> anyhow::Result<()> {
    let f = Fixture::with_priority(ReplicaMode::Auto, &["a", "c", "b"]);
    f.node.store.set_vpn_status("a", VPN, VpnStatus::Replica);
    f.seed_peer("b", SiteStatus::Online, VpnStatus::Offline);

    f.node
        .handle_transition(Transition {
            site_id: "b".to_string(),
            vpn: VPN.to_string(),
            status: VpnStatus::Offline,
            previous: VpnStatus::Online,
        })
        .await;

    assert_eq!(f.local_status(), Some(VpnStatus::Online));
    Ok(())
}

#[tokio::test]
async fn standby_request_promotes_when_no_peer_is_online() -> anyhow::Result<()> {
    let f = Fixture::new(ReplicaMode::Auto);

    f.node.vpn_replica(VPN, false).await?;
    assert_eq!(f.local_status(), Some(VpnStatus::Online));
    f.node.abort_tasks();
    f.quiesce().await;
    Ok(())
}

#[tokio::test]
async fn standby_request_yields_replica_while_a_peer_is_online() -> anyhow::Result<()> {
    let f = Fixture::new(ReplicaMode::Auto);
    f.seed_peer("c", SiteStatus::Online, VpnStatus::Online);

    f.node.vpn_replica(VPN, false).await?;
    assert_eq!(f.local_status(), Some(VpnStatus::Replica));
    Ok(())
}

#[tokio::test]
async fn standby_request_is_refused_off_the_priority_list() -> anyhow::Result<()> {
    let f = Fixture::with_priority(ReplicaMode::Auto, &["b", "c"]);
    let result = f.node.vpn_replica(VPN, false).await;
    assert!(matches!(result, Err(Error::NotReplica(_))));
    Ok(())
}

#[tokio::test]
async fn restart_replaces_the_process_without_touching_status_or_route() -> anyhow::Result<()> {
    let f = Fixture::new(ReplicaMode::Auto);
    f.node.vpn_online(VPN, quiet()).await?;

    f.node.restart_vpn(VPN).await?;
    assert_eq!(f.local_status(), Some(VpnStatus::Online));
    assert!(f.route_present());

    f.node.vpn_offline(VPN, false).await?;
    assert!(matches!(f.node.restart_vpn(VPN).await, Err(Error::NotOnline(_))));
    f.quiesce().await;
    Ok(())
}

#[tokio::test]
async fn peer_updates_mutate_the_store_but_never_the_local_site() -> anyhow::Result<()> {
    let f = Fixture::new(ReplicaMode::Auto);

    f.node.handle_peer_update(PeerUpdate {
        site_id: "b".to_string(),
        vpn: VPN.to_string(),
        status: VpnStatus::Online,
    });
    assert_eq!(f.node.store.vpn_status("b", VPN), Some(VpnStatus::Online));

    f.node.handle_peer_update(PeerUpdate {
        site_id: "a".to_string(),
        vpn: VPN.to_string(),
        status: VpnStatus::Offline,
    });
    assert_eq!(f.local_status(), Some(VpnStatus::Pending));
    Ok(())
}

#[tokio::test]
async fn startup_brings_the_highest_priority_site_online() -> anyhow::Result<()> {
    let f = Fixture::new(ReplicaMode::Auto);

    startup::run(f.node.clone()).await;

    assert_eq!(f.local_status(), Some(VpnStatus::Online));
    assert!(f.route_present());
    // the unreachable peers were marked Offline during phase 2
    assert_eq!(f.node.store.site_status("b"), Some(SiteStatus::Offline));
    assert_eq!(f.node.store.site_status("c"), Some(SiteStatus::Offline));

    f.node.abort_tasks();
    f.quiesce().await;
    Ok(())
}

#[tokio::test]
async fn startup_stands_down_when_a_peer_already_owns_the_vpn() -> anyhow::Result<()> {
    let f = Fixture::new(ReplicaMode::Auto);
    f.seed_peer("b", SiteStatus::Online, VpnStatus::Online);

    startup::run(f.node.clone()).await;

    assert_eq!(f.local_status(), Some(VpnStatus::Replica));
    assert!(!f.route_present());

    f.node.abort_tasks();
    f.quiesce().await;
    Ok(())
}

#[tokio::test]
async fn shutdown_stops_everything_and_withdraws_the_site() -> anyhow::Result<()> {
    let f = Fixture::new(ReplicaMode::Auto);
    f.node.vpn_online(VPN, quiet()).await?;

    f.node.shutdown_site().await;

    assert_eq!(f.local_status(), Some(VpnStatus::Offline));
    assert!(!f.route_present());
    assert_eq!(f.node.store.site_status("a"), Some(SiteStatus::Offline));
    assert!(f.node.shutdown_token().is_cancelled());
    f.quiesce().await;
    Ok(())
}
