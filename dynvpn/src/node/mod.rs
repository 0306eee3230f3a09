use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use dynvpn_lib::command::ScriptRunner;
use dynvpn_lib::config::{GlobalConfig, LocalConfig};
use dynvpn_lib::lock::{self, LockRegistry, LockStatus};
use dynvpn_lib::log_output;
use dynvpn_lib::processor::EventProcessor;
use dynvpn_lib::state::{StateDocument, Store};
use dynvpn_lib::status::{ReplicaMode, VpnStatus};
use dynvpn_lib::task::TaskSupervisor;
use dynvpn_lib::{config, state};

use crate::http;
use crate::peer::PeerClient;

mod gossip;
mod local_vpn;
mod policy;
mod startup;
mod transitions;

pub use transitions::OnlineOptions;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Lock(#[from] lock::Error),
    #[error("bring-up of `{0}` timed out")]
    Timeout(String),
    #[error("site is not configured as a replica for `{0}`")]
    NotReplica(String),
    #[error("VPN `{0}` is not online")]
    NotOnline(String),
    #[error("bring-up of `{0}` failed")]
    BringUpFailed(String),
}

/// A peer's report about one VPN, as received over the wire.
#[derive(Clone, Debug, Serialize)]
pub struct PeerUpdate {
    pub site_id: String,
    pub vpn: String,
    pub status: VpnStatus,
}

/// A deduplicated status change on a peer VPN, forwarded to the policy
/// processor together with the previously stored status.
#[derive(Clone, Debug, Serialize)]
pub struct Transition {
    pub site_id: String,
    pub vpn: String,
    pub status: VpnStatus,
    pub previous: VpnStatus,
}

impl Display for PeerUpdate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = log_output::serialize(self);
        write!(f, "{s}")
    }
}

impl Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = log_output::serialize(self);
        write!(f, "{s}")
    }
}

#[derive(Debug, Serialize)]
pub struct DebugState {
    pub uptime: String,
    pub tasks: Vec<String>,
    pub locks: BTreeMap<String, LockStatus>,
}

/// The per-site coordinator.
///
/// Owns the state store, the per-VPN locks, the task supervisor and the two
/// chained event processors. All mutations of local VPNs run under the
/// per-VPN lock; peer-driven policy runs on the single-consumer transition
/// processor.
pub struct Node {
    site_id: String,
    local: LocalConfig,
    replica_priority: BTreeMap<String, Vec<String>>,
    store: Store,
    locks: Arc<LockRegistry>,
    tasks: TaskSupervisor,
    peer_updates: EventProcessor<PeerUpdate>,
    transitions: EventProcessor<Transition>,
    scripts: ScriptRunner,
    peers: PeerClient,
    shutdown: CancellationToken,
    started_at: SystemTime,
    admin_seq: AtomicU64,
}

impl Node {
    pub fn new(site_id: String, local: LocalConfig, global: GlobalConfig) -> Result<Arc<Node>, config::Error> {
        if local.site_id != site_id {
            tracing::warn!(
                cli = %site_id,
                config = %local.site_id,
                "site id from the command line differs from local.yml, using the command line value"
            );
        }

        let sites = config::build_sites(&site_id, &local, &global)?;
        let local_vpns: Vec<String> = sites
            .get(&site_id)
            .map(|s| s.vpn.keys().cloned().collect())
            .unwrap_or_default();

        let locks = Arc::new(LockRegistry::new(local_vpns));
        let tasks = TaskSupervisor::new(locks.clone());
        let scripts = ScriptRunner::new(local.script_path.clone(), local.local_vpn_dir.clone());
        let store = Store::new(site_id.clone(), sites, local.replica_mode);

        Ok(Arc::new(Node {
            site_id,
            replica_priority: global.replica_priority,
            store,
            locks,
            tasks,
            peer_updates: EventProcessor::new("peer-vpn-status-first"),
            transitions: EventProcessor::new("peer-vpn-status-second"),
            scripts,
            peers: PeerClient::new(),
            local,
            shutdown: CancellationToken::new(),
            started_at: SystemTime::now(),
            admin_seq: AtomicU64::new(0),
        }))
    }

    /// Bind the control server and launch the background machinery: the two
    /// processor consumers and the startup task. Returns once everything is
    /// spawned; the startup task finishes initialization on its own.
    pub async fn start(self: &Arc<Self>) -> Result<(), std::io::Error> {
        let site = self
            .store
            .site(&self.site_id)
            .expect("local site validated at configuration load");
        let bind_addr = SocketAddr::from((site.peer_addr, site.peer_port));
        let listener = tokio::net::TcpListener::bind(bind_addr).await?;
        tracing::info!(addr = %bind_addr, "control server listening");

        let node = self.clone();
        self.tasks
            .add("http-server", async move { http::serve(node, listener).await });

        let node = self.clone();
        self.tasks.add("peer-vpn-status-first", async move {
            let handler_node = node.clone();
            node.peer_updates
                .run(move |update| {
                    let node = handler_node.clone();
                    async move { node.handle_peer_update(update) }
                })
                .await
        });

        let node = self.clone();
        self.tasks.add("peer-vpn-status-second", async move {
            let handler_node = node.clone();
            node.transitions
                .run(move |transition| {
                    let node = handler_node.clone();
                    async move { node.handle_transition(transition).await }
                })
                .await
        });

        // peer state may arrive during startup and must land in the store,
        // but no policy runs until initialization released the locks
        self.peer_updates.activate();
        self.transitions.set_discard(true);

        let node = self.clone();
        self.tasks.add("start", async move { startup::run(node).await });

        Ok(())
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn replica_mode(&self) -> ReplicaMode {
        self.store.replica_mode()
    }

    pub fn set_replica_mode(&self, mode: ReplicaMode) {
        tracing::info!(%mode, "switching replica mode");
        self.store.set_replica_mode(mode);
    }

    pub fn encode_state(&self) -> StateDocument {
        self.store.encode()
    }

    pub fn debug_state(&self) -> DebugState {
        DebugState {
            uptime: log_output::elapsed(&self.started_at),
            tasks: self.tasks.names(),
            locks: self.locks.statuses(),
        }
    }

    /// Run a mutating control operation as its own supervised task.
    ///
    /// Per-VPN locks key their owner on the supervisor task name, so every
    /// admin request needs a unique identity: otherwise two concurrent
    /// operator calls would alias each other and re-enter the same lock
    /// instead of queueing. Supervision also means the reaper force-releases
    /// the lock if the operation dies mid-transition. `None` means the task
    /// ended without producing a result (aborted or panicked).
    pub(crate) async fn admin_task<T, Fut>(&self, what: &str, fut: Fut) -> Option<T>
    where
        T: Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let seq = self.admin_seq.fetch_add(1, Ordering::Relaxed);
        let name = format!("admin-{what}#{seq}");
        let (tx, rx) = oneshot::channel();
        self.tasks.add(&name, async move {
            let _ = tx.send(fut.await);
        });
        match rx.await {
            Ok(result) => Some(result),
            Err(_) => {
                tracing::error!(task = %name, "admin operation died before completing");
                None
            }
        }
    }

    /// Fire-and-forget variant of the operator shutdown, for signal handling.
    pub fn begin_shutdown(self: &Arc<Self>) {
        let seq = self.admin_seq.fetch_add(1, Ordering::Relaxed);
        let node = self.clone();
        self.tasks
            .add(&format!("admin-shutdown#{seq}"), async move { node.shutdown_site().await });
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn abort_tasks(&self) {
        self.tasks.abort_all();
    }

    pub fn pretty_state(&self) -> String {
        state::encode_pretty(&self.encode_state())
    }

    pub fn pretty_debug_state(&self) -> String {
        state::encode_pretty(&self.debug_state())
    }
}

#[cfg(test)]
pub(crate) mod testing;
