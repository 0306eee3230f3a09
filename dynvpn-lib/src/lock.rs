use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::task::current_task_name;

#[derive(Debug, Error)]
pub enum Error {
    #[error("task `{task}` does not hold the lock for `{vpn}` (held by {owner:?})")]
    NotOwner {
        vpn: String,
        task: String,
        owner: Option<String>,
    },
    #[error("no lock registered for VPN `{0}`")]
    UnknownVpn(String),
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub enum LockedState {
    Locked,
    Unlocked,
}

/// Snapshot of a lock for the debug endpoint.
#[derive(Clone, Debug, Serialize)]
pub struct LockStatus {
    pub status: LockedState,
    pub task: Option<String>,
}

impl LockStatus {
    pub fn locked(&self) -> bool {
        self.status == LockedState::Locked
    }
}

/// Mutex over one local VPN, re-entrant per task.
///
/// The owner is identified by its supervisor task name. Acquiring while
/// already owning is a no-op; a single release frees the lock regardless of
/// how often the owner re-entered. Waiters queue FIFO and ownership is handed
/// off directly on release.
#[derive(Debug)]
pub struct VpnLock {
    name: String,
    state: Mutex<LockState>,
}

#[derive(Debug, Default)]
struct LockState {
    owner: Option<String>,
    waiters: VecDeque<(String, oneshot::Sender<()>)>,
}

impl VpnLock {
    fn new(name: String) -> Self {
        VpnLock {
            name,
            state: Mutex::new(LockState::default()),
        }
    }

    pub async fn acquire(&self) {
        let task = current_task_name();
        let rx = {
            let mut state = self.state.lock().expect("lock state poisoned");
            match &state.owner {
                Some(owner) if *owner == task => {
                    tracing::trace!(vpn = %self.name, %task, "task already holds the lock");
                    return;
                }
                None => {
                    state.owner = Some(task);
                    return;
                }
                Some(_) => {
                    tracing::trace!(vpn = %self.name, %task, "waiting for lock");
                    let (tx, rx) = oneshot::channel();
                    state.waiters.push_back((task.clone(), tx));
                    rx
                }
            }
        };

        // the releasing side assigns ownership before signalling; an error
        // here means the lock was dropped, which only happens at shutdown
        let _ = rx.await;
        tracing::trace!(vpn = %self.name, %task, "lock acquired");
    }

    pub fn release(&self) -> Result<(), Error> {
        let task = current_task_name();
        let mut state = self.state.lock().expect("lock state poisoned");
        match &state.owner {
            Some(owner) if *owner == task => {
                Self::hand_off(&mut state);
                Ok(())
            }
            owner => Err(Error::NotOwner {
                vpn: self.name.clone(),
                task,
                owner: owner.clone(),
            }),
        }
    }

    /// Unconditionally release the lock if `task` owns it. Used by the task
    /// supervisor when reaping. Returns whether a release happened.
    pub fn force_release(&self, task: &str) -> bool {
        let mut state = self.state.lock().expect("lock state poisoned");
        if state.owner.as_deref() == Some(task) {
            Self::hand_off(&mut state);
            true
        } else {
            false
        }
    }

    fn hand_off(state: &mut LockState) {
        while let Some((next, tx)) = state.waiters.pop_front() {
            state.owner = Some(next);
            if tx.send(()).is_ok() {
                return;
            }
            // waiter gave up while queued, try the next one
        }
        state.owner = None;
    }

    pub fn status(&self) -> LockStatus {
        let state = self.state.lock().expect("lock state poisoned");
        LockStatus {
            status: if state.owner.is_some() {
                LockedState::Locked
            } else {
                LockedState::Unlocked
            },
            task: state.owner.clone(),
        }
    }
}

/// One lock per local VPN, created at configuration load.
pub struct LockRegistry {
    locks: HashMap<String, Arc<VpnLock>>,
}

impl LockRegistry {
    pub fn new(vpn_names: impl IntoIterator<Item = String>) -> Self {
        LockRegistry {
            locks: vpn_names
                .into_iter()
                .map(|name| (name.clone(), Arc::new(VpnLock::new(name))))
                .collect(),
        }
    }

    pub fn get(&self, vpn: &str) -> Result<Arc<VpnLock>, Error> {
        self.locks
            .get(vpn)
            .cloned()
            .ok_or_else(|| Error::UnknownVpn(vpn.to_string()))
    }

    /// Force-release every lock owned by `task`, returning the VPN names that
    /// were actually released.
    pub fn release_owned_by(&self, task: &str) -> Vec<String> {
        self.locks
            .iter()
            .filter(|(_, lock)| lock.force_release(task))
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn statuses(&self) -> BTreeMap<String, LockStatus> {
        self.locks
            .iter()
            .map(|(name, lock)| (name.clone(), lock.status()))
            .collect()
    }
}
