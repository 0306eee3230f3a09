use tokio::sync::Notify;
use tokio::task::{AbortHandle, JoinHandle};

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use crate::lock::LockRegistry;

tokio::task_local! {
    static TASK_NAME: String;
}

/// Name of the supervised task driving the current future, or `main` when
/// running outside the supervisor (startup, tests).
pub fn current_task_name() -> String {
    TASK_NAME
        .try_with(|name| name.clone())
        .unwrap_or_else(|_| "main".to_string())
}

/// Launches named background tasks and reaps them on exit.
///
/// Every task gets a companion reaper that awaits completion, logs panics and
/// cancellations, removes the bookkeeping entry and force-releases any VPN
/// locks still owned by the dead task.
#[derive(Clone)]
pub struct TaskSupervisor {
    inner: Arc<Inner>,
}

struct Inner {
    tasks: Mutex<TaskSet>,
    reaped: Notify,
    locks: Arc<LockRegistry>,
}

// the name list is kept alongside the map so callers can iterate a stable
// snapshot while tasks are being added and reaped
#[derive(Default)]
struct TaskSet {
    handles: HashMap<String, AbortHandle>,
    names: Vec<String>,
}

impl TaskSupervisor {
    pub fn new(locks: Arc<LockRegistry>) -> Self {
        TaskSupervisor {
            inner: Arc::new(Inner {
                tasks: Mutex::new(TaskSet::default()),
                reaped: Notify::new(),
                locks,
            }),
        }
    }

    /// Spawn `fut` as a named task and track it until the reaper collects it.
    /// Returns the reaper handle, which resolves once the task has been
    /// fully unregistered.
    pub fn add<F>(&self, name: &str, fut: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(TASK_NAME.scope(name.to_string(), fut));

        {
            let mut set = self.inner.tasks.lock().expect("task set poisoned");
            if set.handles.insert(name.to_string(), handle.abort_handle()).is_some() {
                tracing::warn!(task = %name, "replacing task registered under the same name");
            } else {
                set.names.push(name.to_string());
            }
        }

        let sup = self.clone();
        let task_name = name.to_string();
        tokio::spawn(async move { sup.reap(task_name, handle).await })
    }

    async fn reap(&self, name: String, handle: JoinHandle<()>) {
        match handle.await {
            Ok(()) => tracing::debug!(task = %name, "task ended"),
            Err(e) if e.is_cancelled() => tracing::info!(task = %name, "task was cancelled"),
            Err(e) => tracing::error!(task = %name, error = %e, "task panicked"),
        }

        {
            let mut set = self.inner.tasks.lock().expect("task set poisoned");
            set.handles.remove(&name);
            set.names.retain(|n| n != &name);
        }

        for vpn in self.inner.locks.release_owned_by(&name) {
            tracing::warn!(task = %name, %vpn, "force released lock held by finished task");
        }

        self.inner.reaped.notify_waiters();
    }

    pub fn find(&self, name: &str) -> Option<AbortHandle> {
        let set = self.inner.tasks.lock().expect("task set poisoned");
        set.handles.get(name).cloned()
    }

    /// Request cancellation of the named task. Returns whether it was found.
    pub fn cancel(&self, name: &str) -> bool {
        match self.find(name) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn names(&self) -> Vec<String> {
        let set = self.inner.tasks.lock().expect("task set poisoned");
        set.names.clone()
    }

    pub fn is_empty(&self) -> bool {
        let set = self.inner.tasks.lock().expect("task set poisoned");
        set.handles.is_empty()
    }

    pub fn abort_all(&self) {
        let set = self.inner.tasks.lock().expect("task set poisoned");
        for handle in set.handles.values() {
            handle.abort();
        }
    }

    /// Block until the task set drains.
    pub async fn run(&self) {
        loop {
            let notified = self.inner.reaped.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Spawn one task per item and await all of them, naming each child
    /// `{name}:{item}`.
    pub async fn spawn_for_each<F, Fut>(&self, items: &[String], name: &str, f: F)
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut reapers = Vec::with_capacity(items.len());
        for item in items {
            let child = format!("{name}:{item}");
            reapers.push(self.add(&child, f(item.clone())));
        }
        for reaper in reapers {
            let _ = reaper.await;
        }
    }
}
