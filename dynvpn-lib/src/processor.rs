use tokio::sync::Notify;

use std::future::Future;
use std::sync::{Arc, Mutex};

/// Single-consumer work queue with pause/resume and discard modes.
///
/// Items enqueued while inactive are held until `activate`; while `discard`
/// is set, `add` silently drops. The consumer pops LIFO and hands each item
/// to its handler, which is expected to absorb its own errors.
#[derive(Clone)]
pub struct EventProcessor<T> {
    name: &'static str,
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    state: Mutex<QueueState<T>>,
    pending: Notify,
}

struct QueueState<T> {
    items: Vec<T>,
    active: bool,
    discard: bool,
}

impl<T: Send + 'static> EventProcessor<T> {
    pub fn new(name: &'static str) -> Self {
        EventProcessor {
            name,
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    items: Vec::new(),
                    active: false,
                    discard: false,
                }),
                pending: Notify::new(),
            }),
        }
    }

    pub fn add(&self, item: T) {
        let mut state = self.shared.state.lock().expect("processor state poisoned");
        if state.discard {
            return;
        }
        state.items.push(item);
        if state.active {
            self.shared.pending.notify_one();
        }
    }

    pub fn activate(&self) {
        let mut state = self.shared.state.lock().expect("processor state poisoned");
        state.active = true;
        tracing::debug!(processor = self.name, "processor activated");
        if !state.items.is_empty() {
            self.shared.pending.notify_one();
        }
    }

    pub fn deactivate(&self) {
        let mut state = self.shared.state.lock().expect("processor state poisoned");
        state.active = false;
    }

    pub fn set_discard(&self, discard: bool) {
        let mut state = self.shared.state.lock().expect("processor state poisoned");
        state.discard = discard;
    }

    fn pop(&self) -> Option<T> {
        let mut state = self.shared.state.lock().expect("processor state poisoned");
        if state.active { state.items.pop() } else { None }
    }

    /// Consumer loop; never returns. Run exactly once per processor.
    pub async fn run<F, Fut>(&self, mut handler: F)
    where
        F: FnMut(T) -> Fut,
        Fut: Future<Output = ()>,
    {
        loop {
            while let Some(item) = self.pop() {
                handler(item).await;
            }
            self.shared.pending.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    fn collector() -> (EventProcessor<u32>, Arc<Mutex<Vec<u32>>>) {
        (EventProcessor::new("test"), Arc::new(Mutex::new(Vec::new())))
    }

    #[tokio::test]
    async fn items_are_held_until_activation_then_popped_lifo() -> anyhow::Result<()> {
        let (proc, seen) = collector();
        proc.add(1);
        proc.add(2);
        proc.add(3);

        let consumer = proc.clone();
        let sink = seen.clone();
        tokio::spawn(async move {
            consumer
                .run(|item| {
                    let sink = sink.clone();
                    async move { sink.lock().unwrap().push(item) }
                })
                .await;
        });

        settle().await;
        assert!(seen.lock().unwrap().is_empty());

        proc.activate();
        settle().await;
        assert_eq!(seen.lock().unwrap().clone(), vec![3, 2, 1]);
        Ok(())
    }

    #[tokio::test]
    async fn discard_drops_new_items() -> anyhow::Result<()> {
        let (proc, seen) = collector();
        proc.activate();
        proc.set_discard(true);
        proc.add(1);
        proc.set_discard(false);
        proc.add(2);

        let consumer = proc.clone();
        let sink = seen.clone();
        tokio::spawn(async move {
            consumer
                .run(|item| {
                    let sink = sink.clone();
                    async move { sink.lock().unwrap().push(item) }
                })
                .await;
        });

        settle().await;
        assert_eq!(seen.lock().unwrap().clone(), vec![2]);
        Ok(())
    }

    #[tokio::test]
    async fn deactivate_pauses_consumption() -> anyhow::Result<()> {
        let (proc, seen) = collector();
        proc.activate();

        let consumer = proc.clone();
        let sink = seen.clone();
        tokio::spawn(async move {
            consumer
                .run(|item| {
                    let sink = sink.clone();
                    async move { sink.lock().unwrap().push(item) }
                })
                .await;
        });

        proc.add(1);
        settle().await;
        proc.deactivate();
        proc.add(2);
        settle().await;
        assert_eq!(seen.lock().unwrap().clone(), vec![1]);

        proc.activate();
        settle().await;
        assert_eq!(seen.lock().unwrap().clone(), vec![1, 2]);
        Ok(())
    }
}
