use std::{collections::HashMap, future::Future, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::OnceCell;

type CallMap<T> = Mutex<HashMap<String, Arc<OnceCell<T>>>>;

/// Collapses concurrent calls for the same key into one execution.
///
/// Every caller that joins while a call is running gets a clone of its
/// outcome, failures included. The slot is dropped as soon as the call
/// finishes, so nothing outlives the in-flight window. If the running caller
/// is cancelled, one of the waiters picks the call up.
pub struct InFlight<T> {
    calls: CallMap<T>,
}

impl<T> Default for InFlight<T> {
    fn default() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Clone> InFlight<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn run<F, Fut>(&self, key: &str, call: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let slot = Arc::clone(self.calls.lock().entry(key.to_string()).or_default());
        let leave = Leave {
            calls: &self.calls,
            key,
            slot,
        };
        leave.slot.get_or_init(call).await.clone()
    }
}

/// Drops the map slot once its call has an outcome, or once the last caller
/// interested in an unfinished call goes away.
struct Leave<'a, T> {
    calls: &'a CallMap<T>,
    key: &'a str,
    slot: Arc<OnceCell<T>>,
}

impl<T> Drop for Leave<'_, T> {
    fn drop(&mut self) {
        let mut calls = self.calls.lock();
        let Some(current) = calls.get(self.key) else {
            return;
        };
        // The map and this guard are the only references: nobody else waits.
        if Arc::ptr_eq(current, &self.slot)
            && (self.slot.initialized() || Arc::strong_count(&self.slot) == 2)
        {
            calls.remove(self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    async fn spawn_callers<T: Clone + Send + Sync + 'static>(
        inflight: &Arc<InFlight<T>>,
        calls: &Arc<AtomicUsize>,
        count: usize,
        outcome: T,
    ) -> Vec<T> {
        let tasks: Vec<_> = (0..count)
            .map(|_| {
                let inflight = Arc::clone(inflight);
                let calls = Arc::clone(calls);
                let outcome = outcome.clone();
                tokio::spawn(async move {
                    inflight
                        .run("lodash", || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            outcome
                        })
                        .await
                })
            })
            .collect();

        let mut outcomes = Vec::new();
        for task in tasks {
            outcomes.push(task.await.unwrap());
        }
        outcomes
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_call() {
        let inflight = Arc::new(InFlight::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let outcomes = spawn_callers(&inflight, &calls, 8, 42u32).await;

        assert_eq!(outcomes, vec![42; 8]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(inflight.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn failures_are_shared_too() {
        let inflight = Arc::new(InFlight::<Result<u32, Arc<String>>>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let outcomes =
            spawn_callers(&inflight, &calls, 8, Err(Arc::new("timed out".to_string()))).await;

        assert!(outcomes.iter().all(|outcome| outcome.is_err()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn finished_call_is_not_remembered() {
        let inflight = InFlight::new();
        let calls = AtomicUsize::new(0);
        let counter = &calls;

        for _ in 0..3 {
            inflight
                .run("lodash", || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(inflight.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn different_keys_run_independently() {
        let inflight = InFlight::new();
        let first = inflight.run("react", || async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            1
        });
        let second = inflight.run("vue", || async { 2 });
        assert_eq!(tokio::join!(first, second), (1, 2));
    }

    #[tokio::test]
    async fn cancelled_caller_hands_over() {
        let inflight = Arc::new(InFlight::new());

        let abandoned = {
            let inflight = Arc::clone(&inflight);
            tokio::spawn(async move {
                inflight
                    .run("pkg", || async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        "never"
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        abandoned.abort();
        assert!(abandoned.await.unwrap_err().is_cancelled());
        assert!(inflight.calls.lock().is_empty());

        assert_eq!(inflight.run("pkg", || async { "fresh" }).await, "fresh");
    }
}
