//! Do-once, share-the-result primitive
//!
//! Work runs on its own task, so it completes even when every caller has
//! gone away. The key is removed when the work settles, panics included.

use crate::error::{PreviewError, PreviewResult};
use crate::state::lock;
use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

type Outcome<T> = Result<T, Arc<PreviewError>>;
type Flight<T> = Shared<BoxFuture<'static, Outcome<T>>>;

/// Map from key to the one in-flight operation for that key
pub struct SingleFlight<K, T> {
    inflight: Arc<Mutex<HashMap<K, Flight<T>>>>,
}

impl<K, T> SingleFlight<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run `work` for `key` unless a run is already in flight, in which case
    /// wait for that one. Every waiter sees the same outcome.
    pub async fn run<F, Fut>(&self, key: K, work: F) -> PreviewResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = PreviewResult<T>> + Send + 'static,
    {
        let flight = {
            let mut inflight = lock(&self.inflight);
            match inflight.get(&key) {
                Some(existing) => existing.clone(),
                None => {
                    let flight = self.launch(key.clone(), work());
                    inflight.insert(key, flight.clone());
                    flight
                }
            }
        };

        flight.await.map_err(PreviewError::from)
    }

    fn launch<Fut>(&self, key: K, work: Fut) -> Flight<T>
    where
        Fut: Future<Output = PreviewResult<T>> + Send + 'static,
    {
        let guard = Landing {
            inflight: Arc::clone(&self.inflight),
            key,
        };

        // The guard needs the map lock, which `run` holds until the entry is inserted
        let handle = tokio::spawn(async move {
            let _guard = guard;
            work.await.map_err(Arc::new)
        });

        async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(e) => Err(Arc::new(PreviewError::Internal(format!(
                    "deduplicated task failed: {}",
                    e
                )))),
            }
        }
        .boxed()
        .shared()
    }

    /// Whether work for `key` is in flight
    pub fn is_inflight(&self, key: &K) -> bool {
        lock(&self.inflight).contains_key(key)
    }

    /// Keys with work in flight
    pub fn keys(&self) -> Vec<K> {
        lock(&self.inflight).keys().cloned().collect()
    }
}

impl<K, T> Default for SingleFlight<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Removes the key once the work is done, however it ends
struct Landing<K: Eq + Hash, T> {
    inflight: Arc<Mutex<HashMap<K, Flight<T>>>>,
    key: K,
}

impl<K: Eq + Hash, T> Drop for Landing<K, T> {
    fn drop(&mut self) {
        lock(&self.inflight).remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_callers_share_one_run() {
        let flights: Arc<SingleFlight<String, usize>> = Arc::new(SingleFlight::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let flights = Arc::clone(&flights);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                flights
                    .run("abc".to_string(), move || async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(calls.fetch_add(1, Ordering::SeqCst) + 100)
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 100);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!flights.is_inflight(&"abc".to_string()));
    }

    #[tokio::test]
    async fn errors_are_shared_and_key_released() {
        let flights: SingleFlight<&'static str, ()> = SingleFlight::new();

        let err = flights
            .run("k", || async {
                Err(PreviewError::ContainerNotFound("gone".to_string()))
            })
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 404);
        assert!(flights.keys().is_empty());

        // The next call starts fresh work
        flights.run("k", || async { Ok(()) }).await.unwrap();
    }

    #[tokio::test]
    async fn panic_maps_to_internal_error() {
        let flights: SingleFlight<u8, ()> = SingleFlight::new();

        let err = flights
            .run(1, || async {
                if true {
                    panic!("boom");
                }
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err.root(), PreviewError::Internal(_)));
        assert!(!flights.is_inflight(&1));
    }

    #[tokio::test]
    async fn work_finishes_after_caller_is_dropped() {
        let flights: Arc<SingleFlight<u8, ()>> = Arc::new(SingleFlight::new());
        let done = Arc::new(AtomicUsize::new(0));

        let caller = {
            let flights = Arc::clone(&flights);
            let done = Arc::clone(&done);
            tokio::spawn(async move {
                flights
                    .run(7, move || async move {
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        done.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        caller.abort();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert!(!flights.is_inflight(&7));
    }
}
