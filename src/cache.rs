//! Single-flight refresh with one queued retry.
//!
//! Several derived values in the platform are expensive to recompute and may
//! be requested by many tasks at once: the relation map after a schema
//! change, app health probe results, app credential lookups. `Coalesced`
//! guarantees that at most one recomputation runs at a time, that an
//! invalidation arriving mid-refresh queues exactly one further pass, and
//! that no caller observes a value older than the invalidation it saw.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::Result;

struct Cached<T> {
    value: T,
    at: Instant,
}

struct State<T> {
    cached: Option<Cached<T>>,
    /// Bumped on every invalidation.
    dirty_epoch: u64,
    /// The dirty epoch the cached value was computed against.
    value_epoch: u64,
    refreshing: bool,
}

pub struct Coalesced<T> {
    state: Mutex<State<T>>,
    notify: Notify,
    ttl: Option<Duration>,
}

impl<T: Clone> Coalesced<T> {
    #[must_use]
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            state: Mutex::new(State {
                cached: None,
                dirty_epoch: 0,
                value_epoch: 0,
                refreshing: false,
            }),
            notify: Notify::new(),
            ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Marks the cached value stale. The next `get_or_refresh` recomputes;
    /// if a recomputation is already in flight, exactly one more pass runs
    /// after it completes.
    pub fn invalidate(&self) {
        self.lock().dirty_epoch += 1;
    }

    /// Returns the cached value if it is current, otherwise recomputes it.
    /// Concurrent callers share a single in-flight recomputation.
    pub async fn get_or_refresh<F, Fut>(&self, refresh: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        loop {
            let target_epoch;
            // Whether another caller's refresh is already in flight; the
            // guard must leave scope before the await below so the future
            // stays `Send`.
            let in_flight;
            {
                let mut st = self.lock();
                if let Some(cached) = &st.cached {
                    let current = st.value_epoch >= st.dirty_epoch;
                    let live = self.ttl.is_none_or(|ttl| cached.at.elapsed() < ttl);
                    if current && live {
                        return Ok(cached.value.clone());
                    }
                }
                in_flight = st.refreshing;
                if !in_flight {
                    st.refreshing = true;
                }
                target_epoch = st.dirty_epoch;
            }
            if in_flight {
                let notified = self.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                // The refresher may have finished between unlock and
                // enable; re-check before parking.
                let still_refreshing = self.lock().refreshing;
                if !still_refreshing {
                    continue;
                }
                notified.await;
                continue;
            }

            let result = refresh().await;

            let mut st = self.lock();
            st.refreshing = false;
            match result {
                Ok(value) => {
                    st.cached = Some(Cached {
                        value,
                        at: Instant::now(),
                    });
                    st.value_epoch = target_epoch;
                    drop(st);
                    self.notify.notify_waiters();
                    // Loop: if an invalidation landed mid-refresh, this
                    // caller runs the single queued second pass.
                }
                Err(e) => {
                    drop(st);
                    self.notify.notify_waiters();
                    return Err(e);
                }
            }
        }
    }
}

/// Per-key coalesced cells, used where the derived value is keyed (app
/// credential lookups). Cells are created lazily and share one TTL.
pub struct CoalescedMap<K, T> {
    cells: Mutex<HashMap<K, Arc<Coalesced<T>>>>,
    ttl: Option<Duration>,
}

impl<K: Eq + Hash + Clone, T: Clone> CoalescedMap<K, T> {
    #[must_use]
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            cells: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn cell(&self, key: &K) -> Arc<Coalesced<T>> {
        let mut cells = self.cells.lock().unwrap_or_else(|e| e.into_inner());
        cells
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Coalesced::new(self.ttl)))
            .clone()
    }

    pub fn invalidate(&self, key: &K) {
        let cells = self.cells.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(cell) = cells.get(key) {
            cell.invalidate();
        }
    }

    pub fn invalidate_all(&self) {
        let cells = self.cells.lock().unwrap_or_else(|e| e.into_inner());
        for cell in cells.values() {
            cell.invalidate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_caches_across_calls() {
        let cell = Coalesced::new(None);
        let runs = AtomicUsize::new(0);
        for _ in 0..5 {
            let v = cell
                .get_or_refresh(|| async {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(42u32)
                })
                .await
                .unwrap();
            assert_eq!(v, 42);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_recompute() {
        let cell = Coalesced::new(None);
        let runs = AtomicUsize::new(0);
        let refresh = || async {
            Ok(runs.fetch_add(1, Ordering::SeqCst))
        };
        assert_eq!(cell.get_or_refresh(refresh).await.unwrap(), 0);
        cell.invalidate();
        assert_eq!(cell.get_or_refresh(refresh).await.unwrap(), 1);
        assert_eq!(cell.get_or_refresh(refresh).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_flight() {
        let cell = Arc::new(Coalesced::new(None));
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cell = cell.clone();
            let runs = runs.clone();
            handles.push(tokio::spawn(async move {
                cell.get_or_refresh(|| {
                    let runs = runs.clone();
                    async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok(7u32)
                    }
                })
                .await
                .unwrap()
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), 7);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidation_storm_runs_at_most_two_passes() {
        let cell = Arc::new(Coalesced::new(None));
        let runs = Arc::new(AtomicUsize::new(0));

        // Seed the cache.
        let seed_runs = runs.clone();
        cell.get_or_refresh(|| {
            let runs = seed_runs.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(0usize)
            }
        })
        .await
        .unwrap();

        // N invalidations then N concurrent callers: at most two further
        // recomputations, and every caller sees a post-invalidation value.
        for _ in 0..8 {
            cell.invalidate();
        }
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cell = cell.clone();
            let runs = runs.clone();
            handles.push(tokio::spawn(async move {
                cell.get_or_refresh(|| {
                    let runs = runs.clone();
                    async move {
                        let n = runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        Ok(n)
                    }
                })
                .await
                .unwrap()
            }));
        }
        for h in handles {
            let v = h.await.unwrap();
            assert!(v >= 1, "caller observed the pre-invalidation value");
        }
        assert!(
            runs.load(Ordering::SeqCst) <= 3,
            "expected at most seed + 2 recomputations, got {}",
            runs.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        tokio::time::pause();
        let cell = Coalesced::new(Some(Duration::from_secs(30)));
        let runs = AtomicUsize::new(0);
        let refresh = || async {
            Ok(runs.fetch_add(1, Ordering::SeqCst))
        };
        assert_eq!(cell.get_or_refresh(refresh).await.unwrap(), 0);
        assert_eq!(cell.get_or_refresh(refresh).await.unwrap(), 0);
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(cell.get_or_refresh(refresh).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_error_is_not_cached() {
        let cell = Coalesced::new(None);
        let runs = AtomicUsize::new(0);
        let fail = cell
            .get_or_refresh(|| async {
                runs.fetch_add(1, Ordering::SeqCst);
                Err::<u32, _>(crate::error::Error::NotFound)
            })
            .await;
        assert!(fail.is_err());
        let ok = cell
            .get_or_refresh(|| async {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(1u32)
            })
            .await
            .unwrap();
        assert_eq!(ok, 1);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}
