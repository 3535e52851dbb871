//! Sharing of in-flight operations.
//!
//! Concurrent callers asking for the same key await one future instead of
//! issuing duplicate remote calls. The entry is dropped once that future
//! completes, so the next call after completion starts fresh.

use crate::error::SyncResult;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};

type InFlight<T> = Shared<BoxFuture<'static, SyncResult<T>>>;

/// Map of in-flight futures keyed by `K`.
pub(crate) struct Coalescer<K, T: Clone> {
    pending: Mutex<HashMap<K, InFlight<T>>>,
}

impl<K, T> Coalescer<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<K, InFlight<T>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Joins the in-flight future for `key`, or starts one with `make`.
    pub(crate) async fn run<F, Fut>(&self, key: K, make: F) -> SyncResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SyncResult<T>> + Send + 'static,
    {
        let shared = {
            let mut pending = self.pending();
            match pending.get(&key) {
                Some(existing) => existing.clone(),
                None => {
                    let shared = make().boxed().shared();
                    pending.insert(key.clone(), shared.clone());
                    shared
                }
            }
        };

        let result = shared.clone().await;

        let mut pending = self.pending();
        if pending
            .get(&key)
            .is_some_and(|current| current.ptr_eq(&shared))
        {
            pending.remove(&key);
        }
        result
    }

    /// Forgets the in-flight future for `key`; later callers start anew.
    pub(crate) fn cancel(&self, key: &K) -> bool {
        self.pending().remove(key).is_some()
    }

    #[cfg(test)]
    pub(crate) fn is_pending(&self, key: &K) -> bool {
        self.pending().contains_key(key)
    }
}
