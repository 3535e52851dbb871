//! Debounced background refill of invalidated searches.

use crate::search::SearchRequest;
use remora_types::Location;
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Runs a prefetch job once invalidations have been quiet for the debounce
/// period. Scheduling again during the quiet period restarts it.
pub(crate) struct PrefetchScheduler {
    debounce: Duration,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl PrefetchScheduler {
    pub(crate) fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            pending: Mutex::new(None),
        }
    }

    fn pending(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn schedule<F, Fut>(&self, job: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut pending = self.pending();
        if let Some(previous) = pending.take() {
            previous.abort();
        }
        let debounce = self.debounce;
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            // Detached so a later schedule cannot abort a running job.
            tokio::spawn(job());
        }));
    }

    /// Whether a job is waiting out the debounce period.
    pub(crate) fn is_scheduled(&self) -> bool {
        self.pending()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for PrefetchScheduler {
    fn drop(&mut self) {
        if let Some(handle) = self.pending().take() {
            handle.abort();
        }
    }
}

/// Picks the searches worth refreshing: dirty, idle, remote, and one per
/// `(requester, location, criteria keys)`. `searches` is ordered most
/// recently used first, and that one wins.
pub(crate) fn select(searches: &[SearchRequest]) -> Vec<u64> {
    let mut seen: HashSet<(String, Location, Vec<String>)> = HashSet::new();
    searches
        .iter()
        .filter(|search| search.dirty && !search.updating && !search.location.is_local())
        .filter(|search| {
            let requester = search.by.iter().next().cloned().unwrap_or_default();
            let shape = search
                .criteria
                .shape()
                .into_iter()
                .map(str::to_string)
                .collect();
            seen.insert((requester, search.location.clone(), shape))
        })
        .map(|search| search.id)
        .collect()
}
