//! Search requests: one logical query, its freshness, and its results.

use crate::change::ChangeEntry;
use crate::transport::Discovery;
use remora_types::{Criteria, Generation, Location, Object, ObjectId};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// How well a search's local results answer it, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SearchStatus {
    /// Expected count reached, recently fetched, not invalidated.
    Complete,
    /// Expected count reached but old, invalidated, or never confirmed.
    Stale,
    /// Short of the expected count but at or above the minimum.
    Incomplete,
    /// Below the minimum.
    Insufficient,
}

/// When `find` waits for the server instead of answering from the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum BlockingPolicy {
    /// Always answer locally; refresh in the background.
    Never,
    /// Wait only when the local results are insufficient.
    #[default]
    Insufficient,
    /// Wait when incomplete or insufficient.
    Incomplete,
    /// Wait unless complete.
    Stale,
}

impl BlockingPolicy {
    /// Whether a search in `status` must wait for the remote round trip.
    pub fn blocks(self, status: SearchStatus) -> bool {
        match self {
            BlockingPolicy::Never => false,
            BlockingPolicy::Insufficient => status >= SearchStatus::Insufficient,
            BlockingPolicy::Incomplete => status >= SearchStatus::Incomplete,
            BlockingPolicy::Stale => status >= SearchStatus::Stale,
        }
    }
}

/// Parameters of a `find` call.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub location: Location,
    pub criteria: Criteria,
    /// Objects needed before the local answer counts as usable. Defaults to 1.
    pub minimum: Option<usize>,
    pub blocking: BlockingPolicy,
    /// Fail with [`crate::SyncError::NotFound`] unless the server can satisfy
    /// the query.
    pub required: bool,
    /// Layer queued and in-flight writes onto the answer.
    pub include_uncommitted: bool,
    /// Tag of the component asking; used to de-duplicate prefetches.
    pub by: Option<String>,
}

impl Query {
    pub fn new(location: Location, criteria: Criteria) -> Self {
        Self {
            location,
            criteria,
            minimum: None,
            blocking: BlockingPolicy::default(),
            required: false,
            include_uncommitted: false,
            by: None,
        }
    }

    #[must_use]
    pub fn minimum(mut self, minimum: usize) -> Self {
        self.minimum = Some(minimum);
        self
    }

    #[must_use]
    pub fn blocking(mut self, blocking: BlockingPolicy) -> Self {
        self.blocking = blocking;
        self
    }

    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    #[must_use]
    pub fn include_uncommitted(mut self) -> Self {
        self.include_uncommitted = true;
        self
    }

    #[must_use]
    pub fn by(mut self, tag: impl Into<String>) -> Self {
        self.by = Some(tag.into());
        self
    }
}

/// What a discovery says must change locally.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchDiff {
    /// Ids missing locally or held at a different generation.
    pub fetch: Vec<ObjectId>,
    /// Ids held locally that the server no longer lists.
    pub evict: Vec<ObjectId>,
}

impl SearchDiff {
    pub fn is_empty(&self) -> bool {
        self.fetch.is_empty() && self.evict.is_empty()
    }
}

/// One remembered query and its current answer.
///
/// `results` is kept sorted by id and is replaced, never mutated, so a
/// caller holding the previous `Arc` can tell by pointer whether anything
/// changed.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub id: u64,
    pub location: Location,
    pub criteria: Criteria,
    pub results: Arc<Vec<Object>>,
    /// Server-side cardinality from the last discovery.
    pub expected: Option<usize>,
    pub minimum: Option<usize>,
    pub blocking: BlockingPolicy,
    pub required: bool,
    pub started_at: Option<Instant>,
    pub finished_at: Option<Instant>,
    pub dirty: bool,
    pub updating: bool,
    pub by: BTreeSet<String>,
    /// Whether the local cache has been consulted yet.
    pub local_loaded: bool,
}

impl SearchRequest {
    pub fn new(id: u64, query: &Query) -> Self {
        Self {
            id,
            location: query.location.clone(),
            criteria: query.criteria.clone(),
            results: Arc::new(Vec::new()),
            expected: None,
            minimum: query.minimum,
            blocking: query.blocking,
            required: query.required,
            started_at: None,
            finished_at: None,
            dirty: false,
            updating: false,
            by: query.by.iter().cloned().collect(),
            local_loaded: false,
        }
    }

    /// Whether this search answers `query`.
    pub fn answers(&self, query: &Query) -> bool {
        self.location == query.location && self.criteria == query.criteria
    }

    /// Takes over the latest caller's parameters.
    pub fn adopt(&mut self, query: &Query) {
        self.minimum = query.minimum;
        self.blocking = query.blocking;
        self.required = query.required;
        if let Some(tag) = &query.by {
            self.by.insert(tag.clone());
        }
    }

    /// Expected cardinality: last discovery count, else the number of
    /// explicitly named ids.
    pub fn expected_count(&self) -> Option<usize> {
        self.expected
            .or_else(|| self.criteria.explicit_ids().map(|ids| ids.len()))
    }

    pub fn is_fresh(&self, now: Instant, refresh_interval: Duration) -> bool {
        self.finished_at
            .is_some_and(|finished| now.saturating_duration_since(finished) < refresh_interval)
    }

    pub fn classify(&self, now: Instant, refresh_interval: Duration) -> SearchStatus {
        let count = self.results.len();
        let expected = self.expected_count();
        if expected.is_some_and(|expected| count >= expected) {
            if self.is_fresh(now, refresh_interval) && !self.dirty {
                return SearchStatus::Complete;
            }
            return SearchStatus::Stale;
        }
        let minimum = self
            .minimum
            .unwrap_or(1)
            .min(expected.unwrap_or(usize::MAX));
        if count >= minimum {
            SearchStatus::Incomplete
        } else {
            SearchStatus::Insufficient
        }
    }

    /// Whether a `required` caller may accept the results: the expected
    /// count is met and every explicitly named id is present.
    pub fn is_satisfied(&self, now: Instant, refresh_interval: Duration) -> bool {
        self.classify(now, refresh_interval) <= SearchStatus::Stale
            && self
                .criteria
                .explicit_ids()
                .is_none_or(|ids| ids.iter().all(|id| self.contains(*id)))
    }

    /// Whether a result set of this search holds `id`.
    pub fn contains(&self, id: ObjectId) -> bool {
        self.position(id).is_ok()
    }

    /// Generation held locally for `id`.
    pub fn generation_of(&self, id: ObjectId) -> Option<Generation> {
        self.position(id)
            .ok()
            .and_then(|index| self.results[index].gn)
    }

    fn position(&self, id: ObjectId) -> Result<usize, usize> {
        self.results.binary_search_by_key(&id, |object| object.id)
    }

    /// Compares the local results with a discovery.
    pub fn diff(&self, discovery: &Discovery) -> SearchDiff {
        let held: HashMap<ObjectId, Option<Generation>> = self
            .results
            .iter()
            .map(|object| (object.id, object.gn))
            .collect();
        let listed: HashSet<ObjectId> = discovery.ids.iter().copied().collect();
        let generations = discovery.generations();

        let fetch = discovery
            .ids
            .iter()
            .copied()
            .filter(|id| held.get(id).copied().flatten() != generations.get(id).copied())
            .collect();
        let evict = self
            .results
            .iter()
            .map(|object| object.id)
            .filter(|id| !listed.contains(id))
            .collect();
        SearchDiff { fetch, evict }
    }

    /// Rebuilds the results from a discovery and the objects retrieved for
    /// it. Objects the retrieval did not return keep their local copy.
    /// Returns true if the results changed.
    pub fn merge_remote(&mut self, discovery: &Discovery, retrieved: &[Object]) -> bool {
        let mut available: HashMap<ObjectId, &Object> =
            self.results.iter().map(|object| (object.id, object)).collect();
        for object in retrieved {
            available.insert(object.id, object);
        }
        let mut merged: Vec<Object> = discovery
            .ids
            .iter()
            .filter_map(|id| available.get(id).map(|object| (*object).clone()))
            .collect();
        merged.sort_by_key(|object| object.id);
        merged.dedup_by_key(|object| object.id);

        self.expected = Some(discovery.len());
        self.replace(merged)
    }

    /// Replaces the results with what the local cache holds.
    pub fn load_local(&mut self, mut objects: Vec<Object>) -> bool {
        objects.sort_by_key(|object| object.id);
        objects.dedup_by_key(|object| object.id);
        self.local_loaded = true;
        self.replace(objects)
    }

    /// Patches the results after objects were stored. Objects the criteria
    /// admit are upserted; objects they reject are evicted; undecidable
    /// objects already present are refreshed and the search is dirtied.
    pub fn apply_saved(&mut self, objects: &[Object]) -> bool {
        let mut results = self.results.as_ref().clone();
        let mut delta: isize = 0;
        for object in objects {
            let index = results.binary_search_by_key(&object.id, |o| o.id);
            match (self.criteria.matches(object), index) {
                (Some(true), Ok(index)) => results[index] = object.clone(),
                (Some(true), Err(index)) => {
                    results.insert(index, object.clone());
                    delta += 1;
                }
                (Some(false), Ok(index)) => {
                    results.remove(index);
                    delta -= 1;
                }
                (Some(false), Err(_)) => {}
                (None, Ok(index)) => {
                    results[index] = object.clone();
                    self.dirty = true;
                }
                (None, Err(_)) => self.dirty = true,
            }
        }
        self.shift_expected(delta);
        self.replace(results)
    }

    /// Evicts removed objects. Unlike [`SearchRequest::apply_saved`] this
    /// never inserts.
    pub fn apply_removed(&mut self, ids: &[ObjectId]) -> bool {
        let doomed: HashSet<ObjectId> = ids.iter().copied().collect();
        let results: Vec<Object> = self
            .results
            .iter()
            .filter(|object| !doomed.contains(&object.id))
            .cloned()
            .collect();
        let removed = self.results.len() - results.len();
        self.shift_expected(-(removed as isize));
        self.replace(results)
    }

    /// Drops everything learned so far, as after a schema purge.
    pub fn reset(&mut self) {
        self.results = Arc::new(Vec::new());
        self.expected = None;
        self.finished_at = None;
        self.dirty = true;
        self.local_loaded = false;
    }

    /// The results with queued and in-flight writes layered on top, as a
    /// new array. Entries are applied oldest first.
    pub fn with_uncommitted<'a>(
        &self,
        entries: impl IntoIterator<Item = &'a ChangeEntry>,
    ) -> Arc<Vec<Object>> {
        let mut layered: Option<Vec<Object>> = None;
        for entry in entries {
            let results = layered.get_or_insert_with(|| self.results.as_ref().clone());
            let index = results.binary_search_by_key(&entry.object.id, |o| o.id);
            match (entry.removed, index) {
                (true, Ok(index)) => {
                    results.remove(index);
                }
                (true, Err(_)) => {}
                (false, index) => {
                    let admitted = self.criteria.admits(&entry.object);
                    match (admitted, index) {
                        (true, Ok(index)) => results[index] = entry.object.clone(),
                        (true, Err(index)) => results.insert(index, entry.object.clone()),
                        (false, Ok(index)) => {
                            results.remove(index);
                        }
                        (false, Err(_)) => {}
                    }
                }
            }
        }
        match layered {
            Some(results) => Arc::new(results),
            None => self.results.clone(),
        }
    }

    fn shift_expected(&mut self, delta: isize) {
        if let Some(expected) = self.expected.as_mut() {
            *expected = expected.saturating_add_signed(delta);
        }
    }

    fn replace(&mut self, results: Vec<Object>) -> bool {
        if *self.results == results {
            return false;
        }
        self.results = Arc::new(results);
        true
    }
}
