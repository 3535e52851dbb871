//! Temporary ↔ permanent id pairs.

use remora_types::{Location, ObjectId};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pair {
    temporary: ObjectId,
    permanent: ObjectId,
}

/// Remembers which permanent id the server issued for each temporary id, so
/// callers still holding a temporary id can find the stored object.
#[derive(Debug, Default, Clone)]
pub struct IdentityMap {
    pairs: HashMap<Location, Vec<Pair>>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `temporary` became `permanent` at `location`.
    pub fn record(&mut self, location: &Location, temporary: ObjectId, permanent: ObjectId) {
        let list = self.pairs.entry(location.clone()).or_default();
        match list.iter_mut().find(|p| p.temporary == temporary) {
            Some(pair) => pair.permanent = permanent,
            None => list.push(Pair {
                temporary,
                permanent,
            }),
        }
    }

    pub fn permanent_for(&self, location: &Location, temporary: ObjectId) -> Option<ObjectId> {
        self.pairs
            .get(location)?
            .iter()
            .find(|p| p.temporary == temporary)
            .map(|p| p.permanent)
    }

    pub fn temporary_for(&self, location: &Location, permanent: ObjectId) -> Option<ObjectId> {
        self.pairs
            .get(location)?
            .iter()
            .find(|p| p.permanent == permanent)
            .map(|p| p.temporary)
    }

    /// Maps `id` to its permanent counterpart when it is a known temporary id.
    pub fn resolve(&self, location: &Location, id: ObjectId) -> ObjectId {
        if id.is_temporary() {
            self.permanent_for(location, id).unwrap_or(id)
        } else {
            id
        }
    }

    pub fn len(&self) -> usize {
        self.pairs.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
