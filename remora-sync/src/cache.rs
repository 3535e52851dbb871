//! Local cache abstraction.
//!
//! The engine never talks to a storage engine directly; it consumes this
//! contract. [`MemoryCache`] keeps everything in memory and is what the tests
//! (and embedders without persistent storage) use.

use crate::error::SyncResult;
use async_trait::async_trait;
use remora_types::{Criteria, Location, Object, ObjectId};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

/// Persists and retrieves objects by location.
#[async_trait]
pub trait LocalCache: Send + Sync {
    /// Returns cached objects at `location` admitted by `criteria`.
    async fn find(&self, location: &Location, criteria: &Criteria) -> SyncResult<Vec<Object>>;

    /// Inserts or replaces objects. Returns what was stored.
    async fn save(&self, location: &Location, objects: &[Object]) -> SyncResult<Vec<Object>>;

    /// Removes objects by id. Returns the objects that were present.
    async fn remove(&self, location: &Location, objects: &[Object]) -> SyncResult<Vec<Object>>;

    /// Drops everything cached for a schema. Returns the number of objects
    /// removed.
    async fn clean(&self, address: &str, schema: &str) -> SyncResult<usize>;
}

/// In-memory [`LocalCache`].
#[derive(Debug, Default)]
pub struct MemoryCache {
    tables: RwLock<HashMap<Location, BTreeMap<ObjectId, Object>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of cached objects.
    pub async fn len(&self) -> usize {
        self.tables.read().await.values().map(BTreeMap::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Fetches a single object.
    pub async fn get(&self, location: &Location, id: ObjectId) -> Option<Object> {
        self.tables
            .read()
            .await
            .get(location)
            .and_then(|table| table.get(&id))
            .cloned()
    }
}

#[async_trait]
impl LocalCache for MemoryCache {
    async fn find(&self, location: &Location, criteria: &Criteria) -> SyncResult<Vec<Object>> {
        let tables = self.tables.read().await;
        Ok(tables
            .get(location)
            .map(|table| {
                table
                    .values()
                    .filter(|object| criteria.admits(object))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn save(&self, location: &Location, objects: &[Object]) -> SyncResult<Vec<Object>> {
        let mut tables = self.tables.write().await;
        let table = tables.entry(location.clone()).or_default();
        for object in objects {
            table.insert(object.id, object.clone());
        }
        Ok(objects.to_vec())
    }

    async fn remove(&self, location: &Location, objects: &[Object]) -> SyncResult<Vec<Object>> {
        let mut tables = self.tables.write().await;
        let Some(table) = tables.get_mut(location) else {
            return Ok(Vec::new());
        };
        Ok(objects
            .iter()
            .filter_map(|object| table.remove(&object.id))
            .collect())
    }

    async fn clean(&self, address: &str, schema: &str) -> SyncResult<usize> {
        let mut tables = self.tables.write().await;
        let mut removed = 0;
        tables.retain(|location, table| {
            let doomed = location.address == address && location.schema == schema;
            if doomed {
                removed += table.len();
            }
            !doomed
        });
        Ok(removed)
    }
}
