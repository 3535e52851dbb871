//! Change notifications pushed by the server (typically over a websocket).

use crate::{Error, Generation, Location, ObjectId, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Ids and generation numbers of changed objects in one table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableChanges {
    pub ids: Vec<ObjectId>,
    pub gns: Vec<Generation>,
}

impl TableChanges {
    /// Builds a change list from parallel id/gn pairs.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (ObjectId, Generation)>) -> Self {
        let (ids, gns) = pairs.into_iter().unzip();
        Self { ids, gns }
    }

    /// Iterates `(id, gn)` pairs. Ids without a matching gn are skipped.
    pub fn pairs(&self) -> impl Iterator<Item = (ObjectId, Generation)> + '_ {
        self.ids.iter().copied().zip(self.gns.iter().copied())
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// `{address, changes}` as received from the push channel. `changes` of
/// `None` means "anything from this address may have changed".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub address: String,
    #[serde(default)]
    pub changes: Option<HashMap<String, TableChanges>>,
}

impl ChangeNotification {
    /// Parses a notification from its JSON text.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Resolves each `schema.table` key into a location on this address.
    pub fn by_location(&self) -> Result<Vec<(Location, &TableChanges)>> {
        let Some(changes) = &self.changes else {
            return Ok(Vec::new());
        };
        let mut resolved = Vec::with_capacity(changes.len());
        for (key, list) in changes {
            if list.ids.len() != list.gns.len() {
                return Err(Error::MismatchedChanges {
                    table: key.clone(),
                    ids: list.ids.len(),
                    gns: list.gns.len(),
                });
            }
            resolved.push((Location::from_table_key(&self.address, key)?, list));
        }
        resolved.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(resolved)
    }
}
