use std::collections::BTreeMap;

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

use super::records::{Collection, Record};

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot is not valid json: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("snapshot must be a json object keyed by collection")]
    NotAnObject,
    #[error("collection {collection} must be an array")]
    NotAnArray { collection: String },
    #[error("invalid record {index} in {collection}: {reason}")]
    InvalidRecord {
        collection: String,
        index: usize,
        reason: String,
    },
}

/// A whole-dataset export: `{ collectionName: [record, ...] }`.
///
/// Collections absent from the file stay absent here, which lets
/// [`super::StoreEngine::import_all`] leave them untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncSnapshot {
    collections: BTreeMap<Collection, Vec<Record>>,
}

impl SyncSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, collection: Collection, records: Vec<Record>) {
        self.collections.insert(collection, records);
    }

    pub fn get(&self, collection: Collection) -> Option<&[Record]> {
        self.collections.get(&collection).map(Vec::as_slice)
    }

    pub fn contains(&self, collection: Collection) -> bool {
        self.collections.contains_key(&collection)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Collection, &[Record])> {
        self.collections
            .iter()
            .map(|(collection, records)| (*collection, records.as_slice()))
    }

    pub fn record_count(&self) -> usize {
        self.collections.values().map(Vec::len).sum()
    }

    /// Parse and validate a snapshot. Any malformed collection rejects the
    /// whole document.
    pub fn from_json(raw: &str) -> Result<Self, SnapshotError> {
        let value: Value = serde_json::from_str(raw)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, SnapshotError> {
        let object = match value {
            Value::Object(object) => object,
            _ => return Err(SnapshotError::NotAnObject),
        };

        let mut snapshot = SyncSnapshot::new();
        for (key, entries) in object {
            let Some(collection) = Collection::ALL.into_iter().find(|c| c.name() == key) else {
                warn!(
                    target: "libretto",
                    event = "snapshot_unknown_collection",
                    collection = %key
                );
                continue;
            };
            let entries = match entries {
                Value::Array(entries) => entries,
                Value::Null => Vec::new(),
                _ => return Err(SnapshotError::NotAnArray { collection: key }),
            };
            let mut records = Vec::with_capacity(entries.len());
            for (index, entry) in entries.into_iter().enumerate() {
                let record = Record::from_value(collection, entry).map_err(|err| {
                    SnapshotError::InvalidRecord {
                        collection: key.clone(),
                        index,
                        reason: err.to_string(),
                    }
                })?;
                records.push(record);
            }
            snapshot.insert(collection, records);
        }
        Ok(snapshot)
    }

    pub fn to_value(&self) -> Value {
        let mut object = Map::new();
        for (collection, records) in &self.collections {
            object.insert(
                collection.name().to_string(),
                Value::Array(records.iter().map(Record::to_value).collect()),
            );
        }
        Value::Object(object)
    }

    /// Pretty-printed UTF-8 form used for the sync file and backups.
    pub fn to_json_pretty(&self) -> Result<String, SnapshotError> {
        Ok(serde_json::to_string_pretty(&self.to_value())?)
    }
}
