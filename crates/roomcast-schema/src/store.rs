//! Entity records held in room state, one collection per registered kind.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::container::SyncValue;
use crate::{CompiledEntityType, EntityRegistry, SchemaError};

/// Records of one entity kind, keyed by owner id.
#[derive(Debug)]
struct EntityCollection {
    ty: Arc<CompiledEntityType>,
    records: IndexMap<String, SyncValue>,
    /// Last executor version applied per owner.
    applied: HashMap<String, u64>,
    dirty: IndexSet<String>,
    removed: IndexSet<String>,
}

impl EntityCollection {
    fn new(ty: Arc<CompiledEntityType>) -> Self {
        Self {
            ty,
            records: IndexMap::new(),
            applied: HashMap::new(),
            dirty: IndexSet::new(),
            removed: IndexSet::new(),
        }
    }

    fn write(&mut self, owner: &str, raw: &Value) -> (bool, &mut SyncValue) {
        let ty = Arc::clone(&self.ty);
        let mut created = false;
        let record = self.records.entry(owner.to_string()).or_insert_with(|| {
            created = true;
            ty.create()
        });
        let changed = ty.assign(record, raw) || created;
        (changed, record)
    }

    fn mark_dirty(&mut self, owner: &str) {
        self.removed.shift_remove(owner);
        self.dirty.insert(owner.to_string());
    }
}

/// Only the records that changed since the previous patch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityPatch {
    /// `kind → owner → current JSON` for created or updated records.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub changed: IndexMap<String, IndexMap<String, Value>>,
    /// `kind → owners` whose records were removed.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub removed: IndexMap<String, Vec<String>>,
}

impl EntityPatch {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }
}

/// Every entity collection of a room.
#[derive(Debug)]
pub struct EntityStore {
    registry: Arc<EntityRegistry>,
    collections: IndexMap<String, EntityCollection>,
}

impl EntityStore {
    /// Creates an empty collection for each kind in `registry`.
    pub fn new(registry: Arc<EntityRegistry>) -> Self {
        let collections = registry
            .kinds()
            .filter_map(|kind| {
                let ty = registry.get(kind)?;
                Some((kind.to_string(), EntityCollection::new(Arc::clone(ty))))
            })
            .collect();
        Self {
            registry,
            collections,
        }
    }

    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.registry
    }

    /// Applies one executor record.
    ///
    /// A record whose `version` equals the last applied version for that
    /// owner is skipped, so replaying a batch is a no-op. Versioned kinds
    /// also expose `version` as the record's `_netVersion`.
    ///
    /// # Errors
    /// [`SchemaError::UnknownKind`] if `kind` was never registered.
    pub fn apply(
        &mut self,
        kind: &str,
        owner: &str,
        version: u64,
        raw: &Value,
    ) -> Result<bool, SchemaError> {
        let collection = self
            .collections
            .get_mut(kind)
            .ok_or_else(|| SchemaError::UnknownKind(kind.to_string()))?;
        if collection.applied.get(owner) == Some(&version) {
            tracing::trace!(kind, owner, version, "entity version unchanged, skipping");
            return Ok(false);
        }

        let versioned = collection.ty.is_versioned();
        let (mut changed, record) = collection.write(owner, raw);
        if versioned {
            if let SyncValue::Object(object) = record {
                changed |= object.net_version() != Some(version);
                object.set_net_version(version);
            }
        }
        collection.applied.insert(owner.to_string(), version);
        if changed {
            collection.mark_dirty(owner);
        }
        Ok(changed)
    }

    /// Writes a record directly, without version bookkeeping.
    pub fn set(&mut self, kind: &str, owner: &str, raw: &Value) -> Result<bool, SchemaError> {
        let collection = self
            .collections
            .get_mut(kind)
            .ok_or_else(|| SchemaError::UnknownKind(kind.to_string()))?;
        let (changed, _) = collection.write(owner, raw);
        if changed {
            collection.mark_dirty(owner);
        }
        Ok(changed)
    }

    /// Removes a record. Returns `false` if it did not exist.
    pub fn remove(&mut self, kind: &str, owner: &str) -> Result<bool, SchemaError> {
        let collection = self
            .collections
            .get_mut(kind)
            .ok_or_else(|| SchemaError::UnknownKind(kind.to_string()))?;
        collection.applied.remove(owner);
        if collection.records.shift_remove(owner).is_none() {
            return Ok(false);
        }
        collection.dirty.shift_remove(owner);
        collection.removed.insert(owner.to_string());
        Ok(true)
    }

    /// The current JSON value of one record.
    pub fn entity(&self, kind: &str, owner: &str) -> Option<Value> {
        self.collections
            .get(kind)?
            .records
            .get(owner)
            .map(SyncValue::to_json)
    }

    /// Number of records held for `kind`.
    pub fn count(&self, kind: &str) -> usize {
        self.collections.get(kind).map_or(0, |c| c.records.len())
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.collections.keys().map(String::as_str)
    }

    /// Full `kind → owner → record` view, used for snapshots.
    pub fn to_json(&self) -> Value {
        let kinds: Map<String, Value> = self
            .collections
            .iter()
            .map(|(kind, collection)| {
                let records: Map<String, Value> = collection
                    .records
                    .iter()
                    .map(|(owner, record)| (owner.clone(), record.to_json()))
                    .collect();
                (kind.clone(), Value::Object(records))
            })
            .collect();
        Value::Object(kinds)
    }

    /// Drains the change tracking into a patch.
    pub fn take_patch(&mut self) -> EntityPatch {
        let mut patch = EntityPatch::default();
        for (kind, collection) in &mut self.collections {
            if !collection.dirty.is_empty() {
                let changed: IndexMap<String, Value> = collection
                    .dirty
                    .drain(..)
                    .filter_map(|owner| {
                        let json = collection.records.get(&owner)?.to_json();
                        Some((owner, json))
                    })
                    .collect();
                patch.changed.insert(kind.clone(), changed);
            }
            if !collection.removed.is_empty() {
                patch
                    .removed
                    .insert(kind.clone(), collection.removed.drain(..).collect());
            }
        }
        patch
    }
}
