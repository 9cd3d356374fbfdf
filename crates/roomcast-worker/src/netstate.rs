//! Executor-side change detection for published state.

use std::collections::HashSet;

use indexmap::IndexMap;
use roomcast_protocol::{EntityDelta, EntityDeltaBatch, SessionId};
use serde_json::Value;

use crate::NetState;

#[derive(Debug)]
struct CachedRecord {
    version: u64,
    last: Value,
}

/// Remembers the last raw state shipped for every record so a pull only
/// carries what changed.
///
/// Each `(kind, owner)` record has a version that starts at 1 when the
/// record is first seen and goes up by one every time its raw state
/// differs from the previous pull. Records that vanish are reported once
/// in `removed` and forgotten; if they come back they start over.
#[derive(Debug, Default)]
pub struct NetStateCache {
    records: IndexMap<String, IndexMap<String, CachedRecord>>,
    players: IndexMap<SessionId, Value>,
}

impl NetStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Diffs a full pull against the previous one.
    pub fn diff(&mut self, state: NetState, players: &IndexMap<SessionId, Value>) -> EntityDeltaBatch {
        let mut batch = EntityDeltaBatch::default();

        for (kind, records) in state {
            let cached = self.records.entry(kind.clone()).or_default();
            let mut changed = Vec::new();

            for (owner, raw) in &records {
                match cached.get_mut(owner) {
                    Some(record) if record.last == *raw => {}
                    Some(record) => {
                        record.version += 1;
                        record.last = raw.clone();
                        changed.push(delta(owner, record));
                    }
                    None => {
                        let record = CachedRecord {
                            version: 1,
                            last: raw.clone(),
                        };
                        changed.push(delta(owner, &record));
                        cached.insert(owner.clone(), record);
                    }
                }
            }

            let gone: Vec<String> = cached
                .keys()
                .filter(|owner| !records.contains_key(*owner))
                .cloned()
                .collect();
            for owner in &gone {
                cached.shift_remove(owner);
            }

            if !changed.is_empty() {
                batch.entities.insert(kind.clone(), changed);
            }
            if !gone.is_empty() {
                batch.removed.insert(kind, gone);
            }
        }

        for (session_id, raw) in players {
            if self.players.get(session_id) != Some(raw) {
                self.players.insert(session_id.clone(), raw.clone());
                batch.players.insert(session_id.clone(), raw.clone());
            }
        }
        let present: HashSet<&SessionId> = players.keys().collect();
        self.players.retain(|id, _| present.contains(id));

        batch
    }

    /// Current version of a record, if it has been shipped.
    pub fn version(&self, kind: &str, owner: &str) -> Option<u64> {
        self.records.get(kind)?.get(owner).map(|r| r.version)
    }

    /// Forgets a player so their next pull is shipped in full.
    pub fn forget_player(&mut self, session_id: &SessionId) {
        self.players.shift_remove(session_id);
    }
}

fn delta(owner: &str, record: &CachedRecord) -> EntityDelta {
    EntityDelta {
        owner_id: owner.to_string(),
        version: record.version,
        state: record.last.clone(),
    }
}
