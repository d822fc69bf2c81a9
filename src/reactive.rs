//! Dependency bookkeeping for computed fields.
//!
//! Every computed field is addressed by a packed `(record, field)` key.
//! Reads performed during a computation register edges from the consumer to
//! what it read; a write to any field marks its transitive consumers dirty.
//! Recomputation itself is driven by the graph on read, so multiple writes
//! between reads cost a single recomputation.

use std::collections::HashMap;

use roaring::RoaringTreemap;

use crate::graph::{Handle, OtherHasher};
use crate::schema::FieldId;

const FIELD_BITS: u32 = 16;

// Handles are generated sequentially, so the 48-bit budget is not a
// practical limit; the assert documents the packing contract.
pub(crate) fn pack(record: Handle, field: FieldId) -> u64 {
    debug_assert!(record < (1 << (64 - FIELD_BITS)));
    (record << FIELD_BITS) | field as u64
}

#[cfg(test)]
pub(crate) fn unpack(key: u64) -> (Handle, FieldId) {
    (key >> FIELD_BITS, (key & ((1 << FIELD_BITS) - 1)) as FieldId)
}

/// Why a computation could not start.
pub(crate) enum BeginFault {
    /// The field is already being computed further up the stack.
    Cycle,
    /// The nesting depth limit was hit.
    Depth,
}

#[derive(Debug, Default)]
pub(crate) struct Tracker {
    /// Computed-field keys whose cached value may be out of date.
    dirty: RoaringTreemap,
    /// Field key -> computed-field keys that read it last time around.
    dependents: HashMap<u64, RoaringTreemap, OtherHasher>,
    /// Computed-field key -> field keys it read last time around.
    sources: HashMap<u64, Vec<u64>, OtherHasher>,
    /// Stack of computations currently in flight.
    active: Vec<u64>,
}

impl Tracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_dirty(&self, key: u64) -> bool {
        self.dirty.contains(key)
    }

    pub fn mark_dirty(&mut self, key: u64) {
        self.dirty.insert(key);
    }

    pub fn clean(&mut self, key: u64) {
        self.dirty.remove(key);
    }

    /// Mark every computed field that transitively depends on `key` dirty.
    /// `key` itself is not marked; a plain field never needs recomputation
    /// and a computed one is marked by its own sources changing.
    ///
    /// A consumer found already dirty is not descended into: its own
    /// dependents were marked when it turned dirty, and nothing has cleaned
    /// it since.
    pub fn invalidate(&mut self, key: u64) {
        let mut queue = vec![key];
        while let Some(current) = queue.pop() {
            let Some(consumers) = self.dependents.get(&current) else { continue };
            let fresh: Vec<u64> =
                consumers.iter().filter(|c| !self.dirty.contains(*c)).collect();
            for consumer in fresh {
                self.dirty.insert(consumer);
                queue.push(consumer);
            }
        }
    }

    /// Record that `consumer` read `dep` during its current computation.
    pub fn note(&mut self, consumer: u64, dep: u64) {
        if consumer == dep {
            return;
        }
        self.dependents.entry(dep).or_default().insert(consumer);
        let sources = self.sources.entry(consumer).or_default();
        if !sources.contains(&dep) {
            sources.push(dep);
        }
    }

    /// Drop every edge out of `consumer`, ahead of a fresh computation.
    pub fn retract(&mut self, consumer: u64) {
        let Some(sources) = self.sources.remove(&consumer) else { return };
        for dep in sources {
            if let Some(consumers) = self.dependents.get_mut(&dep) {
                consumers.remove(consumer);
                if consumers.is_empty() {
                    self.dependents.remove(&dep);
                }
            }
        }
    }

    pub fn begin(&mut self, key: u64, depth_cap: usize) -> Result<(), BeginFault> {
        if self.active.contains(&key) {
            return Err(BeginFault::Cycle);
        }
        if self.active.len() >= depth_cap {
            return Err(BeginFault::Depth);
        }
        self.active.push(key);
        Ok(())
    }

    pub fn finish(&mut self, key: u64) {
        if let Some(pos) = self.active.iter().rposition(|k| *k == key) {
            self.active.remove(pos);
        }
    }

    /// Forget everything about a destroyed record's fields. Stale entries in
    /// other consumers' source lists are tolerated; they fall away on their
    /// next retract.
    pub fn forget_record(&mut self, record: Handle, field_count: usize) {
        for field in 0..field_count {
            let key = pack(record, field as FieldId);
            self.dirty.remove(key);
            self.retract(key);
            self.dependents.remove(&key);
        }
    }
}
